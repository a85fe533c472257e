use anyhow::{bail, Result};
use bitvec::prelude::*;

use crate::common::model::rnn::HiddenState;
use crate::common::runtime::evaluation::EpisodeStats;
use crate::env::Diagnostics;

/// One environment step for every actor (`agent * num_envs + env`).
#[derive(Clone, Debug)]
pub struct Transition {
    /// Whole-episode flag of the actor's environment.
    pub episode_done: Vec<bool>,
    pub agent_done: Vec<bool>,
    pub action: Vec<i32>,
    pub value: Vec<f32>,
    pub reward: Vec<f32>,
    pub log_prob: Vec<f32>,
    /// Pre-step observation, `[actors, obs_dim]`.
    pub obs: Vec<f32>,
    /// Per environment.
    pub info: Vec<Diagnostics>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AdvantageStats {
    pub pre_mean: f32,
    pub pre_std: f32,
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f32>()
        / n;
    (mean, var.sqrt())
}

/// `(a - mean) / (std + 1e-8)` in place; a constant batch maps to zeros.
pub fn standardize(values: &mut [f32]) {
    let (mean, std) = mean_std(values);
    for v in values.iter_mut() {
        *v = (*v - mean) / (std + 1.0e-8);
    }
}

/// Reverse-time GAE over a `[steps, actors]` layout.
///
/// `dones[t]` is the per-agent done flag produced by step `t`; it cuts both
/// the bootstrap and the trace. Returns `(advantages, targets)`.
#[allow(clippy::too_many_arguments)]
pub fn generalized_advantages(
    rewards: &[f32],
    values: &[f32],
    dones: &BitSlice<u64, Lsb0>,
    bootstrap: &[f32],
    steps: usize,
    actors: usize,
    gamma: f32,
    lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let mut advantages = vec![0.0f32; steps * actors];
    let mut targets = vec![0.0f32; steps * actors];

    for (actor, &last_value) in bootstrap.iter().enumerate().take(actors) {
        let mut gae = 0.0f32;
        let mut next_v = last_value;

        for t in (0..steps).rev() {
            let i = t * actors + actor;
            let not_done = if dones[i] { 0.0 } else { 1.0 };
            let v = values[i];

            let delta = rewards[i] + gamma * next_v * not_done - v;
            gae = delta + gamma * lambda * not_done * gae;

            advantages[i] = gae;
            targets[i] = gae + v;
            next_v = v;
        }
    }

    (advantages, targets)
}

/// Host tensors for one minibatch in `[steps, actors]` order.
#[derive(Clone, Debug)]
pub struct Minibatch {
    pub steps: usize,
    pub actors: usize,
    pub obs: Vec<f32>,
    pub resets: Vec<f32>,
    pub actions: Vec<i32>,
    pub old_log_probs: Vec<f32>,
    pub old_values: Vec<f32>,
    pub advantages: Vec<f32>,
    pub targets: Vec<f32>,
    pub masks: Vec<f32>,
    pub init_hidden: HiddenState,
}

/// Fixed-length trajectory for `num_agents * num_envs` actors, plus the
/// carry the collector started from.
pub struct Rollout {
    t: usize,
    num_agents: usize,
    num_envs: usize,
    obs_dim: usize,

    obs: Vec<f32>,
    actions: Vec<i32>,
    old_logp: Vec<f32>,
    values: Vec<f32>,
    rewards: Vec<f32>,
    agent_done: BitVec<u64, Lsb0>,
    episode_done: BitVec<u64, Lsb0>,
    infos: Vec<Vec<Diagnostics>>,

    init_hidden: HiddenState,
    init_done: BitVec<u64, Lsb0>,

    advantages: Vec<f32>,
    targets: Vec<f32>,
    adv_stats: AdvantageStats,
}

impl Rollout {
    pub fn new(
        t: usize,
        num_agents: usize,
        num_envs: usize,
        obs_dim: usize,
        init_hidden: HiddenState,
        init_done: &[bool],
    ) -> Result<Self> {
        let n = num_agents * num_envs;
        if init_hidden.batch() != n || init_done.len() != n {
            bail!(
                "initial carry covers {} hidden rows and {} done flags, expected {n}",
                init_hidden.batch(),
                init_done.len()
            );
        }
        let num_samples = t * n;
        Ok(Self {
            t,
            num_agents,
            num_envs,
            obs_dim,
            obs: vec![0.0; num_samples * obs_dim],
            actions: vec![0; num_samples],
            old_logp: vec![0.0; num_samples],
            values: vec![0.0; num_samples],
            rewards: vec![0.0; num_samples],
            agent_done: bitvec![u64, Lsb0; 0; num_samples],
            episode_done: bitvec![u64, Lsb0; 0; num_samples],
            infos: Vec::with_capacity(t),
            init_hidden,
            init_done: init_done.iter().copied().collect(),
            advantages: vec![0.0; num_samples],
            targets: vec![0.0; num_samples],
            adv_stats: AdvantageStats::default(),
        })
    }

    #[inline]
    fn idx(&self, t: usize, actor: usize) -> usize {
        t * self.num_actors() + actor
    }

    pub fn steps(&self) -> usize {
        self.t
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn num_actors(&self) -> usize {
        self.num_agents * self.num_envs
    }

    pub fn log_probs(&self) -> &[f32] {
        &self.old_logp
    }

    /// Whole episodes that ended inside the rollout, counted once per
    /// environment from the first agent's columns.
    pub fn finished_episodes(&self) -> usize {
        (0..self.t)
            .map(|t| {
                let base = self.idx(t, 0);
                self.episode_done[base..base + self.num_envs].count_ones()
            })
            .sum()
    }

    pub fn store_step(&mut self, t: usize, step: Transition) -> Result<()> {
        let n = self.num_actors();
        if t >= self.t || t != self.infos.len() {
            bail!("transition {t} stored out of order (have {})", self.infos.len());
        }
        let sizes = [
            step.episode_done.len(),
            step.agent_done.len(),
            step.action.len(),
            step.value.len(),
            step.reward.len(),
            step.log_prob.len(),
        ];
        if sizes.iter().any(|s| *s != n) || step.obs.len() != n * self.obs_dim {
            bail!("transition {t} does not cover {n} actors");
        }

        let base = self.idx(t, 0);
        self.obs[base * self.obs_dim..(base + n) * self.obs_dim].copy_from_slice(&step.obs);
        self.actions[base..base + n].copy_from_slice(&step.action);
        self.old_logp[base..base + n].copy_from_slice(&step.log_prob);
        self.values[base..base + n].copy_from_slice(&step.value);
        self.rewards[base..base + n].copy_from_slice(&step.reward);
        for actor in 0..n {
            self.agent_done.set(base + actor, step.agent_done[actor]);
            self.episode_done.set(base + actor, step.episode_done[actor]);
        }
        self.infos.push(step.info);
        Ok(())
    }

    pub fn compute_gae(
        &mut self,
        last_values: &[f32],
        gamma: f32,
        lam: f32,
        reward_scale: f32,
    ) -> Result<()> {
        if self.infos.len() != self.t {
            bail!("rollout holds {} of {} steps", self.infos.len(), self.t);
        }
        if last_values.len() != self.num_actors() {
            bail!(
                "bootstrap has {} values for {} actors",
                last_values.len(),
                self.num_actors()
            );
        }

        let scaled = self.rewards.iter().map(|r| r * reward_scale).collect::<Vec<_>>();
        let (advantages, targets) = generalized_advantages(
            &scaled,
            &self.values,
            &self.agent_done,
            last_values,
            self.t,
            self.num_actors(),
            gamma,
            lam,
        );
        self.advantages = advantages;
        self.targets = targets;

        let (pre_mean, pre_std) = mean_std(&self.advantages);
        self.adv_stats = AdvantageStats { pre_mean, pre_std };
        Ok(())
    }

    pub fn advantage_stats(&self) -> AdvantageStats {
        self.adv_stats
    }

    pub fn episode_stats(&self) -> EpisodeStats {
        let mut stats = EpisodeStats::default();
        for infos in &self.infos {
            stats.record_step(infos);
        }
        stats
    }

    /// Gathers all agents of the given environments over the full time axis.
    ///
    /// Reset flags replay what the collector fed the network: the initial
    /// done flags at `t = 0`, then the previous step's agent done flags.
    /// Advantages are standardized over the minibatch.
    pub fn minibatch(&self, env_indices: &[usize]) -> Minibatch {
        let columns = (0..self.num_agents)
            .flat_map(|agent| env_indices.iter().map(move |env| agent * self.num_envs + env))
            .collect::<Vec<_>>();
        let m = columns.len();
        let bsz = self.t * m;

        let mut obs_mb = vec![0.0f32; bsz * self.obs_dim];
        let mut resets_mb = vec![0.0f32; bsz];
        let mut act_mb = vec![0i32; bsz];
        let mut old_lp_mb = vec![0.0f32; bsz];
        let mut old_v_mb = vec![0.0f32; bsz];
        let mut adv_mb = vec![0.0f32; bsz];
        let mut tgt_mb = vec![0.0f32; bsz];
        let mut mask_mb = vec![0.0f32; bsz];

        for t in 0..self.t {
            for (j, &col) in columns.iter().enumerate() {
                let row = t * m + j;
                let idx = self.idx(t, col);

                let src = idx * self.obs_dim;
                let dst = row * self.obs_dim;
                obs_mb[dst..dst + self.obs_dim].copy_from_slice(&self.obs[src..src + self.obs_dim]);

                let reset = if t == 0 {
                    self.init_done[col]
                } else {
                    self.agent_done[self.idx(t - 1, col)]
                };
                resets_mb[row] = if reset { 1.0 } else { 0.0 };
                mask_mb[row] = if self.agent_done[idx] { 0.0 } else { 1.0 };

                act_mb[row] = self.actions[idx];
                old_lp_mb[row] = self.old_logp[idx];
                old_v_mb[row] = self.values[idx];
                adv_mb[row] = self.advantages[idx];
                tgt_mb[row] = self.targets[idx];
            }
        }
        standardize(&mut adv_mb);

        Minibatch {
            steps: self.t,
            actors: m,
            obs: obs_mb,
            resets: resets_mb,
            actions: act_mb,
            old_log_probs: old_lp_mb,
            old_values: old_v_mb,
            advantages: adv_mb,
            targets: tgt_mb,
            masks: mask_mb,
            init_hidden: self.init_hidden.gather_rows(&columns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(values: &[bool]) -> BitVec<u64, Lsb0> {
        values.iter().copied().collect()
    }

    fn transition(n: usize, obs_dim: usize, reward: f32, done: bool) -> Transition {
        Transition {
            episode_done: vec![done; n],
            agent_done: vec![done; n],
            action: vec![1; n],
            value: vec![0.5; n],
            reward: vec![reward; n],
            log_prob: vec![-1.0; n],
            obs: vec![reward; n * obs_dim],
            info: vec![Diagnostics::new(); n],
        }
    }

    #[test]
    fn gamma_zero_gives_reward_minus_value() {
        let rewards = [1.0, 2.0, 3.0, -1.0];
        let values = [0.5, 0.25, 1.0, 0.0];
        let dones = flags(&[false, false, true, false]);

        let (adv, tgt) =
            generalized_advantages(&rewards, &values, &dones, &[7.0], 4, 1, 0.0, 0.95);
        for i in 0..4 {
            assert!((adv[i] - (rewards[i] - values[i])).abs() < 1e-6);
            assert!((tgt[i] - rewards[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn lambda_zero_gives_one_step_td_residual() {
        let rewards = [1.0, 0.0, 2.0];
        let values = [0.5, 1.5, -0.5];
        let dones = flags(&[false, true, false]);
        let gamma = 0.9;

        let (adv, _) = generalized_advantages(&rewards, &values, &dones, &[2.0], 3, 1, gamma, 0.0);
        assert!((adv[0] - (1.0 + gamma * 1.5 - 0.5)).abs() < 1e-6);
        assert!((adv[1] - (0.0 - 1.5)).abs() < 1e-6);
        assert!((adv[2] - (2.0 + gamma * 2.0 + 0.5)).abs() < 1e-6);
    }

    #[test]
    fn four_step_episode_with_terminal_reward() {
        let rewards = [0.0, 0.0, 0.0, 1.0];
        let values = [0.0; 4];
        let dones = flags(&[false, false, false, true]);
        let (gamma, lambda) = (0.99f32, 0.95f32);

        let (adv, tgt) =
            generalized_advantages(&rewards, &values, &dones, &[100.0], 4, 1, gamma, lambda);
        assert!((adv[3] - 1.0).abs() < 1e-6);
        for t in 0..3 {
            let expected = (gamma * lambda).powi((3 - t) as i32);
            assert!((adv[t] - expected).abs() < 1e-6, "t={t}: {} vs {expected}", adv[t]);
            assert!((tgt[t] - adv[t]).abs() < 1e-6);
        }
    }

    #[test]
    fn four_step_episode_ignores_bootstrap_after_terminal() {
        let rewards = [1.0, 1.0, 1.0, 1.0];
        let values = [0.5, 0.2, -0.1, 0.4];
        let dones = flags(&[false, false, false, true]);
        let run = |bootstrap: f32| {
            generalized_advantages(&rewards, &values, &dones, &[bootstrap], 4, 1, 0.99, 0.95)
        };

        let (adv, tgt) = run(5.0);
        // delta_3 = 1 - 0.4; delta_2 = 1 + 0.99 * 0.4 + 0.1; gae_t = delta_t + 0.9405 * gae_{t+1}
        let expected = [3.179_708_8, 2.638_712_2, 2.060_3, 0.6];
        for t in 0..4 {
            assert!((adv[t] - expected[t]).abs() < 1e-5, "t={t}: {} vs {}", adv[t], expected[t]);
            assert!((tgt[t] - (expected[t] + values[t])).abs() < 1e-5);
        }
        assert_eq!(run(-100.0), (adv, tgt));
    }

    #[test]
    fn actors_are_independent_columns() {
        // two actors interleaved per step
        let rewards = [1.0, 0.0, 1.0, 0.0];
        let values = [0.0; 4];
        let dones = flags(&[false, false, true, true]);

        let (adv, _) = generalized_advantages(&rewards, &values, &dones, &[0.0, 0.0], 2, 2, 1.0, 1.0);
        assert_eq!(adv, vec![2.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn standardize_constant_batch_is_finite() {
        let mut values = vec![3.0f32; 5];
        standardize(&mut values);
        assert!(values.iter().all(|v| v.is_finite() && *v == 0.0));

        let mut spread = vec![1.0f32, 3.0];
        standardize(&mut spread);
        assert!((spread[0] + 1.0).abs() < 1e-5 && (spread[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn minibatch_replays_reset_pattern() {
        // 1 agent, 2 envs, 3 steps; env 1 finishes at t = 1
        let mut roll =
            Rollout::new(3, 1, 2, 1, HiddenState::zeros(2, 4), &[true, false]).unwrap();
        for t in 0..3 {
            let mut step = transition(2, 1, t as f32, false);
            if t == 1 {
                step.agent_done[1] = true;
                step.episode_done[1] = true;
            }
            roll.store_step(t, step).unwrap();
        }
        roll.compute_gae(&[0.0, 0.0], 0.99, 0.95, 1.0).unwrap();

        let mb = roll.minibatch(&[1]);
        assert_eq!(mb.actors, 1);
        assert_eq!(mb.resets, vec![0.0, 0.0, 1.0]);
        assert_eq!(mb.masks, vec![1.0, 0.0, 1.0]);
        assert_eq!(mb.obs, vec![0.0, 1.0, 2.0]);

        assert_eq!(roll.finished_episodes(), 1);

        let full = roll.minibatch(&[0, 1]);
        assert_eq!(full.resets[0], 1.0);
        assert_eq!(full.init_hidden.batch(), 2);
    }

    #[test]
    fn store_step_checks_order_and_size() {
        let mut roll = Rollout::new(2, 2, 1, 3, HiddenState::zeros(2, 1), &[false, false]).unwrap();
        assert!(roll.store_step(1, transition(2, 3, 0.0, false)).is_err());
        assert!(roll.store_step(0, transition(3, 3, 0.0, false)).is_err());
        assert!(roll.store_step(0, transition(2, 3, 0.0, false)).is_ok());
        assert!(roll.compute_gae(&[0.0, 0.0], 0.9, 0.9, 1.0).is_err());
    }
}
