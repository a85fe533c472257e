use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::BTreeMap;

pub mod log_wrapper;
pub mod rendezvous;

pub use log_wrapper::{LogState, LogWrapper};
pub use rendezvous::{RendezvousConfig, RendezvousEnv, RewardMode};

/// Per-agent values keyed by agent name.
pub type AgentMap<T> = BTreeMap<String, T>;

/// Opaque per-environment diagnostics passed through the trainer untouched.
pub type Diagnostics = BTreeMap<String, f32>;

/// Done flags for a single environment step.
///
/// `all` is the whole-episode flag (`__all__`); once it is set the
/// vectorized wrapper resets that environment instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dones {
    pub agents: AgentMap<bool>,
    pub all: bool,
}

#[derive(Clone, Debug)]
pub struct EnvStep<S> {
    pub obs: AgentMap<Vec<f32>>,
    pub state: S,
    pub reward: AgentMap<f32>,
    pub done: Dones,
    pub info: Diagnostics,
}

/// A cooperative multi-agent environment with pure transitions.
///
/// Implementations hold only immutable configuration; all mutable data lives
/// in `State`, which `step` consumes by reference and returns anew.
pub trait MultiAgentEnv: Send + Sync {
    type State: Clone + Send + Sync;

    fn agents(&self) -> &[String];
    fn obs_dim(&self) -> usize;
    fn num_actions(&self) -> usize;

    fn num_agents(&self) -> usize {
        self.agents().len()
    }

    fn reset(&self, rng: &mut StdRng) -> (AgentMap<Vec<f32>>, Self::State);

    fn step(
        &self,
        rng: &mut StdRng,
        state: &Self::State,
        actions: &AgentMap<usize>,
    ) -> Result<EnvStep<Self::State>>;
}

/// Output of one vectorized step. Per-agent arrays are env-major
/// (`[env]` for scalars, `[env, obs_dim]` for observations).
#[derive(Clone, Debug)]
pub struct VecStep<S> {
    pub obs: AgentMap<Vec<f32>>,
    pub states: Vec<S>,
    pub reward: AgentMap<Vec<f32>>,
    pub done: AgentMap<Vec<bool>>,
    pub all_done: Vec<bool>,
    pub info: Vec<Diagnostics>,
}

/// Fixed-size batch of independent environment instances with auto-reset.
#[derive(Clone, Debug)]
pub struct VecEnv<E> {
    env: E,
    num_envs: usize,
}

impl<E: MultiAgentEnv> VecEnv<E> {
    pub fn new(env: E, num_envs: usize) -> Result<Self> {
        if num_envs == 0 {
            bail!("num_envs must be > 0");
        }
        Ok(Self { env, num_envs })
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn agents(&self) -> &[String] {
        self.env.agents()
    }

    /// One key per instance, drawn up front so results do not depend on
    /// how rayon schedules the instances.
    fn instance_keys(&self, rng: &mut StdRng) -> Vec<u64> {
        (0..self.num_envs).map(|_| rng.random::<u64>()).collect()
    }

    pub fn reset(&self, rng: &mut StdRng) -> (AgentMap<Vec<f32>>, Vec<E::State>) {
        let keys = self.instance_keys(rng);
        let resets = keys
            .par_iter()
            .map(|key| self.env.reset(&mut StdRng::seed_from_u64(*key)))
            .collect::<Vec<_>>();

        let mut obs = empty_agent_arrays(self.env.agents(), self.num_envs * self.env.obs_dim());
        let mut states = Vec::with_capacity(self.num_envs);
        for (instance_obs, state) in resets {
            append_agent_values(&mut obs, instance_obs);
            states.push(state);
        }
        (obs, states)
    }

    pub fn step(
        &self,
        rng: &mut StdRng,
        states: &[E::State],
        actions: &AgentMap<Vec<usize>>,
    ) -> Result<VecStep<E::State>> {
        if states.len() != self.num_envs {
            bail!(
                "expected {} environment states, got {}",
                self.num_envs,
                states.len()
            );
        }
        for (agent, acts) in actions {
            if acts.len() != self.num_envs {
                bail!(
                    "agent {agent} has {} actions for {} environments",
                    acts.len(),
                    self.num_envs
                );
            }
        }

        let keys = self.instance_keys(rng);
        let steps = states
            .par_iter()
            .zip(keys.par_iter())
            .enumerate()
            .map(|(e, (state, key))| {
                let joint = actions
                    .iter()
                    .map(|(agent, acts)| (agent.clone(), acts[e]))
                    .collect::<AgentMap<usize>>();
                let mut instance_rng = StdRng::seed_from_u64(*key);
                let mut step = self.env.step(&mut instance_rng, state, &joint)?;
                if step.done.all {
                    let (obs, fresh) = self.env.reset(&mut instance_rng);
                    step.obs = obs;
                    step.state = fresh;
                }
                Ok(step)
            })
            .collect::<Result<Vec<_>>>()?;

        let agents = self.env.agents();
        let mut out = VecStep {
            obs: empty_agent_arrays(agents, self.num_envs * self.env.obs_dim()),
            states: Vec::with_capacity(self.num_envs),
            reward: empty_agent_arrays(agents, self.num_envs),
            done: empty_agent_arrays(agents, self.num_envs),
            all_done: Vec::with_capacity(self.num_envs),
            info: Vec::with_capacity(self.num_envs),
        };
        for step in steps {
            append_agent_values(&mut out.obs, step.obs);
            append_agent_scalars(&mut out.reward, step.reward);
            append_agent_scalars(&mut out.done, step.done.agents);
            out.all_done.push(step.done.all);
            out.states.push(step.state);
            out.info.push(step.info);
        }
        Ok(out)
    }
}

fn empty_agent_arrays<T>(agents: &[String], capacity: usize) -> AgentMap<Vec<T>> {
    agents
        .iter()
        .map(|agent| (agent.clone(), Vec::with_capacity(capacity)))
        .collect()
}

fn append_agent_values<T>(dst: &mut AgentMap<Vec<T>>, src: AgentMap<Vec<T>>) {
    for (agent, values) in src {
        dst.entry(agent).or_default().extend(values);
    }
}

fn append_agent_scalars<T>(dst: &mut AgentMap<Vec<T>>, src: AgentMap<T>) {
    for (agent, value) in src {
        dst.entry(agent).or_default().push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_env() -> RendezvousEnv {
        RendezvousEnv::new(RendezvousConfig {
            num_agents: 2,
            max_steps: 3,
            ..RendezvousConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn reset_produces_env_major_arrays() {
        let venv = VecEnv::new(small_env(), 4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (obs, states) = venv.reset(&mut rng);

        assert_eq!(states.len(), 4);
        assert_eq!(obs.len(), 2);
        for values in obs.values() {
            assert_eq!(values.len(), 4 * venv.env().obs_dim());
        }
    }

    #[test]
    fn step_auto_resets_finished_instances() {
        let venv = VecEnv::new(small_env(), 3).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let (_, mut states) = venv.reset(&mut rng);
        let actions: AgentMap<Vec<usize>> = venv
            .agents()
            .iter()
            .map(|a| (a.clone(), vec![0; 3]))
            .collect();

        let mut saw_episode_end = false;
        for _ in 0..3 {
            let step = venv.step(&mut rng, &states, &actions).unwrap();
            for (e, done) in step.all_done.iter().enumerate() {
                if *done {
                    saw_episode_end = true;
                    assert_eq!(step.states[e].t, 0);
                }
            }
            states = step.states;
        }
        assert!(saw_episode_end);
    }

    #[test]
    fn step_rejects_short_action_arrays() {
        let venv = VecEnv::new(small_env(), 2).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (_, states) = venv.reset(&mut rng);
        let actions: AgentMap<Vec<usize>> = venv
            .agents()
            .iter()
            .map(|a| (a.clone(), vec![0; 1]))
            .collect();

        assert!(venv.step(&mut rng, &states, &actions).is_err());
    }

    #[test]
    fn stepping_is_deterministic_for_a_seed() {
        let venv = VecEnv::new(small_env(), 5).unwrap();
        let run = || {
            let mut rng = StdRng::seed_from_u64(11);
            let (_, states) = venv.reset(&mut rng);
            let actions: AgentMap<Vec<usize>> = venv
                .agents()
                .iter()
                .map(|a| (a.clone(), vec![1; 5]))
                .collect();
            venv.step(&mut rng, &states, &actions).unwrap().obs
        };
        assert_eq!(run(), run());
    }
}
