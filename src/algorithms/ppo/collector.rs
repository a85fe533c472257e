use anyhow::{anyhow, bail, Result};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;
use std::time::Instant;
use tracing::{debug, span, Level};

use crate::algorithms::ppo::buffer::{Rollout, Transition};
use crate::algorithms::ppo::loss::logprob_and_entropy;
use crate::common::model::models::ActorCriticRnn;
use crate::common::model::rnn::HiddenState;
use crate::common::runtime::evaluation::EpisodeStats;
use crate::common::utils::marshal::{batchify, unbatchify, Stacked};
use crate::env::{AgentMap, MultiAgentEnv, VecEnv};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActionSelection {
    /// Draw from the categorical policy.
    Sample,
    /// Take the most probable action.
    Greedy,
}

/// Everything the collector threads from one rollout into the next.
pub struct RolloutCarry<S> {
    pub env_states: Vec<S>,
    pub last_obs: AgentMap<Vec<f32>>,
    /// Per-agent done flags from the previous step, env-major per agent.
    pub last_done: AgentMap<Vec<bool>>,
    pub hidden: HiddenState,
    pub rng: StdRng,
}

impl<S> RolloutCarry<S> {
    pub fn new(
        env_states: Vec<S>,
        last_obs: AgentMap<Vec<f32>>,
        hidden_dim: usize,
        rng: StdRng,
    ) -> Self {
        let num_envs = env_states.len();
        let last_done = last_obs
            .keys()
            .map(|agent| (agent.clone(), vec![false; num_envs]))
            .collect::<AgentMap<_>>();
        let hidden = HiddenState::zeros(last_obs.len() * num_envs, hidden_dim);
        Self {
            env_states,
            last_obs,
            last_done,
            hidden,
            rng,
        }
    }

    /// Resets every environment of `venv` and starts from a zero carry.
    pub fn reset<E>(venv: &VecEnv<E>, hidden_dim: usize, mut rng: StdRng) -> Self
    where
        E: MultiAgentEnv<State = S>,
    {
        let (obs, states) = venv.reset(&mut rng);
        Self::new(states, obs, hidden_dim, rng)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RolloutTimings {
    pub model_ms: f64,
    pub env_step_ms: f64,
    pub store_ms: f64,
}

pub struct CollectedRollout {
    pub rollout: Rollout,
    /// Value of the post-rollout state, one per actor.
    pub last_values: Vec<f32>,
    pub stats: EpisodeStats,
    pub timings: RolloutTimings,
}

struct PolicyStep {
    actions: Vec<i32>,
    log_probs: Vec<f32>,
    values: Vec<f32>,
    hidden: HiddenState,
}

fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>, what: &str) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("failed to read {what}: {e:?}"))
}

fn done_flags(done: &Stacked<bool>) -> Vec<f32> {
    done.data
        .iter()
        .map(|d| if *d { 1.0 } else { 0.0 })
        .collect()
}

/// Picks an action from one row of normalized log-probabilities.
pub fn select_action(log_probs: &[f32], selection: ActionSelection, rng: &mut StdRng) -> usize {
    match selection {
        ActionSelection::Greedy => log_probs
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (a, lp)| {
                if *lp > best.1 {
                    (a, *lp)
                } else {
                    best
                }
            })
            .0,
        ActionSelection::Sample => {
            let u = rng.random::<f32>();
            let mut cumulative = 0.0f32;
            let mut chosen = log_probs.len() - 1;
            for (a, lp) in log_probs.iter().enumerate() {
                cumulative += lp.exp();
                if u < cumulative {
                    chosen = a;
                    break;
                }
            }
            chosen
        }
    }
}

fn policy_step<B: Backend>(
    model: &ActorCriticRnn<B>,
    hidden: &HiddenState,
    obs: &Stacked<f32>,
    resets: Vec<f32>,
    selection: Option<ActionSelection>,
    rng: &mut StdRng,
    device: &B::Device,
) -> Result<PolicyStep> {
    let n = obs.num_actors();
    let obs_t = Tensor::<B, 3>::from_data(TensorData::new(obs.data.clone(), [1, n, obs.width]), device);
    let resets_t = Tensor::<B, 2>::from_data(TensorData::new(resets, [1, n]), device);

    let out = model.forward(hidden.to_tensor(device), obs_t, resets_t);
    let values = to_host(out.values, "values")?;

    let Some(selection) = selection else {
        return Ok(PolicyStep {
            actions: Vec::new(),
            log_probs: Vec::new(),
            values,
            hidden: hidden.clone(),
        });
    };

    let [_, _, num_actions] = out.logits.dims();
    let logits = out.logits.reshape([n, num_actions]);
    let policy = to_host(log_softmax(logits.clone(), 1), "policy")?;
    let actions = policy
        .chunks(num_actions)
        .map(|row| select_action(row, selection, rng) as i32)
        .collect::<Vec<_>>();

    // same op the optimizer replays; ratios start at exactly 1
    let actions_t = Tensor::<B, 1, Int>::from_data(TensorData::new(actions.clone(), [n]), device);
    let (chosen, _) = logprob_and_entropy(logits, actions_t);
    let log_probs = to_host(chosen, "log-probabilities")?;

    Ok(PolicyStep {
        actions,
        log_probs,
        values,
        hidden: HiddenState::from_tensor(out.hidden)?,
    })
}

/// Runs `rollout_length` vectorized steps with frozen parameters.
///
/// The carry is advanced in place. The returned rollout starts from the
/// carry's hidden state and done flags as they were on entry.
pub fn collect_rollout<B: Backend, E: MultiAgentEnv>(
    model: &ActorCriticRnn<B>,
    venv: &VecEnv<E>,
    carry: &mut RolloutCarry<E::State>,
    rollout_length: usize,
    selection: ActionSelection,
    device: &B::Device,
) -> Result<CollectedRollout> {
    let agents = venv.agents().to_vec();
    let num_envs = venv.num_envs();
    let obs_dim = venv.env().obs_dim();
    if carry.env_states.len() != num_envs {
        bail!(
            "carry holds {} environment states for {num_envs} environments",
            carry.env_states.len()
        );
    }

    let init_done = batchify(&carry.last_done, &agents, num_envs)?;
    let mut roll = Rollout::new(
        rollout_length,
        agents.len(),
        num_envs,
        obs_dim,
        carry.hidden.clone(),
        &init_done.data,
    )?;

    let mut timings = RolloutTimings::default();
    {
        let rollout_span = span!(Level::DEBUG, "rollout_span", rollout_length, num_envs);
        let _rollout_guard = rollout_span.enter();

        for t in 0..rollout_length {
            let model_started = Instant::now();
            let obs = batchify(&carry.last_obs, &agents, num_envs)?;
            let done = batchify(&carry.last_done, &agents, num_envs)?;
            let step = policy_step(
                model,
                &carry.hidden,
                &obs,
                done_flags(&done),
                Some(selection),
                &mut carry.rng,
                device,
            )?;
            timings.model_ms += model_started.elapsed().as_secs_f64() * 1_000.0;

            let env_started = Instant::now();
            let actions = Stacked {
                num_agents: agents.len(),
                num_envs,
                width: 1,
                data: step.actions.iter().map(|a| *a as usize).collect(),
            };
            let env_actions = unbatchify(&actions, &agents)?;
            let out = venv.step(&mut carry.rng, &carry.env_states, &env_actions)?;
            timings.env_step_ms += env_started.elapsed().as_secs_f64() * 1_000.0;

            let store_started = Instant::now();
            let reward = batchify(&out.reward, &agents, num_envs)?;
            let agent_done = batchify(&out.done, &agents, num_envs)?;
            let episode_done = (0..agents.len())
                .flat_map(|_| out.all_done.iter().copied())
                .collect::<Vec<_>>();

            roll.store_step(
                t,
                Transition {
                    episode_done,
                    agent_done: agent_done.data,
                    action: step.actions,
                    value: step.values,
                    reward: reward.data,
                    log_prob: step.log_probs,
                    obs: obs.data,
                    info: out.info,
                },
            )?;

            carry.env_states = out.states;
            carry.last_obs = out.obs;
            carry.last_done = out.done;
            carry.hidden = step.hidden;
            timings.store_ms += store_started.elapsed().as_secs_f64() * 1_000.0;
        }
    }

    let obs = batchify(&carry.last_obs, &agents, num_envs)?;
    let done = batchify(&carry.last_done, &agents, num_envs)?;
    let bootstrap = policy_step(
        model,
        &carry.hidden,
        &obs,
        done_flags(&done),
        None,
        &mut carry.rng,
        device,
    )?;

    debug!(
        category = "ACTOR",
        rollout_model_duration_ms = timings.model_ms,
        rollout_env_step_duration_ms = timings.env_step_ms,
        rollout_store_duration_ms = timings.store_ms,
        episodes_ended = roll.finished_episodes(),
        "rollout_timings"
    );

    let stats = roll.episode_stats();
    Ok(CollectedRollout {
        rollout: roll,
        last_values: bootstrap.values,
        stats,
        timings,
    })
}
