use anyhow::{anyhow, bail, Result};
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, Level};

use crate::algorithms::ppo::buffer::{AdvantageStats, Minibatch, Rollout};
use crate::algorithms::ppo::collector::{
    collect_rollout, ActionSelection, RolloutCarry, RolloutTimings,
};
use crate::algorithms::ppo::loss::{
    compute_ppo_losses, logprob_and_entropy, PpoLossConfig, PpoLossParts,
};
use crate::common::config::{Args, ReplicaLayout};
use crate::common::model::models::{ActorCriticConfig, ActorCriticRnn};
use crate::common::runtime::checkpoint::{Checkpoint, CheckpointStore};
use crate::common::runtime::evaluation::EpisodeStats;
use crate::common::runtime::replica::{run_replicated, GradientSync, ReduceOp};
use crate::common::telemetry::{CycleMetrics, MetricsSink};
use crate::common::utils::marshal::{batchify, unbatchify};
use crate::common::utils::optimization::{
    all_reduce_gradients, clip_global_grad_norm, flatten_params, linear_decay_alpha,
};
use crate::env::{MultiAgentEnv, VecEnv};

const RESET_SEED_OFFSET: u64 = 10_000;
const EVAL_SEED_OFFSET: u64 = 999;
const SHUFFLE_SEED_MIX: u64 = 0xA11CE;

type CheckpointRecorder = BinBytesRecorder<FullPrecisionSettings>;

pub fn model_config(args: &Args, obs_dim: usize, num_actions: usize) -> ActorCriticConfig {
    ActorCriticConfig {
        obs_dim,
        num_actions,
        hidden_dim: args.hidden_dim,
        fc_dim: args.fc_dim,
        seed: args.seed,
    }
}

fn loss_config(args: &Args) -> PpoLossConfig {
    PpoLossConfig {
        clip_eps: args.effective_clip_eps(),
        vf_coef: args.vf_coef,
        ent_coef: args.ent_coef,
        clip_value_loss: args.clip_value_loss,
    }
}

/// Learning rate for optimizer step `step`, annealed per update cycle.
pub fn learning_rate(args: &Args, step: usize) -> f64 {
    if !args.decay_learning_rates {
        return args.lr;
    }
    let steps_per_update = (args.epochs * args.num_minibatches).max(1);
    args.lr * linear_decay_alpha(step / steps_per_update, args.resolved_num_updates())
}

fn scalar<Bk: Backend>(tensor: Tensor<Bk, 1>) -> Result<f32> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("failed to read scalar: {e:?}"))?
        .first()
        .copied()
        .ok_or_else(|| anyhow!("empty scalar tensor"))
}

/// Decodes a parameter record onto any backend.
pub fn load_agent<B: Backend>(
    cfg: &ActorCriticConfig,
    checkpoint: &Checkpoint,
    device: &B::Device,
) -> Result<ActorCriticRnn<B>> {
    let recorder = CheckpointRecorder::default();
    let record = <CheckpointRecorder as Recorder<B>>::load(&recorder, checkpoint.params.clone(), device)
        .map_err(|e| anyhow!("failed to decode parameters: {e:?}"))?;
    Ok(ActorCriticRnn::new(cfg, device).load_record(record))
}

/// Parameters, optimizer state and the number of optimizer steps taken.
pub struct TrainState<B: AutodiffBackend, O> {
    pub agent: ActorCriticRnn<B>,
    pub optim: O,
    pub step: usize,
}

pub fn init_train_state<B: AutodiffBackend>(
    cfg: &ActorCriticConfig,
    args: &Args,
    device: &B::Device,
) -> TrainState<B, impl Optimizer<ActorCriticRnn<B>, B>> {
    TrainState {
        agent: ActorCriticRnn::new(cfg, device),
        optim: AdamConfig::new()
            .with_epsilon(args.adam_eps)
            .init::<B, ActorCriticRnn<B>>(),
        step: 0,
    }
}

impl<B: AutodiffBackend, O: Optimizer<ActorCriticRnn<B>, B>> TrainState<B, O> {
    pub fn snapshot(&self) -> Result<Checkpoint> {
        let recorder = CheckpointRecorder::default();
        let params =
            <CheckpointRecorder as Recorder<B>>::record(&recorder, self.agent.clone().into_record(), ())
                .map_err(|e| anyhow!("failed to encode parameters: {e:?}"))?;
        let optimizer = <CheckpointRecorder as Recorder<B>>::record(&recorder, self.optim.to_record(), ())
            .map_err(|e| anyhow!("failed to encode optimizer state: {e:?}"))?;
        Ok(Checkpoint {
            params,
            optimizer,
            step: self.step,
        })
    }

    pub fn restore(self, checkpoint: &Checkpoint, device: &B::Device) -> Result<Self> {
        let recorder = CheckpointRecorder::default();
        let params =
            <CheckpointRecorder as Recorder<B>>::load(&recorder, checkpoint.params.clone(), device)
                .map_err(|e| anyhow!("failed to decode parameters: {e:?}"))?;
        let optim_record =
            <CheckpointRecorder as Recorder<B>>::load(&recorder, checkpoint.optimizer.clone(), device)
                .map_err(|e| anyhow!("failed to decode optimizer state: {e:?}"))?;
        Ok(Self {
            agent: self.agent.load_record(params),
            optim: self.optim.load_record(optim_record),
            step: checkpoint.step,
        })
    }
}

/// Per-replica loop state between update cycles.
pub struct RunnerState<B: AutodiffBackend, O, S> {
    pub train: TrainState<B, O>,
    pub carry: RolloutCarry<S>,
    pub rng: StdRng,
    pub update: usize,
}

/// Recomputes the PPO loss of one minibatch by replaying its sequences from
/// their recorded initial carry.
pub fn minibatch_loss<B: Backend>(
    agent: &ActorCriticRnn<B>,
    batch: &Minibatch,
    cfg: PpoLossConfig,
    device: &B::Device,
) -> PpoLossParts<B> {
    let (steps, actors) = (batch.steps, batch.actors);
    let bsz = steps * actors;
    let obs_dim = batch.obs.len() / bsz.max(1);
    let flat = |values: &[f32]| {
        Tensor::<B, 1>::from_data(TensorData::new(values.to_vec(), [bsz]), device)
    };

    let out = agent.forward(
        batch.init_hidden.to_tensor(device),
        Tensor::from_data(TensorData::new(batch.obs.clone(), [steps, actors, obs_dim]), device),
        Tensor::from_data(TensorData::new(batch.resets.clone(), [steps, actors]), device),
    );
    let [_, _, num_actions] = out.logits.dims();
    let actions =
        Tensor::<B, 1, Int>::from_data(TensorData::new(batch.actions.clone(), [bsz]), device);
    let (new_lp, entropy) = logprob_and_entropy(out.logits.reshape([bsz, num_actions]), actions);
    let live_count = batch.masks.iter().sum::<f32>();

    compute_ppo_losses(
        new_lp,
        flat(&batch.old_log_probs),
        flat(&batch.advantages),
        entropy,
        out.values.reshape([bsz]),
        flat(&batch.old_values),
        flat(&batch.targets),
        flat(&batch.masks),
        live_count,
        cfg,
    )
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PpoOptimizationSummary {
    pub elapsed: Duration,
    pub num_steps: usize,
    pub actor_loss_sum: f64,
    pub value_loss_sum: f64,
    pub entropy_sum: f64,
    pub approx_kl_sum: f64,
    pub clip_fraction_sum: f64,
    pub grad_norm_sum: f64,
    pub last_learning_rate: f64,
    pub data_prep_duration_ms: f64,
    pub forward_loss_duration_ms: f64,
    pub backward_step_duration_ms: f64,
}

impl PpoOptimizationSummary {
    fn mean(&self, sum: f64) -> f64 {
        sum / (self.num_steps.max(1) as f64)
    }
}

pub struct PpoOptimizer;

impl PpoOptimizer {
    /// `epochs` passes over the rollout. Each pass permutes environments and
    /// splits them into `num_minibatches` equal shards; all agents of an
    /// environment stay in the same shard.
    #[allow(clippy::too_many_arguments)]
    pub fn optimize_update<B, O>(
        roll: &Rollout,
        args: &Args,
        update: usize,
        is_lead: bool,
        sync: &dyn GradientSync,
        device: &B::Device,
        rng: &mut StdRng,
        state: &mut TrainState<B, O>,
    ) -> Result<PpoOptimizationSummary>
    where
        B: AutodiffBackend,
        O: Optimizer<ActorCriticRnn<B>, B>,
    {
        let num_envs = roll.num_envs();
        if args.num_minibatches == 0 || num_envs % args.num_minibatches != 0 {
            bail!(
                "num_envs per replica = {num_envs} must be divisible by num_minibatches = {}",
                args.num_minibatches
            );
        }
        let mb_envs = num_envs / args.num_minibatches;
        let loss_cfg = loss_config(args);
        let mut env_order: Vec<usize> = (0..num_envs).collect();
        let mut summary = PpoOptimizationSummary::default();

        let optimization_started = Instant::now();
        {
            let optimization_span = span!(
                Level::DEBUG,
                "optimization_span",
                update,
                epochs = args.epochs,
                num_minibatches = args.num_minibatches,
                mb_envs
            );
            let _optimization_guard = optimization_span.enter();

            for epoch in 0..args.epochs {
                env_order.shuffle(rng);

                for mb in 0..args.num_minibatches {
                    let mb_idx = &env_order[mb * mb_envs..(mb + 1) * mb_envs];

                    let data_prep_started = Instant::now();
                    let batch = roll.minibatch(mb_idx);
                    summary.data_prep_duration_ms +=
                        data_prep_started.elapsed().as_secs_f64() * 1_000.0;

                    let forward_loss_started = Instant::now();
                    let parts = minibatch_loss(&state.agent, &batch, loss_cfg, device);
                    let actor_loss = scalar(parts.actor_loss)?;
                    let value_loss = scalar(parts.value_loss)?;
                    let entropy = scalar(parts.entropy_mean)?;
                    let approx_kl = scalar(parts.approx_kl)?;
                    let clip_fraction = scalar(parts.clip_fraction)?;
                    summary.forward_loss_duration_ms +=
                        forward_loss_started.elapsed().as_secs_f64() * 1_000.0;

                    let backward_step_started = Instant::now();
                    let grads = GradientsParams::from_grads(parts.total_loss.backward(), &state.agent);
                    let mut grads = all_reduce_gradients::<B, _>(&state.agent, grads, sync)?;
                    let global_grad_norm =
                        clip_global_grad_norm::<B, _>(&state.agent, &mut grads, args.max_grad_norm);

                    let lr = learning_rate(args, state.step);
                    state.agent = state.optim.step(lr, state.agent.clone(), grads);
                    state.step += 1;
                    summary.backward_step_duration_ms +=
                        backward_step_started.elapsed().as_secs_f64() * 1_000.0;

                    summary.num_steps += 1;
                    summary.actor_loss_sum += actor_loss as f64;
                    summary.value_loss_sum += value_loss as f64;
                    summary.entropy_sum += entropy as f64;
                    summary.approx_kl_sum += approx_kl as f64;
                    summary.clip_fraction_sum += clip_fraction as f64;
                    summary.grad_norm_sum += global_grad_norm as f64;
                    summary.last_learning_rate = lr;

                    if is_lead {
                        debug!(
                            category = "TRAINER",
                            update,
                            epoch,
                            minibatch = mb,
                            actor_loss,
                            value_loss,
                            entropy,
                            approx_kl,
                            clip_fraction,
                            global_grad_norm,
                            learning_rate = lr,
                            "minibatch"
                        );
                    }
                }
            }
        }
        summary.elapsed = optimization_started.elapsed();

        Ok(summary)
    }
}

struct CycleReport {
    update: usize,
    stats: EpisodeStats,
    optimization: PpoOptimizationSummary,
    advantages: AdvantageStats,
    timings: RolloutTimings,
    rollout_elapsed: Duration,
}

/// Collect, estimate advantages, optimize, then sum rollout statistics over
/// replicas.
fn run_cycle<B, O, E>(
    runner: &mut RunnerState<B, O, E::State>,
    venv: &VecEnv<E>,
    args: &Args,
    is_lead: bool,
    sync: &dyn GradientSync,
    device: &B::Device,
) -> Result<CycleReport>
where
    B: AutodiffBackend,
    O: Optimizer<ActorCriticRnn<B>, B>,
    E: MultiAgentEnv,
{
    let update = runner.update;

    let rollout_started = Instant::now();
    let frozen = runner.train.agent.valid();
    let mut collected = collect_rollout(
        &frozen,
        venv,
        &mut runner.carry,
        args.rollout_length,
        ActionSelection::Sample,
        device,
    )?;
    collected.rollout.compute_gae(
        &collected.last_values,
        args.gamma,
        args.gae_lambda,
        args.reward_scale,
    )?;
    let rollout_elapsed = rollout_started.elapsed();

    let optimization = PpoOptimizer::optimize_update(
        &collected.rollout,
        args,
        update,
        is_lead,
        sync,
        device,
        &mut runner.rng,
        &mut runner.train,
    )?;

    let reduced = sync.all_reduce(collected.stats.to_vec(), ReduceOp::Sum)?;
    let stats = EpisodeStats::from_slice(&reduced)?;
    runner.update += 1;

    Ok(CycleReport {
        update,
        stats,
        optimization,
        advantages: collected.rollout.advantage_stats(),
        timings: collected.timings,
        rollout_elapsed,
    })
}

/// Frozen-parameter rollout from a fresh reset; returns episode statistics.
pub fn evaluate<B: Backend, E: MultiAgentEnv>(
    model: &ActorCriticRnn<B>,
    venv: &VecEnv<E>,
    num_steps: usize,
    selection: ActionSelection,
    seed: u64,
    device: &B::Device,
) -> Result<EpisodeStats> {
    let mut carry = RolloutCarry::reset(venv, model.hidden_dim(), StdRng::seed_from_u64(seed));
    let collected = collect_rollout(model, venv, &mut carry, num_steps, selection, device)?;
    Ok(collected.stats)
}

fn eval_selection(args: &Args) -> ActionSelection {
    if args.greedy_eval {
        ActionSelection::Greedy
    } else {
        ActionSelection::Sample
    }
}

/// This replica's contiguous slice of one global reset.
fn replica_shard<E: MultiAgentEnv + Clone>(
    args: &Args,
    env: &E,
    layout: ReplicaLayout,
    rank: usize,
) -> Result<(VecEnv<E>, RolloutCarry<E::State>)> {
    let agents = env.agents();
    let global = VecEnv::new(env.clone(), args.num_envs)?;
    let mut reset_rng = StdRng::seed_from_u64(args.seed.wrapping_add(RESET_SEED_OFFSET));
    let (obs, states) = global.reset(&mut reset_rng);

    let shard = batchify(&obs, agents, args.num_envs)?
        .split_envs(layout.world_size)?
        .into_iter()
        .nth(rank)
        .ok_or_else(|| anyhow!("no environment shard for replica {rank}"))?;
    let per = layout.envs_per_replica;
    let states = states[rank * per..(rank + 1) * per].to_vec();

    let local = VecEnv::new(env.clone(), per)?;
    let rng = StdRng::seed_from_u64(args.seed.wrapping_add(rank as u64 + 1));
    let carry = RolloutCarry::new(states, unbatchify(&shard, agents)?, args.hidden_dim, rng);
    Ok((local, carry))
}

#[allow(clippy::too_many_arguments)]
fn run_replica<B, E>(
    args: &Args,
    env: &E,
    layout: ReplicaLayout,
    sync: &dyn GradientSync,
    sink: &dyn MetricsSink,
    resume: Option<&Checkpoint>,
    device: &B::Device,
) -> Result<TrainState<B, impl Optimizer<ActorCriticRnn<B>, B>>>
where
    B: AutodiffBackend,
    E: MultiAgentEnv + Clone,
{
    let rank = sync.rank();
    let is_lead = rank == 0;
    let cfg = model_config(args, env.obs_dim(), env.num_actions());

    let mut train_state = init_train_state::<B>(&cfg, args, device);
    if let Some(checkpoint) = resume {
        train_state = train_state.restore(checkpoint, device)?;
    }

    let (venv, carry) = replica_shard(args, env, layout, rank)?;
    let eval_venv = if is_lead && args.eval_interval > 0 && args.num_eval_envs > 0 {
        Some(VecEnv::new(env.clone(), args.num_eval_envs)?)
    } else {
        None
    };

    let steps_per_update = (args.epochs * args.num_minibatches).max(1);
    let num_updates = args.resolved_num_updates();
    let mut runner = RunnerState {
        update: train_state.step / steps_per_update,
        train: train_state,
        carry,
        rng: StdRng::seed_from_u64((args.seed ^ SHUFFLE_SEED_MIX).wrapping_add(rank as u64)),
    };

    if is_lead {
        info!(
            category = "MISC",
            world_size = layout.world_size,
            global_num_envs = args.num_envs,
            local_num_envs = layout.envs_per_replica,
            num_agents = env.num_agents(),
            rollout_length = args.rollout_length,
            obs_dim = cfg.obs_dim,
            action_dim = cfg.num_actions,
            start_update = runner.update,
            num_updates,
            "startup"
        );
    }

    let batch_per_update = (args.rollout_length * args.num_envs) as u64;
    while runner.update < num_updates {
        let update_span = span!(
            Level::INFO,
            "update_span",
            update = runner.update,
            num_updates,
            rank,
            world_size = layout.world_size
        );
        let _update_guard = update_span.enter();

        let report = run_cycle(&mut runner, &venv, args, is_lead, sync, device)?;
        if !is_lead {
            continue;
        }

        let opt = &report.optimization;
        let timesteps = (report.update as u64 + 1) * batch_per_update;
        let total_secs = (report.rollout_elapsed + opt.elapsed).as_secs_f64().max(1.0e-9);

        info!(
            category = "TRAINER",
            timesteps,
            policy_version = report.update + 1,
            actor_loss = opt.mean(opt.actor_loss_sum),
            value_loss = opt.mean(opt.value_loss_sum),
            entropy = opt.mean(opt.entropy_sum),
            approx_kl = opt.mean(opt.approx_kl_sum),
            clip_fraction = opt.mean(opt.clip_fraction_sum),
            global_grad_norm = opt.mean(opt.grad_norm_sum),
            "train"
        );

        sink.record(&CycleMetrics {
            update: report.update,
            mean_return: report.stats.mean_return(),
            win_rate: report.stats.win_rate(),
            env_steps: timesteps,
            episodes: report.stats.episodes,
        });

        info!(
            category = "MISC",
            timesteps,
            steps_per_second = batch_per_update as f64 / total_secs,
            learning_rate = opt.last_learning_rate,
            "misc"
        );

        debug!(
            category = "MISC",
            timesteps,
            rollout_duration_ms = report.rollout_elapsed.as_secs_f64() * 1_000.0,
            rollout_model_duration_ms = report.timings.model_ms,
            rollout_env_step_duration_ms = report.timings.env_step_ms,
            rollout_store_duration_ms = report.timings.store_ms,
            optimization_duration_ms = opt.elapsed.as_secs_f64() * 1_000.0,
            optimization_data_prep_duration_ms = opt.data_prep_duration_ms,
            optimization_forward_loss_duration_ms = opt.forward_loss_duration_ms,
            optimization_backward_step_duration_ms = opt.backward_step_duration_ms,
            advantage_pre_mean = report.advantages.pre_mean,
            advantage_pre_std = report.advantages.pre_std,
            "details"
        );

        if let Some(eval_venv) = eval_venv.as_ref() {
            if (report.update + 1) % args.eval_interval == 0 {
                let eval_started = Instant::now();
                let eval_stats = evaluate(
                    &runner.train.agent.valid(),
                    eval_venv,
                    args.num_eval_steps,
                    eval_selection(args),
                    args.seed
                        .wrapping_add(EVAL_SEED_OFFSET)
                        .wrapping_add(report.update as u64),
                    device,
                )?;

                info!(
                    category = "EVALUATOR",
                    timesteps,
                    policy_version = report.update + 1,
                    episodes = eval_stats.episodes,
                    mean_return = eval_stats.mean_return(),
                    win_rate = eval_stats.win_rate(),
                    duration_ms = eval_started.elapsed().as_secs_f64() * 1_000.0,
                    "eval"
                );
            }
        }
    }

    Ok(runner.train)
}

pub struct TrainOutcome<B: AutodiffBackend> {
    pub agent: ActorCriticRnn<B>,
    pub checkpoint: Checkpoint,
}

/// Trains on `world_size` lockstep replicas and returns replica 0's final
/// parameters. Fails if any replica ends with different parameters.
pub fn train<B, E>(
    args: &Args,
    env: E,
    world_size: usize,
    sink: &dyn MetricsSink,
    store: Option<&dyn CheckpointStore>,
    resume: Option<Checkpoint>,
    device: &B::Device,
) -> Result<TrainOutcome<B>>
where
    B: AutodiffBackend,
    E: MultiAgentEnv + Clone,
{
    let layout = ReplicaLayout::new(args, world_size)?;
    let started = Instant::now();

    let finals = run_replicated(layout.world_size, |handle| {
        run_replica::<B, E>(args, &env, layout, handle, sink, resume.as_ref(), device)
    })?;

    let mut finals = finals.into_iter();
    let lead = finals
        .next()
        .ok_or_else(|| anyhow!("no replica finished"))?;
    let lead_params = flatten_params::<B, _>(&lead.agent)?;
    for (offset, other) in finals.enumerate() {
        if flatten_params::<B, _>(&other.agent)? != lead_params {
            bail!("replica {} diverged from replica 0", offset + 1);
        }
    }

    let checkpoint = lead.snapshot()?;
    if let Some(store) = store {
        store.save(&checkpoint)?;
    }
    info!(
        category = "TRAINER",
        optimizer_steps = checkpoint.step,
        saved = store.is_some(),
        duration_ms = started.elapsed().as_secs_f64() * 1_000.0,
        "done"
    );

    Ok(TrainOutcome {
        agent: lead.agent,
        checkpoint,
    })
}

/// Restores parameters from `checkpoint` and evaluates them on
/// `num_eval_envs` fresh environments.
pub fn run_evaluation<B, E>(
    args: &Args,
    env: E,
    checkpoint: &Checkpoint,
    sink: &dyn MetricsSink,
    device: &B::Device,
) -> Result<EpisodeStats>
where
    B: Backend,
    E: MultiAgentEnv,
{
    let cfg = model_config(args, env.obs_dim(), env.num_actions());
    let agent = load_agent::<B>(&cfg, checkpoint, device)?;
    let venv = VecEnv::new(env, args.num_eval_envs)?;

    let started = Instant::now();
    let stats = evaluate(
        &agent,
        &venv,
        args.num_eval_steps,
        eval_selection(args),
        args.seed.wrapping_add(EVAL_SEED_OFFSET),
        device,
    )?;

    let steps_per_update = (args.epochs * args.num_minibatches).max(1);
    info!(
        category = "EVALUATOR",
        optimizer_steps = checkpoint.step,
        episodes = stats.episodes,
        mean_return = stats.mean_return(),
        win_rate = stats.win_rate(),
        duration_ms = started.elapsed().as_secs_f64() * 1_000.0,
        "eval"
    );
    sink.record(&CycleMetrics {
        update: checkpoint.step / steps_per_update,
        mean_return: stats.mean_return(),
        win_rate: stats.win_rate(),
        env_steps: (args.num_eval_steps * args.num_eval_envs) as u64,
        episodes: stats.episodes,
    });

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::runtime::checkpoint::MemoryCheckpointStore;
    use crate::common::runtime::replica::SingleReplica;
    use crate::common::telemetry::RecordingMetricsSink;
    use crate::env::{LogWrapper, RendezvousConfig, RendezvousEnv};
    use burn::backend::autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn small_args() -> Args {
        let mut args = Args::default();
        args.num_envs = 4;
        args.rollout_length = 8;
        args.num_updates = 2;
        args.epochs = 2;
        args.num_minibatches = 2;
        args.hidden_dim = 8;
        args.fc_dim = 8;
        args.eval_interval = 0;
        args.num_eval_envs = 2;
        args.num_eval_steps = 12;
        args.seed = 7;
        args
    }

    fn env() -> LogWrapper<RendezvousEnv> {
        LogWrapper::new(
            RendezvousEnv::new(RendezvousConfig {
                max_steps: 6,
                ..RendezvousConfig::default()
            })
            .unwrap(),
        )
    }

    fn params(agent: &ActorCriticRnn<TestBackend>) -> Vec<f32> {
        flatten_params::<TestBackend, _>(agent).unwrap()
    }

    fn collected_rollout(args: &Args) -> (ActorCriticConfig, Rollout) {
        let device = NdArrayDevice::Cpu;
        let env = env();
        let cfg = model_config(args, env.obs_dim(), env.num_actions());
        let venv = VecEnv::new(env, args.num_envs).unwrap();
        let agent = ActorCriticRnn::<NdArray<f32>>::new(&cfg, &device);
        let mut carry = RolloutCarry::reset(&venv, args.hidden_dim, StdRng::seed_from_u64(2));
        let mut collected = collect_rollout(
            &agent,
            &venv,
            &mut carry,
            args.rollout_length,
            ActionSelection::Sample,
            &device,
        )
        .unwrap();
        collected
            .rollout
            .compute_gae(&collected.last_values, args.gamma, args.gae_lambda, 1.0)
            .unwrap();
        (cfg, collected.rollout)
    }

    #[test]
    fn learning_rate_anneals_per_update_cycle() {
        let args = small_args();
        assert_eq!(learning_rate(&args, 0), args.lr);
        assert_eq!(learning_rate(&args, 3), args.lr);
        assert!((learning_rate(&args, 4) - args.lr * 0.5).abs() < 1e-12);

        let mut flat = small_args();
        flat.decay_learning_rates = false;
        assert_eq!(learning_rate(&flat, 100), flat.lr);
    }

    #[test]
    fn update_takes_one_step_per_minibatch_and_moves_parameters() {
        let device = NdArrayDevice::Cpu;
        let args = small_args();
        let (cfg, roll) = collected_rollout(&args);
        let mut state = init_train_state::<TestBackend>(&cfg, &args, &device);
        let before = params(&state.agent);

        let summary = PpoOptimizer::optimize_update(
            &roll,
            &args,
            0,
            true,
            &SingleReplica,
            &device,
            &mut StdRng::seed_from_u64(0),
            &mut state,
        )
        .unwrap();

        assert_eq!(state.step, 4);
        assert_eq!(summary.num_steps, 4);
        assert!(summary.grad_norm_sum.is_finite());
        assert!(params(&state.agent)
            .iter()
            .zip(&before)
            .any(|(a, b)| a != b));
    }

    #[test]
    fn single_minibatch_matches_manual_full_batch_step() {
        let device = NdArrayDevice::Cpu;
        let mut args = small_args();
        args.epochs = 1;
        args.num_minibatches = 1;
        let (cfg, roll) = collected_rollout(&args);

        let mut through_optimizer = init_train_state::<TestBackend>(&cfg, &args, &device);
        PpoOptimizer::optimize_update(
            &roll,
            &args,
            0,
            false,
            &SingleReplica,
            &device,
            &mut StdRng::seed_from_u64(1),
            &mut through_optimizer,
        )
        .unwrap();

        let mut manual = init_train_state::<TestBackend>(&cfg, &args, &device);
        let all_envs = (0..args.num_envs).collect::<Vec<_>>();
        let parts = minibatch_loss(&manual.agent, &roll.minibatch(&all_envs), loss_config(&args), &device);
        let mut grads = GradientsParams::from_grads(parts.total_loss.backward(), &manual.agent);
        clip_global_grad_norm::<TestBackend, _>(&manual.agent, &mut grads, args.max_grad_norm);
        manual.agent = manual
            .optim
            .step(learning_rate(&args, 0), manual.agent.clone(), grads);

        for (a, b) in params(&through_optimizer.agent).iter().zip(params(&manual.agent)) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn training_is_deterministic() {
        let device = NdArrayDevice::Cpu;
        let args = small_args();
        let run = || {
            let sink = RecordingMetricsSink::default();
            let outcome = train::<TestBackend, _>(&args, env(), 1, &sink, None, None, &device).unwrap();
            (params(&outcome.agent), sink.records())
        };

        let (params_a, records_a) = run();
        let (params_b, records_b) = run();
        assert_eq!(params_a, params_b);
        assert_eq!(records_a, records_b);
        assert_eq!(records_a.len(), 2);
        assert_eq!(records_a[1].env_steps, 64);
    }

    #[test]
    fn replicas_finish_with_identical_parameters() {
        let device = NdArrayDevice::Cpu;
        let mut args = small_args();
        args.num_minibatches = 1;
        let sink = RecordingMetricsSink::default();

        let outcome = train::<TestBackend, _>(&args, env(), 2, &sink, None, None, &device).unwrap();
        assert_eq!(outcome.checkpoint.step, args.num_updates * args.epochs);
        assert_eq!(sink.records().len(), args.num_updates);
    }

    #[test]
    fn uneven_shards_are_rejected() {
        let device = NdArrayDevice::Cpu;
        let args = small_args();
        let sink = RecordingMetricsSink::default();
        // 4 envs over 4 replicas leaves 1 env for 2 minibatches
        assert!(train::<TestBackend, _>(&args, env(), 4, &sink, None, None, &device).is_err());
    }

    #[test]
    fn checkpoint_restores_parameters_and_step() {
        let device = NdArrayDevice::Cpu;
        let args = small_args();
        let (cfg, roll) = collected_rollout(&args);
        let mut state = init_train_state::<TestBackend>(&cfg, &args, &device);
        PpoOptimizer::optimize_update(
            &roll,
            &args,
            0,
            false,
            &SingleReplica,
            &device,
            &mut StdRng::seed_from_u64(4),
            &mut state,
        )
        .unwrap();

        let store = MemoryCheckpointStore::default();
        store.save(&state.snapshot().unwrap()).unwrap();

        let other_cfg = ActorCriticConfig { seed: 99, ..cfg.clone() };
        let restored = init_train_state::<TestBackend>(&other_cfg, &args, &device)
            .restore(&store.load().unwrap(), &device)
            .unwrap();
        assert_eq!(restored.step, state.step);
        assert_eq!(params(&restored.agent), params(&state.agent));
    }

    #[test]
    fn evaluation_uses_the_saved_policy() {
        let device = NdArrayDevice::Cpu;
        let mut args = small_args();
        args.greedy_eval = true;
        let store = MemoryCheckpointStore::default();
        let train_sink = RecordingMetricsSink::default();
        let outcome =
            train::<TestBackend, _>(&args, env(), 1, &train_sink, Some(&store), None, &device).unwrap();

        let eval_sink = RecordingMetricsSink::default();
        let stats =
            run_evaluation::<NdArray<f32>, _>(&args, env(), &store.load().unwrap(), &eval_sink, &device)
                .unwrap();

        let venv = VecEnv::new(env(), args.num_eval_envs).unwrap();
        let direct = evaluate(
            &outcome.agent.valid(),
            &venv,
            args.num_eval_steps,
            ActionSelection::Greedy,
            args.seed.wrapping_add(EVAL_SEED_OFFSET),
            &device,
        )
        .unwrap();

        assert_eq!(stats, direct);
        assert_eq!(stats.env_steps, 24.0);
        let records = eval_sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].update, args.num_updates);
    }

    #[test]
    fn resumed_training_continues_the_schedule() {
        let device = NdArrayDevice::Cpu;
        let args = small_args();
        let sink = RecordingMetricsSink::default();
        let first = train::<TestBackend, _>(&args, env(), 1, &sink, None, None, &device).unwrap();

        let mut longer = small_args();
        longer.num_updates = 3;
        let resumed_sink = RecordingMetricsSink::default();
        let resumed = train::<TestBackend, _>(
            &longer,
            env(),
            1,
            &resumed_sink,
            None,
            Some(first.checkpoint),
            &device,
        )
        .unwrap();

        let updates = resumed_sink.records().iter().map(|m| m.update).collect::<Vec<_>>();
        assert_eq!(updates, vec![2]);
        assert_eq!(resumed.checkpoint.step, 3 * longer.epochs * longer.num_minibatches);
    }
}
