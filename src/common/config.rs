use anyhow::{bail, Context, Result};
use clap::{parser::ValueSource, ArgAction, ArgMatches, CommandFactory, Parser, ValueEnum};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::env::{RendezvousConfig, RewardMode};

#[derive(Copy, Clone, Debug, ValueEnum, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cuda,
    Cpu,
}

#[derive(Copy, Clone, Debug, ValueEnum, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Train,
    Eval,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ppo")]
pub struct Args {
    /// Optional YAML config file path.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Train a policy, or evaluate one restored from --resume-from
    #[arg(long, value_enum, default_value_t = RunMode::Train)]
    pub mode: RunMode,

    /// Number of cooperating agents per environment
    #[arg(long, default_value_t = 2)]
    pub num_agents: usize,

    /// Number of parallel envs across all replicas
    #[arg(long, default_value_t = 16)]
    pub num_envs: usize,

    /// Episode step limit
    #[arg(long, default_value_t = 100)]
    pub max_episode_steps: u32,

    /// Reward shaping of the rendezvous task
    #[arg(long, value_enum, default_value_t = RewardMode::Distance)]
    pub reward_mode: RewardMode,

    /// Outward drift rate of the agents' dynamics
    #[arg(long, default_value_t = 0.5)]
    pub drift: f32,

    /// Dynamics noise scale
    #[arg(long, default_value_t = 0.02)]
    pub noise: f32,

    /// PPO rollout length (T)
    #[arg(long, default_value_t = 128)]
    pub rollout_length: usize,

    /// Total PPO updates
    #[arg(long, default_value_t = 200)]
    pub num_updates: usize,

    /// If set, overrides num_updates with total_timesteps / rollout_length / num_envs
    #[arg(long)]
    pub total_timesteps: Option<usize>,

    /// PPO epochs per update
    #[arg(long, default_value_t = 4)]
    pub epochs: usize,

    /// Number of minibatches per epoch (envs per replica must be divisible by this)
    #[arg(long, default_value_t = 4)]
    pub num_minibatches: usize,

    /// Discount gamma
    #[arg(long, default_value_t = 0.99)]
    pub gamma: f32,

    /// GAE lambda
    #[arg(long, default_value_t = 0.95)]
    pub gae_lambda: f32,

    /// PPO clip epsilon
    #[arg(long, default_value_t = 0.2)]
    pub clip_eps: f32,

    /// Divide clip epsilon by the number of agents
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub scale_clip_eps: bool,

    /// Clip the value prediction around the rollout value
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub clip_value_loss: bool,

    /// Entropy coefficient
    #[arg(long, default_value_t = 0.01)]
    pub ent_coef: f32,

    /// Value loss coefficient
    #[arg(long, default_value_t = 0.5)]
    pub vf_coef: f32,

    /// Learning rate (Adam)
    #[arg(long, default_value_t = 2.5e-4)]
    pub lr: f64,

    /// Adam epsilon
    #[arg(long, default_value_t = 1e-5)]
    pub adam_eps: f32,

    /// Global gradient clipping threshold (L2 norm)
    #[arg(long, default_value_t = 0.5)]
    pub max_grad_norm: f32,

    /// Linearly decay the learning rate to zero over all optimizer steps
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub decay_learning_rates: bool,

    /// Reward scaling (multiply env reward by this before GAE)
    #[arg(long, default_value_t = 1.0)]
    pub reward_scale: f32,

    /// GRU hidden size
    #[arg(long, default_value_t = 128)]
    pub hidden_dim: usize,

    /// Width of the policy and value head hidden layers
    #[arg(long, default_value_t = 128)]
    pub fc_dim: usize,

    /// RNG seed
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Number of updates between evaluations (0 disables)
    #[arg(long, default_value_t = 20)]
    pub eval_interval: usize,

    /// Number of environments used for evaluation
    #[arg(long, default_value_t = 16)]
    pub num_eval_envs: usize,

    /// Environment steps per evaluation
    #[arg(long, default_value_t = 200)]
    pub num_eval_steps: usize,

    /// Evaluate with argmax actions instead of sampling
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub greedy_eval: bool,

    /// CUDA device index (0 = cuda:0)
    #[arg(long, default_value_t = 0)]
    pub cuda_device: usize,

    /// Device backend to use: cuda or cpu
    #[arg(long, value_enum, default_value_t = DeviceType::Cpu)]
    pub device_type: DeviceType,

    /// Data-parallel replicas; WORLD_SIZE in the environment takes precedence
    #[arg(long, default_value_t = 1)]
    pub num_replicas: usize,

    /// Directory the final checkpoint is written to
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Checkpoint directory to restore parameters and optimizer state from
    #[arg(long)]
    pub resume_from: Option<PathBuf>,

    /// Base tracing level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Show backend (CubeCL/CUDA) context logs in dashboard output.
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub backend_logs_visible: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            mode: RunMode::Train,
            num_agents: 2,
            num_envs: 16,
            max_episode_steps: 100,
            reward_mode: RewardMode::Distance,
            drift: 0.5,
            noise: 0.02,
            rollout_length: 128,
            num_updates: 200,
            total_timesteps: None,
            epochs: 4,
            num_minibatches: 4,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_eps: 0.2,
            scale_clip_eps: false,
            clip_value_loss: true,
            ent_coef: 0.01,
            vf_coef: 0.5,
            lr: 2.5e-4,
            adam_eps: 1e-5,
            max_grad_norm: 0.5,
            decay_learning_rates: true,
            reward_scale: 1.0,
            hidden_dim: 128,
            fc_dim: 128,
            seed: 0,
            eval_interval: 20,
            num_eval_envs: 16,
            num_eval_steps: 200,
            greedy_eval: false,
            cuda_device: 0,
            device_type: DeviceType::Cpu,
            num_replicas: 1,
            checkpoint_dir: None,
            resume_from: None,
            log_level: "info".to_string(),
            backend_logs_visible: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    mode: Option<RunMode>,
    environment: EnvironmentConfig,
    #[serde(alias = "ppo_core")]
    training_core: TrainingCoreConfig,
    optimization: OptimizationConfig,
    architecture: ArchitectureConfig,
    evaluation: EvaluationConfig,
    hardware: HardwareConfig,
    checkpoint: CheckpointConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct LoggingConfig {
    log_level: Option<String>,
    backend_logs_visible: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct EnvironmentConfig {
    num_agents: Option<usize>,
    num_envs: Option<usize>,
    max_episode_steps: Option<u32>,
    reward_mode: Option<String>,
    drift: Option<f32>,
    noise: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct TrainingCoreConfig {
    rollout_length: Option<usize>,
    num_updates: Option<usize>,
    total_timesteps: Option<usize>,
    epochs: Option<usize>,
    num_minibatches: Option<usize>,
    gamma: Option<f32>,
    gae_lambda: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct OptimizationConfig {
    lr: Option<f64>,
    adam_eps: Option<f32>,
    max_grad_norm: Option<f32>,
    clip_eps: Option<f32>,
    scale_clip_eps: Option<bool>,
    clip_value_loss: Option<bool>,
    ent_coef: Option<f32>,
    vf_coef: Option<f32>,
    decay_learning_rates: Option<bool>,
    reward_scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ArchitectureConfig {
    hidden_dim: Option<usize>,
    fc_dim: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct EvaluationConfig {
    eval_interval: Option<usize>,
    num_eval_envs: Option<usize>,
    num_eval_steps: Option<usize>,
    greedy_eval: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct HardwareConfig {
    device_type: Option<DeviceType>,
    cuda_device: Option<usize>,
    num_replicas: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct CheckpointConfig {
    checkpoint_dir: Option<PathBuf>,
    resume_from: Option<PathBuf>,
}

impl Args {
    pub fn default_tracing_filter(&self) -> String {
        let mut directives = vec![self.log_level.trim().to_string()];

        if !self.backend_logs_visible {
            directives.push("cubecl_cuda=off".to_string());
            directives.push("cubecl_runtime=off".to_string());
        }

        directives.join(",")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(std::env::args_os())
    }

    pub fn load_from<I, T>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let argv = argv.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let cli_args = Self::try_parse_from(&argv)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("failed to parse CLI arguments")?;
        let matches = Self::command()
            .try_get_matches_from(&argv)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("failed to parse CLI arguments")?;

        let mut merged = Self::default();

        if let Some(config_path) = cli_args.config.as_deref() {
            let file_config = Self::load_file_config(config_path)?;
            merged.apply_config_file(file_config)?;
        }

        merged.apply_cli_overrides(&cli_args, &matches);
        merged.config = cli_args.config;

        Ok(merged)
    }

    fn load_file_config(path: &Path) -> Result<FileConfig> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to get current working directory")?
                .join(path)
        };

        let content = std::fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read config file at {}", resolved.display()))?;

        serde_yaml::from_str::<FileConfig>(&content)
            .with_context(|| format!("failed to parse YAML config at {}", resolved.display()))
    }

    fn apply_config_file(&mut self, file: FileConfig) -> Result<()> {
        macro_rules! set_if_some {
            ($field:ident, $value:expr) => {
                if let Some(value) = $value {
                    self.$field = value;
                }
            };
        }

        set_if_some!(mode, file.mode);

        set_if_some!(num_agents, file.environment.num_agents);
        set_if_some!(num_envs, file.environment.num_envs);
        set_if_some!(max_episode_steps, file.environment.max_episode_steps);
        if let Some(raw) = file.environment.reward_mode {
            self.reward_mode = raw.parse::<RewardMode>()?;
        }
        set_if_some!(drift, file.environment.drift);
        set_if_some!(noise, file.environment.noise);

        set_if_some!(rollout_length, file.training_core.rollout_length);
        set_if_some!(num_updates, file.training_core.num_updates);
        if let Some(value) = file.training_core.total_timesteps {
            self.total_timesteps = Some(value);
        }
        set_if_some!(epochs, file.training_core.epochs);
        set_if_some!(num_minibatches, file.training_core.num_minibatches);
        set_if_some!(gamma, file.training_core.gamma);
        set_if_some!(gae_lambda, file.training_core.gae_lambda);

        set_if_some!(lr, file.optimization.lr);
        set_if_some!(adam_eps, file.optimization.adam_eps);
        set_if_some!(max_grad_norm, file.optimization.max_grad_norm);
        set_if_some!(clip_eps, file.optimization.clip_eps);
        set_if_some!(scale_clip_eps, file.optimization.scale_clip_eps);
        set_if_some!(clip_value_loss, file.optimization.clip_value_loss);
        set_if_some!(ent_coef, file.optimization.ent_coef);
        set_if_some!(vf_coef, file.optimization.vf_coef);
        set_if_some!(decay_learning_rates, file.optimization.decay_learning_rates);
        set_if_some!(reward_scale, file.optimization.reward_scale);

        set_if_some!(hidden_dim, file.architecture.hidden_dim);
        set_if_some!(fc_dim, file.architecture.fc_dim);
        set_if_some!(seed, file.architecture.seed);

        set_if_some!(eval_interval, file.evaluation.eval_interval);
        set_if_some!(num_eval_envs, file.evaluation.num_eval_envs);
        set_if_some!(num_eval_steps, file.evaluation.num_eval_steps);
        set_if_some!(greedy_eval, file.evaluation.greedy_eval);

        set_if_some!(device_type, file.hardware.device_type);
        set_if_some!(cuda_device, file.hardware.cuda_device);
        set_if_some!(num_replicas, file.hardware.num_replicas);

        if let Some(value) = file.checkpoint.checkpoint_dir {
            self.checkpoint_dir = Some(value);
        }
        if let Some(value) = file.checkpoint.resume_from {
            self.resume_from = Some(value);
        }

        set_if_some!(log_level, file.logging.log_level);
        set_if_some!(backend_logs_visible, file.logging.backend_logs_visible);
        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli: &Self, matches: &ArgMatches) {
        macro_rules! set_if_cli {
            ($field:ident, $arg_name:literal) => {
                if Self::provided_on_cli(matches, $arg_name) {
                    self.$field = cli.$field.clone();
                }
            };
        }

        set_if_cli!(mode, "mode");

        set_if_cli!(num_agents, "num_agents");
        set_if_cli!(num_envs, "num_envs");
        set_if_cli!(max_episode_steps, "max_episode_steps");
        set_if_cli!(reward_mode, "reward_mode");
        set_if_cli!(drift, "drift");
        set_if_cli!(noise, "noise");

        set_if_cli!(rollout_length, "rollout_length");
        set_if_cli!(num_updates, "num_updates");
        set_if_cli!(total_timesteps, "total_timesteps");
        set_if_cli!(epochs, "epochs");
        set_if_cli!(num_minibatches, "num_minibatches");
        set_if_cli!(gamma, "gamma");
        set_if_cli!(gae_lambda, "gae_lambda");

        set_if_cli!(lr, "lr");
        set_if_cli!(adam_eps, "adam_eps");
        set_if_cli!(max_grad_norm, "max_grad_norm");
        set_if_cli!(clip_eps, "clip_eps");
        set_if_cli!(scale_clip_eps, "scale_clip_eps");
        set_if_cli!(clip_value_loss, "clip_value_loss");
        set_if_cli!(ent_coef, "ent_coef");
        set_if_cli!(vf_coef, "vf_coef");
        set_if_cli!(decay_learning_rates, "decay_learning_rates");
        set_if_cli!(reward_scale, "reward_scale");

        set_if_cli!(hidden_dim, "hidden_dim");
        set_if_cli!(fc_dim, "fc_dim");
        set_if_cli!(seed, "seed");

        set_if_cli!(eval_interval, "eval_interval");
        set_if_cli!(num_eval_envs, "num_eval_envs");
        set_if_cli!(num_eval_steps, "num_eval_steps");
        set_if_cli!(greedy_eval, "greedy_eval");

        set_if_cli!(device_type, "device_type");
        set_if_cli!(cuda_device, "cuda_device");
        set_if_cli!(num_replicas, "num_replicas");

        set_if_cli!(checkpoint_dir, "checkpoint_dir");
        set_if_cli!(resume_from, "resume_from");

        set_if_cli!(log_level, "log_level");
        set_if_cli!(backend_logs_visible, "backend_logs_visible");
    }

    fn provided_on_cli(matches: &ArgMatches, arg_name: &str) -> bool {
        matches.value_source(arg_name) == Some(ValueSource::CommandLine)
    }

    /// `total_timesteps / rollout_length / num_envs` when a step budget is given.
    pub fn resolved_num_updates(&self) -> usize {
        match self.total_timesteps {
            Some(total) => total / self.rollout_length.max(1) / self.num_envs.max(1),
            None => self.num_updates,
        }
    }

    /// Clip range after optional division by the number of agents.
    pub fn effective_clip_eps(&self) -> f32 {
        if self.scale_clip_eps {
            self.clip_eps / self.num_agents.max(1) as f32
        } else {
            self.clip_eps
        }
    }

    pub fn env_config(&self) -> RendezvousConfig {
        RendezvousConfig {
            num_agents: self.num_agents,
            max_steps: self.max_episode_steps,
            drift: self.drift,
            noise: self.noise,
            reward_mode: self.reward_mode,
            ..RendezvousConfig::default()
        }
    }

    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.num_agents == 0 {
            bail!("num_agents must be > 0");
        }
        if self.num_envs == 0 || self.rollout_length == 0 {
            bail!("num_envs and rollout_length must be > 0");
        }
        if self.epochs == 0 || self.num_minibatches == 0 {
            bail!("epochs and num_minibatches must be > 0");
        }
        if world_size == 0 || self.num_envs % world_size != 0 {
            bail!(
                "num_envs = {} must be divisible by world_size = {world_size}",
                self.num_envs
            );
        }
        let envs_per_replica = self.num_envs / world_size;
        if envs_per_replica % self.num_minibatches != 0 {
            bail!(
                "envs per replica = {envs_per_replica} must be divisible by num_minibatches = {}",
                self.num_minibatches
            );
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.gae_lambda) {
            bail!("gamma and gae_lambda must lie in [0, 1]");
        }
        if self.clip_eps <= 0.0 {
            bail!("clip_eps must be > 0");
        }
        if self.hidden_dim == 0 || self.fc_dim == 0 {
            bail!("hidden_dim and fc_dim must be > 0");
        }
        if self.resolved_num_updates() == 0 && self.mode == RunMode::Train {
            bail!("training needs at least one update");
        }
        Ok(())
    }
}

/// How environments are split over in-process replicas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplicaLayout {
    pub world_size: usize,
    pub envs_per_replica: usize,
}

impl ReplicaLayout {
    pub fn from_env_or_args(args: &Args) -> Result<Self> {
        let world_size = match std::env::var("WORLD_SIZE") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid WORLD_SIZE {raw:?}"))?,
            Err(_) => args.num_replicas,
        };
        Self::new(args, world_size)
    }

    pub fn new(args: &Args, world_size: usize) -> Result<Self> {
        args.validate(world_size)?;
        Ok(Self {
            world_size,
            envs_per_replica: args.num_envs / world_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        let mut args = Args::default();
        args.num_envs = 8;
        args.num_minibatches = 2;
        args
    }

    #[test]
    fn layout_requires_even_shards() {
        let args = base_args();
        assert_eq!(
            ReplicaLayout::new(&args, 2).unwrap(),
            ReplicaLayout {
                world_size: 2,
                envs_per_replica: 4
            }
        );
        assert!(ReplicaLayout::new(&args, 3).is_err());
        // 8 / 8 = 1 env per replica cannot be split into 2 minibatches
        assert!(ReplicaLayout::new(&args, 8).is_err());
    }

    #[test]
    fn validate_rejects_bad_discount() {
        let mut args = base_args();
        args.gamma = 1.5;
        assert!(args.validate(1).is_err());
    }

    #[test]
    fn total_timesteps_overrides_num_updates() {
        let mut args = base_args();
        args.rollout_length = 10;
        args.total_timesteps = Some(1_000);
        assert_eq!(args.resolved_num_updates(), 12);
    }

    #[test]
    fn scaled_clip_divides_by_agents() {
        let mut args = base_args();
        args.num_agents = 4;
        args.scale_clip_eps = true;
        assert!((args.effective_clip_eps() - 0.05).abs() < 1e-7);
    }

    #[test]
    fn cli_overrides_file_values() {
        let path = std::env::temp_dir().join(format!("marl_ppo_cfg_{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "environment:\n  num_envs: 32\n  reward_mode: sparse\noptimization:\n  lr: 0.001\n",
        )
        .unwrap();

        let args = Args::load_from([
            "ppo",
            "--config",
            path.to_str().unwrap(),
            "--num-envs",
            "12",
        ])
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(args.num_envs, 12);
        assert_eq!(args.reward_mode, RewardMode::Sparse);
        assert!((args.lr - 0.001).abs() < 1e-12);
        assert_eq!(args.rollout_length, 128);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let path =
            std::env::temp_dir().join(format!("marl_ppo_bad_cfg_{}.yaml", std::process::id()));
        std::fs::write(&path, "environment:\n  planets: 3\n").unwrap();

        let result = Args::load_from(["ppo", "--config", path.to_str().unwrap()]);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
