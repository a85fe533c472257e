use anyhow::{bail, Result};
use burn::backend::autodiff::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use burn_ndarray::{NdArray, NdArrayDevice};
use tracing::info;
use tracing_subscriber::EnvFilter;

use marl_ppo::algorithms::ppo::train;
use marl_ppo::common::config::{Args, DeviceType, ReplicaLayout, RunMode};
use marl_ppo::common::runtime::checkpoint::{CheckpointStore, FileCheckpointStore};
use marl_ppo::common::telemetry::{DashboardFormatter, MetricRegistry, TracingMetricsSink};
use marl_ppo::env::{LogWrapper, RendezvousEnv};

fn run<B: AutodiffBackend>(args: &Args, layout: ReplicaLayout, device: B::Device) -> Result<()> {
    let env = LogWrapper::new(RendezvousEnv::new(args.env_config())?);
    let sink = TracingMetricsSink;

    match args.mode {
        RunMode::Train => {
            let store = args
                .checkpoint_dir
                .as_ref()
                .map(|dir| FileCheckpointStore::new(dir.clone()));
            let resume = args
                .resume_from
                .as_ref()
                .map(|dir| FileCheckpointStore::new(dir.clone()).load())
                .transpose()?;

            train::train::<B, _>(
                args,
                env,
                layout.world_size,
                &sink,
                store.as_ref().map(|s| s as &dyn CheckpointStore),
                resume,
                &device,
            )?;
            if let Some(store) = store.as_ref() {
                info!(category = "MISC", checkpoint_dir = %store.dir().display(), "checkpoint_saved");
            }
        }
        RunMode::Eval => {
            let Some(dir) = args.resume_from.as_ref() else {
                bail!("--mode eval needs --resume-from <checkpoint dir>");
            };
            let checkpoint = FileCheckpointStore::new(dir.clone()).load()?;
            train::run_evaluation::<B::InnerBackend, _>(args, env, &checkpoint, &sink, &device)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::load()?;

    let formatter = DashboardFormatter::new(MetricRegistry::with_defaults().with_env_overrides());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_tracing_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(false)
        .without_time()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .event_format(formatter)
        .try_init();

    let layout = ReplicaLayout::from_env_or_args(&args)?;

    match args.device_type {
        DeviceType::Cpu => run::<Autodiff<NdArray<f32>>>(&args, layout, NdArrayDevice::Cpu),
        #[cfg(feature = "cuda")]
        DeviceType::Cuda => {
            use burn::backend::cuda::{Cuda, CudaDevice};
            run::<Autodiff<Cuda<f32, i32>>>(&args, layout, CudaDevice::new(args.cuda_device))
        }
        #[cfg(not(feature = "cuda"))]
        DeviceType::Cuda => bail!("this binary was built without the `cuda` feature"),
    }
}
