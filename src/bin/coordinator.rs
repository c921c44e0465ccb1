//! Standalone coordinator process: loads configuration, wires the
//! components via [`training_coordinator::build`], and drives a training
//! session against whatever `WorkerTransport` the deployment supplies.
//!
//! Grounded on `daa-cli/src/main.rs`'s config-load-then-default plus
//! `tracing_subscriber` init pattern. The real wire protocol to workers is
//! an external collaborator (spec.md's non-goals); this binary ships a
//! synthetic in-process transport so the coordinator can be exercised
//! standalone, the way `daa-cli start` brings up an orchestrator without
//! requiring a live QuDAG network to already exist.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use training_coordinator::{
    CheckpointSink, ContributionSink, CoordinatorConfig, GradientMeta, GradientSubmission,
    InMemoryCheckpointSink, LoggingContributionSink, ParameterSet, RewardCalculator, RoundComponents,
    WorkerStatus, WorkerTransport,
};

#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Adaptive coordinator for data-parallel SGD across a dynamic worker pool")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML). Defaults to built-in config when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,

    /// Number of synthetic workers to register.
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Number of training rounds to run before exiting.
    #[arg(long, default_value = "10")]
    rounds: u64,

    /// Size of each logical parameter vector in the demo model.
    #[arg(long, default_value = "16")]
    param_size: usize,

    /// Reward pool (integer minor units) distributed at the end of the run.
    #[arg(long, default_value = "1000000")]
    reward_pool: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = load_config(&cli)?;
    info!(
        aggregation = ?config.aggregation_strategy,
        selection = ?config.selection_strategy,
        "starting coordinator"
    );

    let checkpoint_sink: Arc<dyn CheckpointSink> = Arc::new(InMemoryCheckpointSink::new());
    let contribution_sink: Arc<dyn ContributionSink> = Arc::new(LoggingContributionSink);
    let components = training_coordinator::build(config.clone(), checkpoint_sink, contribution_sink);

    for i in 0..cli.workers {
        let worker = format!("worker-{i}");
        components.registry.add(worker.clone(), format!("addr-{i}"), None);
        components.registry.update_status(&worker, WorkerStatus::Ready);
    }

    let mut params = ParameterSet::new(vec![(
        "w".to_string(),
        vec![0.0; cli.param_size],
        vec![cli.param_size],
    )]);

    let (tx, mut rx) = mpsc::channel(128);
    let transport = SyntheticTransport {
        tx,
        param_size: cli.param_size,
    };

    for round in 1..=cli.rounds {
        match components.run_round(round, &mut params, &transport, &mut rx).await {
            Ok(summary) => info!(
                round = summary.round,
                participating = summary.participating.len(),
                new_version = summary.new_version,
                rollback = ?summary.rollback,
                "round complete"
            ),
            Err(err) => {
                tracing::error!(round, %err, "round failed");
                continue;
            }
        }
    }

    let contributions = components.contribution.snapshot_all();
    if !contributions.is_empty() {
        let calculator = RewardCalculator::new(config.reward_strategy);
        let distribution = calculator.distribute(cli.reward_pool, &contributions)?;
        info!(
            total_paid = distribution.total_paid,
            total_pool = distribution.total_pool,
            "reward distribution complete"
        );
        components
            .contribution_sink
            .submit_rewards(cli.rounds, &distribution)
            .await?;
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("coordinator={level},training_coordinator={level}"))
        .with_target(false)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<CoordinatorConfig> {
    match &cli.config {
        Some(path) => CoordinatorConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            if cli.verbose {
                info!("no --config given, using built-in defaults");
            }
            Ok(CoordinatorConfig::default())
        }
    }
}

/// In-process stand-in for the real worker wire protocol: "trains" by
/// perturbing the received parameters with noise proportional to a fixed
/// local learning signal, and reports the result back over the round's
/// submission channel. Exists only so this binary has something to drive
/// end to end without a live worker fleet.
struct SyntheticTransport {
    tx: mpsc::Sender<GradientSubmission>,
    param_size: usize,
}

#[async_trait]
impl WorkerTransport for SyntheticTransport {
    async fn dispatch(
        &self,
        worker: &str,
        round: u64,
        batch_size: u32,
        _params: &ParameterSet,
    ) -> training_coordinator::Result<()> {
        let worker = worker.to_string();
        let tx = self.tx.clone();
        let param_size = self.param_size;
        tokio::spawn(async move {
            let mut rng = rand::thread_rng();
            let grad: Vec<f32> = (0..param_size).map(|_| rng.gen_range(-0.05..0.05)).collect();
            let mut grads = std::collections::HashMap::new();
            grads.insert("w".to_string(), grad);
            let submission = GradientSubmission {
                round,
                worker,
                grads,
                meta: GradientMeta {
                    samples: Some(batch_size as u64),
                    local_loss: Some(rng.gen_range(0.1..1.0)),
                    compute_time_seconds: Some(rng.gen_range(0.01..0.2)),
                    gradient_norm: None,
                },
            };
            let _ = tx.send(submission).await;
        });
        Ok(())
    }
}
