use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use session_timeline::checkpoint::{CheckpointStore, ToolClassifier};
use session_timeline::config::{ConsoleConfig, resolve_effective_config};
use session_timeline::launcher::{ExecutionLauncher, LoggingLauncher};
use session_timeline::queue::ExecutionQueue;
use session_timeline::replay::replay_transcript;
use session_timeline::runner::SessionRunner;
use session_timeline::server::{self, AppState};
use session_timeline::storage::SqliteBackend;
use session_timeline::timeline::TimelineManager;

#[derive(Debug, Parser)]
#[command(name = "session_timeline")]
#[command(about = "Session log reconciliation and checkpoint timeline service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve session state and timeline operations over HTTP.
    Serve {
        #[arg(long)]
        listen: Option<String>,
        /// sqlite URL, e.g. sqlite:///tmp/timeline.db
        #[arg(long)]
        db: Option<String>,
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Expose Prometheus metrics on this address.
        #[arg(long)]
        metrics_listen: Option<String>,
        #[arg(long)]
        quiescence_ms: Option<u64>,
    },
    /// Reconcile a JSONL transcript and print a summary.
    Replay { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen, db, config, metrics_listen, quiescence_ms } => {
            let file = match &config {
                Some(path) => ConsoleConfig::load_file(path)?,
                None => ConsoleConfig::default(),
            };
            let env = ConsoleConfig::from_env()?;
            let flags = ConsoleConfig { database_url: db, listen, metrics_listen, quiescence_ms, ..ConsoleConfig::default() };
            let eff = resolve_effective_config(&file, &env, &flags)?;

            if let Some(addr) = eff.metrics_listen {
                PrometheusBuilder::new().with_http_listener(addr).install().context("installing metrics exporter")?;
                info!(%addr, "metrics exporter listening");
            }

            let backend = SqliteBackend::initialize(eff.database_url.clone()).await.context("opening database")?;
            let store = CheckpointStore::new(
                Arc::new(backend),
                ToolClassifier::from_config(&eff.smart_policy),
                eff.default_checkpoint,
            );
            let timeline = Arc::new(TimelineManager::new(Arc::new(store)));
            let launcher: Arc<dyn ExecutionLauncher> = Arc::new(LoggingLauncher);
            let runner = Arc::new(SessionRunner::new(timeline.clone(), launcher.clone()));
            let queue = Arc::new(ExecutionQueue::new(launcher, eff.quiescence_delay));
            let _driver = queue.spawn_driver(runner.activity());

            let state = AppState { timeline, queue, runner, keep_count: eff.checkpoint_keep_count };
            let listener = tokio::net::TcpListener::bind(eff.listen).await?;
            server::serve(listener, state, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                info!("shutting down");
            })
            .await?;
        }
        Commands::Replay { file } => {
            let text = tokio::fs::read_to_string(&file).await.with_context(|| format!("reading {}", file.display()))?;
            let summary = replay_transcript(&text);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
