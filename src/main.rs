use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dagline_client::{run_event_stream, EventStreamConfig, RestClient, RunProjection, StreamNotice};
use dagline_core::config::AppConfig;
use dagline_core::event::EventBus;
use dagline_core::types::RunId;
use dagline_engine::{RunLauncher, WorkflowSpec};
use dagline_gateway::GatewayServer;
use dagline_store::{MemoryRunStore, SqliteRunStore};

#[derive(Parser)]
#[command(name = "dagline", version, about = "DAG run lifecycle gateway and live projection")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dagline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST + WebSocket gateway
    Serve,
    /// Validate a workflow template and print its execution order
    Validate {
        /// Path to a workflow YAML file
        workflow: PathBuf,
    },
    /// Show the effective configuration
    Config,
    /// Follow a run live in the terminal
    Watch {
        /// Run id to follow
        run_id: String,
        /// Gateway base URL
        #[arg(long, env = "DAGLINE_API_URL", default_value = "http://127.0.0.1:8787")]
        api_url: String,
    },
}

fn init_logging() {
    // LOG_LEVEL feeds the filter; defaults to info
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve(&cli.config).await,
        Commands::Validate { workflow } => validate(&workflow),
        Commands::Config => show_config(&cli.config),
        Commands::Watch { run_id, api_url } => watch(&run_id, &api_url).await,
    }
}

async fn serve(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(config_path)?;

    let store = Arc::new(MemoryRunStore::new());
    let bus = Arc::new(EventBus::new(config.gateway.event_buffer));
    let persist_store = match SqliteRunStore::open(std::path::Path::new(&config.store.persist_path)) {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!(error = %e, "Persistent store unavailable, persist flag will be ignored");
            None
        }
    };
    let launcher = Arc::new(RunLauncher::new(
        store.clone(),
        bus.clone(),
        &config.engine,
        &config.store,
        persist_store,
    ));

    let server = GatewayServer::new(
        config.gateway.clone(),
        store,
        bus,
        launcher,
        config.engine.engine_type,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    server.run(shutdown).await
}

fn validate(workflow: &PathBuf) -> anyhow::Result<()> {
    let spec = WorkflowSpec::load(workflow)?;
    let order = spec.topological_order()?;
    println!("workflow: {}", spec.dag_id);
    if let Some(desc) = &spec.description {
        println!("description: {desc}");
    }
    println!("steps ({}):", spec.steps.len());
    for id in order {
        let step = spec.step(&id).expect("ordered step exists");
        if step.depends_on.is_empty() {
            println!("  {id}");
        } else {
            println!("  {id}  (after: {})", step.depends_on.join(", "));
        }
    }
    Ok(())
}

fn show_config(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn watch(run_id: &str, api_url: &str) -> anyhow::Result<()> {
    let run_id = RunId::from_string(run_id);
    let client = RestClient::new(api_url)?;

    let snapshot = match client.get_run(&run_id).await? {
        Some(run) => run,
        None => {
            error!(run_id = %run_id, "Run not found");
            anyhow::bail!("run not found: {run_id}");
        }
    };
    let mut projection = RunProjection::new(snapshot);
    print_state(&projection);

    if projection.run().status.is_terminal() {
        return Ok(());
    }

    let ws_url = format!(
        "{}/ws",
        api_url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1)
    );
    let config = EventStreamConfig::new(ws_url).with_run(run_id.clone());
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let stream = tokio::spawn(run_event_stream(config, tx, shutdown.clone()));

    while let Some(notice) = rx.recv().await {
        match notice {
            StreamNotice::Connected => {
                // Refresh: events may have been missed while disconnected
                if let Some(run) = client.get_run(&run_id).await? {
                    projection = RunProjection::new(run);
                    print_state(&projection);
                }
            }
            StreamNotice::Event(envelope) => {
                projection.apply(&envelope);
                print_state(&projection);
                if projection.run().status.is_terminal() {
                    break;
                }
            }
            StreamNotice::ConnectionError(e) => {
                warn!(error = %e, "Stream connection error");
            }
            StreamNotice::Closed => break,
        }
    }

    shutdown.cancel();
    let _ = stream.await;

    let run = projection.run();
    println!("final status: {}", run.status);
    Ok(())
}

fn print_state(projection: &RunProjection) {
    let run = projection.run();
    let metrics = projection.metrics();
    println!(
        "[{}] {}  {}/{} done  {:.0}%",
        run.status,
        run.dag_id,
        metrics.completed_steps + metrics.failed_steps,
        metrics.total_steps,
        metrics.completion_percentage,
    );
    for step in &run.steps {
        println!("  {:<10} {}", step.status.to_string(), step.id);
    }
}
