use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowrun_core::traits::RecordSource;
use flowrun_core::{
    AppConfig, Edge, EventBus, ExecutionConfig, ExecutionStatus, FlowConfig, FlowEvent, JobId, Node,
};
use flowrun_engine::{
    CleanOutput, FlowRunner, FlowService, GraphCompiler, GuardrailRegistry, HttpNodeExecutor,
    OutputFiles, RunLogger, StartRequest,
};
use flowrun_gateway::GatewayServer;
use flowrun_store::SqliteStore;

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Graph workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve,
    /// Run a flow file once and stream its events
    Run {
        /// Flow definition (JSON with nodes, edges, flow_config)
        #[arg(long)]
        flow: PathBuf,
        /// Job id (generated if not provided)
        #[arg(long)]
        job_id: Option<String>,
        /// Initial flow state as a JSON object
        #[arg(long)]
        inputs: Option<String>,
    },
    /// Compile a flow file and print its layers
    Validate {
        #[arg(long)]
        flow: PathBuf,
    },
    /// Print the persisted events of a job
    History {
        #[arg(long)]
        job_id: String,
        #[arg(long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// On-disk flow definition.
#[derive(Deserialize)]
struct FlowFile {
    #[serde(default)]
    name: Option<String>,
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    flow_config: FlowConfig,
}

impl FlowFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flow file {}", path.display()))?;
        let flow = serde_json::from_str(&content)
            .with_context(|| format!("Invalid flow file {}", path.display()))?;
        Ok(flow)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowrun=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowrun", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { flow } => {
            let file = FlowFile::load(&flow)?;
            let plan = GraphCompiler::new()
                .allow_tagged_loops(config.engine.allow_tagged_loops)
                .compile(&file.nodes, &file.edges, &file.flow_config)?;
            println!(
                "{}: {} node(s), {} layer(s)",
                file.name.as_deref().unwrap_or("flow"),
                plan.len(),
                plan.layers().len()
            );
            for (i, layer) in plan.layers().iter().enumerate() {
                println!("  layer {}: {}", i, layer.join(", "));
            }
        }
        Commands::History {
            job_id,
            limit,
            offset,
        } => {
            let store = Arc::new(SqliteStore::open(&config.database_path())?);
            let bus = EventBus::new(config.events.clone(), store);
            let events = bus.history(&JobId::from_str(&job_id), limit, offset).await?;
            if events.is_empty() {
                println!("No events for job {}", job_id);
            }
            for event in &events {
                println!(
                    "[{}] {} {}",
                    event.sequence,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.content
                );
            }
            bus.shutdown().await;
        }
        Commands::Serve => {
            let service = build_service(&config)?;
            let server = GatewayServer::new(config.gateway.clone(), service.clone());

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
            service.shutdown().await;
        }
        Commands::Run {
            flow,
            job_id,
            inputs,
        } => {
            let file = FlowFile::load(&flow)?;
            let inputs = match inputs {
                Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw)? {
                    serde_json::Value::Object(map) => map,
                    _ => bail!("--inputs must be a JSON object"),
                },
                None => serde_json::Map::new(),
            };
            let service = build_service(&config)?;
            let status = run_flow(&service, file, job_id, inputs).await;
            service.shutdown().await;
            let status = status?;
            if status == ExecutionStatus::Failed {
                bail!("execution failed");
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn build_service(config: &AppConfig) -> anyhow::Result<Arc<FlowService>> {
    let Some(executor_config) = &config.executor else {
        bail!("No [executor] section configured; set executor.endpoint in the config file");
    };
    let executor = Arc::new(HttpNodeExecutor::new(executor_config)?);

    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    let bus = Arc::new(EventBus::new(config.events.clone(), store.clone()));
    let records: Arc<dyn RecordSource> = store.clone();
    let guardrails = Arc::new(GuardrailRegistry::with_builtins(Some(records)));

    let mut runner = FlowRunner::new(executor, store.clone(), bus, guardrails);
    if config.log.enabled {
        runner = runner.with_callback(Arc::new(RunLogger::new(config.log_dir())));
    }
    if let Some(dir) = config.output_dir() {
        runner = runner.with_callback(Arc::new(OutputFiles::new(dir)));
    }
    runner = runner.with_callback(Arc::new(CleanOutput));

    info!(
        executor = %executor_config.endpoint,
        database = %config.database_path().display(),
        "Flow service ready"
    );
    Ok(Arc::new(FlowService::new(
        runner,
        store.clone(),
        store,
        config.engine.clone(),
    )))
}

async fn run_flow(
    service: &FlowService,
    file: FlowFile,
    job_id: Option<String>,
    inputs: serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<ExecutionStatus> {
    let job_id = job_id.map(|j| JobId::from_str(&j)).unwrap_or_default();
    let mut events = service.subscribe(&job_id);

    let request = StartRequest {
        flow_id: None,
        job_id: Some(job_id.clone()),
        config: ExecutionConfig {
            inputs,
            flow_name: file.name,
            nodes: file.nodes,
            edges: file.edges,
            flow_config: Some(file.flow_config),
            ..ExecutionConfig::default()
        },
    };
    let started = service.start_execution(request).await?;
    println!("execution {} (job {})", started.execution_id, started.job_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", event.content);
                if let Ok(FlowEvent::ExecutionStatus { status, .. }) =
                    serde_json::from_str::<FlowEvent>(&event.content)
                {
                    if status.is_terminal() {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Cancelling execution...");
                service.cancel_execution(started.execution_id).await?;
                break;
            }
        }
    }

    let status = service.wait(started.execution_id).await?;
    let detail = service.get_execution(started.execution_id).await?;
    for node in &detail.nodes {
        println!("  {:<24} {:?}", node.node_id, node.status);
    }
    match &detail.execution.error {
        Some(error) => println!("{:?}: {}", status, error),
        None => println!("{:?}", status),
    }
    Ok(status)
}
