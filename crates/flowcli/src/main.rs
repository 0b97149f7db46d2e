// crates/flowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{diff, FlowConfig, NodeConfig, RuntimeEvent};
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow runtime CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load flows from a user directory and keep them running until Ctrl-C
    Run {
        /// Directory holding flows, credentials and context
        #[arg(short, long, default_value = ".")]
        user_dir: PathBuf,

        /// Runtime settings JSON file
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },

    /// Show what deploying one flow file over another would touch
    Diff {
        old: PathBuf,
        new: PathBuf,
    },

    /// Validate a flow file
    Validate {
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example flow file
    Init {
        #[arg(short, long, default_value = "flows.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

fn read_flows(file: &Path) -> Result<Vec<NodeConfig>> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run { user_dir, settings } => run(user_dir, settings).await?,
        Commands::Diff { old, new } => diff_files(&old, &new)?,
        Commands::Validate { file } => validate(&file)?,
        Commands::Nodes => list_nodes(),
        Commands::Init { output } => create_example(&output)?,
    }

    Ok(())
}

async fn run(user_dir: PathBuf, settings: Option<PathBuf>) -> Result<()> {
    let config = match settings {
        Some(path) => RuntimeConfig::from_file(&path).await?,
        None => RuntimeConfig::default(),
    }
    .with_user_dir(user_dir);

    println!("🚀 Starting runtime in {}", config.user_dir.display());
    let runtime = FlowRuntime::new(config, registry()).await?;
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RuntimeEvent::FlowsStarted { deployment_type, revision, .. } => {
                    println!(
                        "▶️  Flows started ({}) rev {}",
                        deployment_type,
                        revision.unwrap_or_default()
                    );
                }
                RuntimeEvent::FlowsStopped { .. } => println!("⏹️  Flows stopped"),
                RuntimeEvent::Deployed { revision, added, changed, removed, rewired, .. } => {
                    println!(
                        "📦 Deployed {}: +{} ~{} -{} ↻{}",
                        revision, added, changed, removed, rewired
                    );
                }
                RuntimeEvent::NodeStatus { node_id, status, .. } => {
                    println!("  ℹ️  [{}] {}", node_id, status.text.unwrap_or_default());
                }
                RuntimeEvent::NodeError { node_id, error, .. } => {
                    println!("  ❌ [{}] {}", node_id, error);
                }
            }
        }
    });

    let rev = runtime.start().await?;
    tracing::info!(revision = %rev, "Runtime started");
    println!("📋 Running revision {}, Ctrl-C to stop", rev);
    let state = runtime.manager().get_state();
    if !state.missing_types.is_empty() {
        println!("⚠️  Waiting for node types: {}", state.missing_types.join(", "));
    }

    tokio::signal::ctrl_c().await?;
    println!();
    runtime.shutdown().await?;
    event_task.abort();
    Ok(())
}

fn diff_files(old: &Path, new: &Path) -> Result<()> {
    let result = diff(&read_flows(old)?, &read_flows(new)?)?;
    if result.is_empty() {
        println!("✅ No differences");
        return Ok(());
    }
    println!("🔍 {}", result);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    println!("🔍 Validating flows: {}", file.display());
    let config = FlowConfig::parse(read_flows(file)?)?;

    println!("✅ Flow file is valid:");
    println!("   Flows: {}", config.flows.len());
    println!("   Subflows: {}", config.subflows.len());
    println!("   Config nodes: {}", config.configs.len());
    println!("   Nodes: {}", config.nodes().len());

    let registry = registry();
    let missing = config.missing_types(|t| registry.is_known(t));
    if !missing.is_empty() {
        let missing: Vec<String> = missing.into_iter().collect();
        println!("⚠️  Unknown node types: {}", missing.join(", "));
    }
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
            if !metadata.credentials.is_empty() {
                let fields: Vec<&str> = metadata.credentials.keys().map(String::as_str).collect();
                println!("    credentials: {}", fields.join(", "));
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example(output: &Path) -> Result<()> {
    let flows = vec![
        NodeConfig::tab("main", "Example"),
        NodeConfig::new("tick", "inject")
            .in_flow("main")
            .with_prop("name", "Every 5s")
            .with_prop("repeat", 5)
            .with_prop("payload", "tick"),
        NodeConfig::new("errors", "catch").in_flow("main"),
        NodeConfig::new("statuses", "status")
            .in_flow("main")
            .with_prop("scope", serde_json::json!(["tick"])),
    ];

    let json = serde_json::to_string_pretty(&flows)?;
    std::fs::write(output, json)?;

    println!("✨ Created example flows: {}", output.display());
    println!();
    println!("Run them with:");
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    println!("  flow run --user-dir {}", dir.display());
    Ok(())
}
