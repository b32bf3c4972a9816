//! Mesh Coordinator - Command Line Interface
//!
//! Tools for working with distributed inference plans and fault-tolerance
//! configuration without a live cluster.
//!
//! ## Commands
//!
//! - `check-config` - Load and validate a TOML or YAML configuration
//! - `defaults` - Print the default configuration
//! - `plan` - Show the partition plan a strategy would produce
//! - `simulate` - Run one inference on an in-process cluster

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mesh_coordinator::{
    init_production_logging, init_simple_logging, CoordinatorConfig, DistributedEngine, FaultToleranceManager,
    InferenceParams, MockBehavior, MockPeerTransport, ModelInfo, ModelRegistry, NodeId, NodeInfo,
    NodeRegistry, PartitionPlanner, TaskDescriptor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Mesh Coordinator - distributed inference and fault tolerance
#[derive(Parser, Debug)]
#[command(name = "mesh-coordinator")]
#[command(about = "Mesh distributed inference coordinator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to a .toml, .yaml or .yml document
        path: PathBuf,
    },

    /// Print the default configuration
    Defaults {
        /// Output format (toml, yaml)
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show the partition plan for a model
    Plan {
        /// Partition strategy (layerwise, pipeline_parallel)
        #[arg(short, long, default_value = "layerwise")]
        strategy: String,

        /// Layers in the model
        #[arg(short, long, default_value = "32")]
        layers: u32,

        /// Number of nodes to plan over
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Input size in tokens
        #[arg(short, long, default_value = "1024")]
        tokens: usize,
    },

    /// Run one inference on an in-process cluster with a mock transport
    Simulate {
        /// Number of nodes in the cluster
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Layers in the model
        #[arg(short, long, default_value = "32")]
        layers: u32,

        /// Prompt text
        #[arg(short, long, default_value = "hello distributed world")]
        prompt: String,

        /// Partition strategy
        #[arg(short, long, default_value = "layerwise")]
        strategy: String,

        /// Aggregation strategy (concat, concat_text)
        #[arg(short, long, default_value = "concat_text")]
        aggregation: String,

        /// Index of a node that fails every request
        #[arg(long)]
        fail_node: Option<usize>,

        /// Simulated per-partition latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,

        /// Log level
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Also write rotating log files here
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => {
            init_simple_logging("warn")?;
            cmd_check_config(path)?;
        }

        Commands::Defaults { format } => {
            // No logging (pure output)
            cmd_defaults(&format)?;
        }

        Commands::Plan {
            strategy,
            layers,
            nodes,
            tokens,
        } => {
            init_simple_logging("warn")?;
            cmd_plan(&strategy, layers, nodes, tokens)?;
        }

        Commands::Simulate {
            nodes,
            layers,
            prompt,
            strategy,
            aggregation,
            fail_node,
            latency_ms,
            log_level,
            log_dir,
        } => {
            match log_dir {
                Some(dir) => init_production_logging(&log_level, Some(dir))?,
                None => init_simple_logging(&log_level)?,
            }
            cmd_simulate(SimulationArgs {
                nodes,
                layers,
                prompt,
                strategy,
                aggregation,
                fail_node,
                latency: Duration::from_millis(latency_ms),
            })
            .await?;
        }
    }

    Ok(())
}

fn cmd_check_config(path: PathBuf) -> Result<()> {
    match CoordinatorConfig::load(&path) {
        Ok(config) => {
            println!("{} {}", "✓".green(), path.display());
            println!(
                "  partition strategy:  {}",
                config.engine.partition_strategy
            );
            println!(
                "  aggregation:         {}",
                config.engine.aggregation_strategy
            );
            println!(
                "  fault tolerance:     {}",
                if config.fault_tolerance.enabled {
                    "enabled".green()
                } else {
                    "disabled".yellow()
                }
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), path.display());
            println!("  {}", e);
            anyhow::bail!("configuration rejected")
        }
    }
}

fn cmd_defaults(format: &str) -> Result<()> {
    let config = CoordinatorConfig::default();
    let doc = match format {
        "toml" => toml::to_string_pretty(&config).context("Failed to render TOML")?,
        "yaml" | "yml" => serde_yaml::to_string(&config).context("Failed to render YAML")?,
        other => anyhow::bail!("unknown format: {} (expected toml or yaml)", other),
    };
    print!("{}", doc);
    Ok(())
}

fn cmd_plan(strategy: &str, layers: u32, nodes: usize, tokens: usize) -> Result<()> {
    let config = CoordinatorConfig::default().engine.with_min_nodes(1);
    let planner = PartitionPlanner::new(&config);
    let ids: Vec<NodeId> = (0..nodes).map(|_| NodeId::random()).collect();
    let task = TaskDescriptor::new("model", "", layers).with_input_tokens(tokens);

    let plan = planner
        .plan(&task, &ids, strategy)
        .with_context(|| format!("Failed to plan with strategy '{}'", strategy))?;

    println!(
        "\n{} {} ({} partitions, {} edges)",
        "Partition plan:".bold().cyan(),
        plan.strategy,
        plan.len(),
        plan.edge_count()
    );
    for partition in &plan.partitions {
        let node = ids
            .iter()
            .position(|id| *id == partition.node_id)
            .map(|i| format!("node-{}", i))
            .unwrap_or_else(|| partition.node_id.to_string());
        let mut line = format!("  {:<40} {:<8}", partition.id, node);
        if let Some(range) = partition.layer_range {
            line.push_str(&format!(" layers {}..={}", range.start, range.end));
        }
        if let Some(range) = partition.token_range {
            line.push_str(&format!(" tokens {}..{}", range.start, range.end));
        }
        if !partition.dependencies.is_empty() {
            line.push_str(&format!(" after {}", partition.dependencies.join(", ")));
        }
        println!("{}", line);
    }
    println!();
    Ok(())
}

struct SimulationArgs {
    nodes: usize,
    layers: u32,
    prompt: String,
    strategy: String,
    aggregation: String,
    fail_node: Option<usize>,
    latency: Duration,
}

async fn cmd_simulate(args: SimulationArgs) -> Result<()> {
    let mut config = CoordinatorConfig::default();
    config.engine = config
        .engine
        .with_partition_strategy(&args.strategy)
        .with_aggregation_strategy(&args.aggregation)
        .with_min_nodes(1);
    config.validate().context("Invalid simulation settings")?;

    let nodes = Arc::new(NodeRegistry::new());
    let ids: Vec<NodeId> = (0..args.nodes).map(|_| NodeId::random()).collect();
    for id in &ids {
        nodes.upsert(NodeInfo::new(*id)).await;
    }

    let models = Arc::new(ModelRegistry::in_memory());
    models
        .register(
            ModelInfo::new("sim-model", &config.engine.model_source_dir)
                .with_layers(args.layers)
                .with_replicas(ids.clone()),
        )
        .await?;

    let transport = Arc::new(
        MockPeerTransport::new().with_default_behavior(MockBehavior::Respond {
            latency: args.latency,
        }),
    );
    if let Some(index) = args.fail_node {
        let Some(id) = ids.get(index) else {
            anyhow::bail!("--fail-node {} out of range (0..{})", index, ids.len());
        };
        transport
            .set_behavior(
                *id,
                MockBehavior::Fail {
                    message: "simulated failure".to_string(),
                },
            )
            .await;
        warn!(node_id = %id, "Node will fail every request");
    }

    let manager =
        FaultToleranceManager::new(config.fault_tolerance.clone(), nodes.clone(), models.clone())?;
    let guarded = manager.guard_transport(transport.clone()).await;
    let engine = DistributedEngine::new(config.engine.clone(), nodes, models, guarded)?
        .with_circuit_breakers(manager.breakers().clone())
        .with_performance_tracker(manager.performance().clone());

    info!(nodes = args.nodes, strategy = %args.strategy, "Running simulated inference");
    let outcome = engine
        .execute_distributed_inference("sim-model", &args.prompt, InferenceParams::new())
        .await;

    match &outcome {
        Ok(result) => {
            println!("\n{}", "Result".bold().cyan());
            println!("  Text:        {}", result.text);
            println!("  Tokens:      {}", result.token_count());
            println!("  Nodes used:  {}", result.nodes_used.len());
            println!("  Time:        {:?}", result.processing_time);
        }
        Err(e) => println!("\n{} {}", "Inference failed:".bold().red(), e),
    }

    let faults = manager.run_monitoring_cycle().await;
    let healed = manager.run_healing_cycle().await;
    engine.stats().display();

    let metrics = manager.get_metrics().await;
    println!("{}", "Fault Tolerance".bold().cyan());
    println!("  Faults detected:     {}", metrics.faults_detected);
    for fault in &faults {
        println!(
            "    {} {} ({})",
            fault.fault_type.to_string().yellow(),
            fault.target,
            fault.description
        );
    }
    println!("  Healing attempts:    {}", metrics.healing_attempts);
    for report in &healed {
        match (&report.strategy, &report.error) {
            (Some(strategy), _) => println!(
                "    {} {} via {}",
                "healed".green(),
                report.node_id,
                strategy.as_str()
            ),
            (None, Some(error)) => println!("    {} {}: {}", "failed".red(), report.node_id, error),
            (None, None) => {}
        }
    }
    println!("  Open circuits:       {}", metrics.open_circuits);
    println!();

    outcome.map(|_| ()).map_err(anyhow::Error::from)
}
