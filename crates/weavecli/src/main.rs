// crates/weavecli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weavecore::{
    ExecutionEvent, ExecutionRecord, ExecutionStatus, FlowError, NodeEvent, NodeSpec, NodeStatus,
    Value, Workflow,
};
use weaveruntime::{Engine, NodeRegistry, RuntimeConfig};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Weave workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            verbose,
        } => {
            init_tracing(verbose);
            run_workflow(file, input, config).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    weavenodes::register_all(&mut registry);
    registry
}

fn load_workflow(file: &PathBuf) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&workflow_json).with_context(|| format!("parsing {}", file.display()))
}

/// Parse `--input` as a plain JSON object into run inputs.
fn parse_inputs(input: Option<String>) -> Result<HashMap<String, Value>> {
    let Some(input_str) = input else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str(&input_str)? {
        serde_json::Value::Object(obj) => Ok(obj
            .into_iter()
            .map(|(k, v)| (k, Value::from_plain_json(v)))
            .collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!("   On error: {:?}", workflow.settings.on_error);
    println!();

    let inputs = parse_inputs(input)?;
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!(?config, "runtime configuration");

    let runtime = Engine::with_registry(Arc::new(registry()), config);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if print_event(event) {
                break;
            }
        }
    });

    let result = runtime.execute(&workflow, inputs).await;
    let record = match result {
        Ok(record) => record,
        Err(FlowError::Validation(e)) => {
            event_task.abort();
            println!("❌ Workflow is invalid:");
            for violation in &e.violations {
                println!("   - {}", violation);
            }
            bail!("validation failed with {} violation(s)", e.violations.len());
        }
        Err(e) => {
            event_task.abort();
            return Err(e.into());
        }
    };

    // The listener stops on WorkflowCompleted
    let _ = event_task.await;

    print_summary(&record);

    if record.status != ExecutionStatus::Completed {
        bail!("workflow finished with status {}", record.status);
    }
    Ok(())
}

/// Print one event; returns true once the run has finished.
fn print_event(event: ExecutionEvent) -> bool {
    match event {
        ExecutionEvent::WorkflowStarted { .. } => {
            println!("▶️  Workflow started");
        }
        ExecutionEvent::CancellationRequested { .. } => {
            println!("🛑 Cancellation requested");
        }
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            attempt,
            ..
        } => {
            if attempt > 1 {
                println!("  🔁 Retrying node: {} ({}), attempt {}", node_id, node_type, attempt);
            } else {
                println!("  ⚡ Starting node: {} ({})", node_id, node_type);
            }
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed {
            node_id,
            error,
            will_retry,
            ..
        } => {
            if will_retry {
                println!("  ⚠️  Node {} failed, will retry: {}", node_id, error);
            } else {
                println!("  ❌ Node {} failed: {}", node_id, error);
            }
        }
        ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
            println!("  ⏭️  Node {} skipped: {}", node_id, reason);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", node_id, percent);
                }
            }
        },
        ExecutionEvent::WorkflowCompleted {
            status,
            duration_ms,
            ..
        } => {
            match status {
                ExecutionStatus::Completed => {
                    println!("✨ Workflow completed in {}ms", duration_ms)
                }
                ExecutionStatus::Cancelled => {
                    println!("🛑 Workflow cancelled after {}ms", duration_ms)
                }
                _ => println!("💥 Workflow failed after {}ms", duration_ms),
            }
            return true;
        }
    }
    false
}

fn print_summary(record: &ExecutionRecord) {
    let completed = record.completed_nodes();
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", record.execution_id);
    println!("   Status: {}", record.status);
    println!("   Completed: {}/{} nodes", completed.len(), record.nodes.len());
    if let Some(duration_ms) = record.duration_ms() {
        println!("   Duration: {}ms", duration_ms);
    }

    let failed = record.failed_nodes();
    if !failed.is_empty() {
        println!();
        println!("❌ Failed nodes:");
        for (node_id, error) in failed {
            println!("   {}: {}", node_id, error);
        }
    }

    let skipped: Vec<_> = record
        .nodes
        .iter()
        .filter(|(_, n)| n.status == NodeStatus::Skipped)
        .collect();
    if !skipped.is_empty() {
        println!();
        println!("⏭️  Skipped nodes:");
        for (node_id, node) in skipped {
            let reason = node.skip_reason.map(|r| r.to_string()).unwrap_or_default();
            println!("   {}: {}", node_id, reason);
        }
    }

    let outputs: Vec<_> = record
        .nodes
        .iter()
        .filter_map(|(id, n)| n.outputs.as_ref().filter(|o| !o.is_empty()).map(|o| (id, o)))
        .collect();
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, ports) in outputs {
            println!("   Node {}:", node_id);
            let mut ports: Vec<_> = ports.iter().collect();
            ports.sort_by(|a, b| a.0.cmp(b.0));
            for (port, value) in ports {
                println!("     {}: {}", port, value.to_plain_json());
            }
        }
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;

    match weaveruntime::validate(&workflow, &registry()) {
        Ok(validated) => {
            println!("✅ Workflow is valid:");
            println!("   Name: {}", workflow.name);
            println!("   Nodes: {}", workflow.nodes.len());
            println!("   Connections: {}", workflow.connections.len());
            println!("   Execution order: {}", validated.order.join(" → "));
            for warning in &validated.warnings {
                println!("   ⚠️  {}", warning);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Workflow is invalid:");
            for violation in &e.violations {
                println!("   - {}", violation);
            }
            bail!("validation failed with {} violation(s)", e.violations.len())
        }
    }
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        let Some(metadata) = registry.get_metadata(&node_type) else {
            println!("  • {}", node_type);
            continue;
        };

        let trigger = if metadata.trigger { ", trigger" } else { "" };
        println!("  • {} ({}{})", node_type, metadata.category, trigger);
        println!("    {}", metadata.description);
        for port in &metadata.inputs {
            let required = if port.required { ", required" } else { "" };
            let multi = if port.multi { ", multi" } else { "" };
            println!("    ← {}: {}{}{}", port.id, port.port_type, required, multi);
        }
        for port in &metadata.outputs {
            println!("    → {}: {}", port.id, port.port_type);
        }
        for setting in &metadata.settings {
            match &setting.default {
                Some(default) => println!(
                    "    ⚙ {}: {} (default {})",
                    setting.key,
                    setting.setting_type,
                    default.to_plain_json()
                ),
                None => println!("    ⚙ {}: {}", setting.key, setting.setting_type),
            }
        }
        for credential in &metadata.credentials {
            println!("    🔑 {}", credential.slot);
        }
        println!();
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Workflow");
    workflow.description = Some("Encodes the run payload, decodes it again and logs it".to_string());

    let trigger = NodeSpec::new("start", "core.trigger")
        .with_name("Start")
        .with_position(100.0, 100.0);
    let encode = NodeSpec::new("encode", "transform.json_stringify")
        .with_name("Encode")
        .with_position(300.0, 100.0);
    let wait = NodeSpec::new("wait", "time.delay")
        .with_name("Wait")
        .with_config("delay_ms", 250.0)
        .with_position(500.0, 100.0);
    let log = NodeSpec::new("log", "debug.log")
        .with_name("Log Payload")
        .with_config("label", "payload")
        .with_position(700.0, 100.0);

    let trigger_id = workflow.add_node(trigger);
    let encode_id = workflow.add_node(encode);
    let wait_id = workflow.add_node(wait);
    let log_id = workflow.add_node(log);

    workflow.connect(trigger_id.clone(), "payload", encode_id.clone(), "value");
    workflow.connect(encode_id, "json", wait_id.clone(), "value");
    workflow.connect(wait_id, "value", log_id, "message");

    // Save to file
    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weave run --file {} --input '{{\"payload\": {{\"user\": \"ada\"}}}}'",
        output.display()
    );

    Ok(())
}
