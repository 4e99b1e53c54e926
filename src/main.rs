use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use nomad_lite_executor::config::{ExecutorConfig, DEFAULT_EXECUTION_ROOT};
use nomad_lite_executor::ports::{PortLeaser, PortPool};
use nomad_lite_executor::shutdown::install_shutdown_handler;
use nomad_lite_executor::task::template;
use nomad_lite_executor::{TaskDescriptor, TaskExecutor, TaskState};

#[derive(Parser, Debug)]
#[command(name = "nomad-lite-executor")]
#[command(version)]
#[command(about = "Worker-side task execution engine for nomad-lite")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Stage, launch and supervise a single task until it terminates
    Run(RunArgs),

    /// Expand a command template and print the result
    Expand(ExpandArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PortArgs {
    /// Inclusive range of ports tasks may lease (format: "low-high")
    #[arg(long, default_value = "31000-31999", value_parser = parse_port_range)]
    port_range: RangeInclusive<u16>,

    /// Hand out ports without checking that they can be bound
    #[arg(long)]
    no_probe: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Task ID (defaults to a random UUID)
    #[arg(long)]
    task_id: Option<String>,

    /// Shard ID substituted for %shard_id%
    #[arg(long, default_value = "0")]
    shard_id: u32,

    /// Owner of the job
    #[arg(long, default_value = "nobody")]
    owner: String,

    /// Job name
    #[arg(long, default_value = "adhoc")]
    job: String,

    /// Health check interval in milliseconds (0 disables health checks)
    #[arg(long, default_value = "0")]
    health_interval_ms: u64,

    /// Artifact to copy into the sandbox (repeatable)
    #[arg(long = "artifact")]
    artifacts: Vec<String>,

    /// Directory under which task sandboxes are created
    #[arg(long, default_value = DEFAULT_EXECUTION_ROOT)]
    execution_root: PathBuf,

    /// Consecutive failed health checks before the task is failed
    #[arg(long, default_value = "2")]
    health_failures: u32,

    /// Seconds between SIGTERM and SIGKILL when killing the task
    #[arg(long, default_value = "5")]
    kill_grace_secs: u64,

    #[command(flatten)]
    ports: PortArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Command template, e.g. "./server --port %port:http%"
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

// =============================================================================
// Expand Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExpandArgs {
    /// Shard ID substituted for %shard_id%
    #[arg(long, default_value = "0")]
    shard_id: u32,

    #[command(flatten)]
    ports: PortArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Command template
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct RunOutput {
    task_id: String,
    state: TaskState,
    exit_code: Option<i32>,
    root: PathBuf,
}

#[derive(Serialize)]
struct ExpandOutput {
    command: String,
    ports: BTreeMap<String, u16>,
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got '{}'", s))?;
    let low: u16 = low
        .trim()
        .parse()
        .map_err(|e| format!("invalid low port: {}", e))?;
    let high: u16 = high
        .trim()
        .parse()
        .map_err(|e| format!("invalid high port: {}", e))?;
    if low > high {
        return Err(format!("empty port range {}-{}", low, high));
    }
    Ok(low..=high)
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Returns the process exit code for the finished task.
async fn handle_run(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = ExecutorConfig::new(args.execution_root)
        .with_port_range(args.ports.port_range)
        .with_port_probe(!args.ports.no_probe)
        .with_health_failure_threshold(args.health_failures)
        .with_kill_grace(Duration::from_secs(args.kill_grace_secs));

    let task_id = args
        .task_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut descriptor = TaskDescriptor::new(
        task_id.clone(),
        args.shard_id,
        args.owner,
        args.job,
        args.command.join(" "),
    );
    if args.health_interval_ms > 0 {
        descriptor =
            descriptor.with_health_check_interval(Duration::from_millis(args.health_interval_ms));
    }
    for artifact in args.artifacts {
        descriptor = descriptor.with_artifact(artifact);
    }

    let shutdown = install_shutdown_handler();
    let (executor, _updates) = TaskExecutor::new(config);

    let task = match executor.launch(descriptor).await {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Task did not start");
            return Err(e.into());
        }
    };

    let state = tokio::select! {
        state = task.wait_for() => state,
        _ = shutdown.cancelled() => {
            task.terminate(TaskState::Killed).await?;
            task.wait_for().await
        }
    };

    let output = RunOutput {
        task_id: task.task_id().to_string(),
        state,
        exit_code: task.exit_code(),
        root: task.root_dir().to_path_buf(),
    };
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Task ID:   {}", output.task_id);
            println!("State:     {}", output.state);
            if let Some(code) = output.exit_code {
                println!("Exit Code: {}", code);
            }
            println!("Sandbox:   {}", output.root.display());
        }
    }

    Ok(match (state, output.exit_code) {
        (_, Some(code)) => code,
        (TaskState::Finished, None) => 0,
        (_, None) => 1,
    })
}

fn handle_expand(args: ExpandArgs) -> Result<(), Box<dyn std::error::Error>> {
    let pool = PortPool::new(args.ports.port_range).with_probe(!args.ports.no_probe);
    let expanded = template::expand(&args.command.join(" "), args.shard_id, &pool)?;
    for port in expanded.ports.values() {
        pool.release(*port);
    }

    let output = ExpandOutput {
        command: expanded.command,
        ports: expanded.ports.into_iter().collect(),
    };
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Command: {}", output.command);
            if !output.ports.is_empty() {
                println!("{:<20} PORT", "NAME");
                for (name, port) in &output.ports {
                    println!("{:<20} {}", name, port);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            let code = handle_run(run_args).await?;
            std::process::exit(code);
        }
        Commands::Expand(expand_args) => {
            handle_expand(expand_args)?;
        }
    }
    Ok(())
}
