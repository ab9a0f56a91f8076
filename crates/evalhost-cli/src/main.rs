//! Command-line front end for the evalhost orchestration core.
//!
//! Reads evaluation units from stdin (separated by a marker line), runs them
//! through one execution context, and prints each unit's stdout and stderr.
//! Mostly useful for poking at a guest interpreter by hand.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use evalhost::{EvalHost, HostConfig, HostLimits, ProcessConfig};

#[derive(Parser, Debug)]
#[command(name = "evalhost-cli", about = "Run evaluation units against an interpreter subprocess")]
struct Cli {
    /// Interpreter executable to spawn. Without it the `EVALHOST_*`
    /// environment (command, args, working dir, runtime home) is read
    /// instead.
    #[arg(long)]
    command: Option<String>,

    /// Argument passed to the interpreter; repeat for more.
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Working directory for the interpreter subprocess.
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Execution context to run the units in.
    #[arg(long, default_value = "cli")]
    context: String,

    /// Line separating one evaluation unit from the next on stdin.
    #[arg(long, default_value = "%%")]
    separator: String,

    /// Per-unit execution timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let process = resolve_process(cli.command.as_deref(), &cli.args, cli.working_dir.as_deref())?;
    let mut limits = HostLimits::default();
    if let Some(secs) = cli.timeout_secs {
        limits.execution_timeout = Duration::from_secs(secs);
    }
    tracing::debug!(command = %process.command, context = %cli.context, "interpreter host ready");
    let host = EvalHost::new(HostConfig::new(process).with_limits(limits));

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading evaluation units from stdin")?;

    let mut failed = false;
    for unit in split_units(&input, &cli.separator) {
        match host.evaluate_in(&cli.context, &unit).await {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    println!("{}", output.stdout);
                }
                if !output.stderr.is_empty() {
                    eprintln!("{}", output.stderr);
                }
            }
            Err(error) => {
                eprintln!("evaluation failed: {error}");
                if let Some(partial) = error.partial_output() {
                    if !partial.stderr.is_empty() {
                        eprintln!("{}", partial.stderr);
                    }
                }
                failed = true;
                break;
            }
        }
    }

    host.dispose_all().await;
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Builds the interpreter command line: an explicit `--command` wins, with
/// flag-level overrides applied on top; otherwise the whole `EVALHOST_*`
/// environment surface is consumed.
fn resolve_process(
    command: Option<&str>,
    args: &[String],
    working_dir: Option<&std::path::Path>,
) -> Result<ProcessConfig> {
    let mut process = match command {
        Some(command) => ProcessConfig::new(command),
        None => ProcessConfig::from_env()
            .context("no --command given and the EVALHOST_* environment is incomplete")?,
    };
    if !args.is_empty() {
        process = process.with_args(args.to_vec());
    }
    if let Some(dir) = working_dir {
        process = process.with_working_directory(dir);
    }
    Ok(process)
}

/// Splits stdin into evaluation units on lines equal to `separator`. Blank
/// units are dropped.
fn split_units(input: &str, separator: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();
    for line in input.lines() {
        if line.trim() == separator {
            if !current.trim().is_empty() {
                units.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        units.push(current);
    }
    units
}
