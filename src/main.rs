//! DuraFlow CLI Entry Point
//!
//! Runs the image automation pipeline in-process: workers for every
//! pipeline queue are started, one run is submitted and the CLI waits for
//! its outcome.
//!
//! # Usage
//!
//! ```bash
//! # Process a Navad image
//! duraflow Navad My_path
//!
//! # Keep history on disk so an interrupted run resumes
//! duraflow Satellite /data/img.tif --state-dir /tmp/duraflow --workflow-id sat-1
//!
//! # Shorten the simulated sqrt work
//! duraflow Navad My_path --sqrt-delay-ms 100
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use log::{info, warn};

use duraflow::pipeline::{self, AutomationPipelineInput, PipelineOptions};
use duraflow::{load_config, Engine, EngineError, WorkflowOutcome, APP_NAME, VERSION};

/// Default worker threads per pipeline queue.
const DEFAULT_THREADS: usize = 2;

/// Default per-step delay of the sqrt activity, in milliseconds.
const DEFAULT_SQRT_DELAY_MS: u64 = 10_000;

/// Default limit on waiting for the run, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 900;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    image_type: Option<String>,
    image_path: String,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    workflow_id: Option<String>,
    threads: usize,
    sqrt_delay_ms: u64,
    timeout_secs: u64,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_type: None,
            image_path: "My_path".to_string(),
            config_path: None,
            state_dir: None,
            workflow_id: None,
            threads: DEFAULT_THREADS,
            sqrt_delay_ms: DEFAULT_SQRT_DELAY_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Durable Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: duraflow [OPTIONS] <IMAGE_TYPE> [IMAGE_PATH]");
    println!();
    println!("Arguments:");
    println!("  <IMAGE_TYPE>          Navad or Satellite");
    println!("  [IMAGE_PATH]          Image to process (default: My_path)");
    println!();
    println!("Options:");
    println!("  --config PATH         Engine configuration YAML file");
    println!("  --state-dir PATH      Persist workflow history under PATH");
    println!("  --workflow-id ID      Run id to start or resume");
    println!("  --threads N           Worker threads per queue (default: {})", DEFAULT_THREADS);
    println!("  --sqrt-delay-ms N     Per-step delay of sqrt_activity (default: {})", DEFAULT_SQRT_DELAY_MS);
    println!("  --timeout SECS        Give up waiting after SECS (default: {})", DEFAULT_TIMEOUT_SECS);
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  duraflow Navad My_path");
    println!("  duraflow Satellite /data/img.tif --state-dir /tmp/duraflow");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

fn parse_number<T: std::str::FromStr>(value: &str, option: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", option, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--workflow-id" => {
                config.workflow_id = Some(next_value(args, &mut i, arg)?.to_string());
            }
            "--threads" => {
                config.threads = parse_number(next_value(args, &mut i, arg)?, arg)?;
            }
            "--sqrt-delay-ms" => {
                config.sqrt_delay_ms = parse_number(next_value(args, &mut i, arg)?, arg)?;
            }
            "--timeout" => {
                config.timeout_secs = parse_number(next_value(args, &mut i, arg)?, arg)?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.image_type = Some(arg.clone()),
                    1 => config.image_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.image_type.is_none() {
        return Err("Missing <IMAGE_TYPE>".to_string());
    }
    if config.threads == 0 {
        return Err("--threads must be at least 1".to_string());
    }
    Ok(config)
}

fn print_outcome(outcome: &WorkflowOutcome) {
    println!();
    match outcome {
        WorkflowOutcome::Completed(result) => {
            println!("{} {}", "Workflow result:".green().bold(), result);
        }
        WorkflowOutcome::Failed(failure) | WorkflowOutcome::TimedOut(failure) => {
            println!("{} {}", "Workflow failed:".red().bold(), failure);
            if let Some(cause) = &failure.cause {
                println!("  caused by: {}", cause.root_cause());
            }
        }
        WorkflowOutcome::Cancelled(reason) => {
            println!("{} {}", "Workflow cancelled:".yellow().bold(), reason);
        }
        WorkflowOutcome::Running => {
            println!("{}", "Workflow still running".yellow());
        }
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    // Engine configuration: file first, pipeline workers if it names none
    let mut engine_config = match &config.config_path {
        Some(path) => {
            info!("Loading engine configuration: {}", path.display());
            load_config(path)?
        }
        None => pipeline::engine_config(config.threads),
    };
    if engine_config.workers.is_empty() {
        engine_config.workers = pipeline::engine_config(config.threads).workers;
    }
    if let Some(dir) = &config.state_dir {
        engine_config.state_dir = Some(dir.clone());
    }
    if let Some(dir) = &engine_config.state_dir {
        info!("History directory: {}", dir.display());
    }

    let options = PipelineOptions {
        sqrt_step_delay: Duration::from_millis(config.sqrt_delay_ms),
        ..PipelineOptions::default()
    };
    let registry = pipeline::build_registry(&options)?;
    let engine = Arc::new(Engine::new(engine_config, registry)?);

    let recovered = engine.recover()?;
    if recovered > 0 {
        info!("Resuming {} open runs from history", recovered);
    }
    let workers = engine.spawn_workers()?;

    let workflow_id = config.workflow_id.clone().unwrap_or_else(|| {
        format!(
            "automation-workflow-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f")
        )
    });
    let input = AutomationPipelineInput::new(
        config.image_path.clone(),
        config.image_type.clone().unwrap_or_default(),
    );

    match engine.start_workflow(pipeline::start_request(&workflow_id, &input)?) {
        Ok(_) => info!("Submitted '{}'", workflow_id),
        Err(EngineError::AlreadyStarted(_)) => {
            warn!("'{}' already has an open run - waiting for it", workflow_id)
        }
        Err(e) => {
            workers.shutdown();
            return Err(e.into());
        }
    }

    let waited = engine.wait_for_outcome(&workflow_id, Duration::from_secs(config.timeout_secs));
    workers.shutdown();
    let outcome = waited?;

    print_outcome(&outcome);
    println!("{}", engine.timeline().gantt_chart());

    let dead_letters = engine.dead_letters();
    if !dead_letters.is_empty() {
        warn!("{} tasks exhausted their delivery budget", dead_letters.len());
    }

    match outcome {
        WorkflowOutcome::Completed(_) => Ok(()),
        _ => Err(format!("workflow '{}' did not complete", workflow_id).into()),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
