//! Hierflow CLI Entry Point
//!
//! Plans a workflow hierarchy and submits its jobs.
//!
//! # Usage
//!
//! ```bash
//! # Plan and run a workflow
//! hierflow root.yml --replicas replicas.yml --transformations transformations.yml
//!
//! # Preview every job binding without running anything
//! hierflow root.yml --replicas replicas.yml --transformations transformations.yml --dry-run
//!
//! # Send top-level outputs somewhere specific
//! hierflow root.yml --output-map output.map --storage-root /data/output
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use hierflow::catalog::{OutputMap, ReplicaCatalog, TransformationCatalog};
use hierflow::config::{PlannerConfig, REPORT_DIR};
use hierflow::execution::{DryRunService, ExecutionService, Planner, RunReport, SharedFsService};
use hierflow::workflow::load_workflow;
use hierflow::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    replicas: Option<PathBuf>,
    transformations: Option<PathBuf>,
    output_map: Option<PathBuf>,
    planner: PlannerConfig,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            replicas: None,
            transformations: None,
            output_map: None,
            planner: PlannerConfig::default(),
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
    println!("{} v{}", APP_NAME, VERSION);
    println!("Hierarchical Workflow Planner");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: hierflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>          Path to the top-level workflow YAML file");
    println!();
    println!("Options:");
    println!("  --replicas FILE          Replica catalog (YAML)");
    println!("  --transformations FILE   Transformation catalog (YAML)");
    println!("  --output-map FILE        Output locations for top-level outputs");
    println!("  --site NAME              Execution site (default: local)");
    println!("  --storage-site NAME      Site outputs land on (default: local)");
    println!("  --storage-root PATH      Directory default output locations live under");
    println!("  --parallel N             Maximum jobs in flight per level");
    println!("  --dry-run                Print job bindings without running them");
    println!("  --verbose                Enable debug logging");
    println!("  --help                   Show this help message");
    println!("  --version                Show version information");
    println!();
    println!("Examples:");
    println!("  hierflow root.yml --replicas rc.yml --transformations tc.yml");
    println!("  hierflow root.yml --replicas rc.yml --transformations tc.yml --dry-run");
}

/// Returns the value following option `name`.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
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
            "--dry-run" => {
                config.planner.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--replicas" => {
                config.replicas = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--transformations" => {
                config.transformations = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--output-map" => {
                config.output_map = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--site" => {
                config.planner.execution_site = option_value(args, &mut i, arg)?.to_string();
            }
            "--storage-site" => {
                config.planner.storage_site = option_value(args, &mut i, arg)?.to_string();
            }
            "--storage-root" => {
                config.planner.storage_root = PathBuf::from(option_value(args, &mut i, arg)?);
            }
            "--parallel" => {
                let value = option_value(args, &mut i, arg)?;
                let max: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                config.planner.max_parallel = max.max(1);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints the outcome of a run.
fn print_summary(report: &RunReport, planner: &Planner) {
    println!();
    if report.is_success() {
        println!("{}", "Workflow completed successfully".green().bold());
    } else {
        println!("{}", "Workflow FAILED".red().bold());
        println!();
        for chain in report.failure_chains() {
            println!("  {}", chain.red());
        }
        let cancelled = report.cancelled_jobs();
        if !cancelled.is_empty() {
            println!();
            println!("{}", format!("Cancelled jobs: {}", cancelled.join(", ")).yellow());
        }
    }
    println!(
        "Total time: {} ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );
    println!("{}", planner.timeline().gantt_chart());
}

/// Main application entry point. Returns whether every job completed.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.planner.dry_run {
        info!("Mode: DRY RUN (jobs will not execute)");
        println!();
    }

    let replicas = match &config.replicas {
        Some(path) => ReplicaCatalog::load(path)?,
        None => {
            warn!("No replica catalog given; only embedded entries are available");
            ReplicaCatalog::new()
        }
    };
    let transformations = match &config.transformations {
        Some(path) => TransformationCatalog::load(path)?,
        None => TransformationCatalog::new(),
    };
    let output_map = match &config.output_map {
        Some(path) => OutputMap::load(path, &config.planner.storage_site)?,
        None => OutputMap::new(),
    };

    info!("Loading workflow: {}", config.workflow_path);
    let workflow = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", config.workflow_path, e)
    })?;

    let service: Arc<dyn ExecutionService> = if config.planner.dry_run {
        Arc::new(DryRunService::new())
    } else {
        Arc::new(SharedFsService::new())
    };

    let planner = Planner::new(config.planner, service)
        .with_replicas(replicas)
        .with_transformations(transformations)
        .with_output_map(output_map);

    let token = planner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });

    let report = planner.run(workflow).await;
    print_summary(&report, &planner);

    if let Err(e) = report.save(REPORT_DIR) {
        warn!("Could not save run report: {}", e);
    }

    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
