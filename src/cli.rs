//! Command-line surface tying the subsystems together.

use crate::{
    batch::{BatchError, BatchExpander},
    command::{self, CommandError, CommandRegistry, TASK_KEY},
    config::{self, ConfigError, ConfigFormat, HPC_PLACEHOLDER},
    dispatch::{dispatch_step, DispatchError},
    logging,
    pipeline::{
        find_pipeline_configs,
        pipeline_configs_in,
        CycleOutcome,
        Pipeline,
        PipelineError,
        DEFAULT_POLL_SECONDS,
    },
    status::{elapsed_time_as_str, pid_alive, StatusError, StatusStore, TaskState, STATE_DIR},
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(
        "Could not determine the pipeline config in {0}: found {1} files matching *pipeline*"
    )]
    AmbiguousPipelineConfig(PathBuf, usize),
    #[error("Usage: <step-alias> -c CONFIG [-v]; {0}")]
    BadStepArgs(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        help = "Enable debug logging"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute multiple steps in an analysis pipeline
    Pipeline(PipelineArgs),
    /// Execute an analysis pipeline over a parametric set of inputs
    Batch(BatchArgs),
    /// Display the status of one or more project directories
    Status(StatusArgs),
    /// Reset the job status of one or more project directories
    ResetStatus(ResetStatusArgs),
    /// Generate template config files for registered commands
    TemplateConfigs(TemplateConfigsArgs),
    /// Any registered step alias: `<step-alias> -c CONFIG [-v]`
    #[command(external_subcommand)]
    Step(Vec<String>),
}

#[derive(Args, Debug)]
struct PipelineArgs {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the pipeline config file; defaults to the single file in the \
                current directory matching *pipeline*"
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Cancel all jobs associated with this pipeline")]
    cancel: bool,

    #[arg(
        long,
        help = "Monitor continuously: poll and submit each step until the pipeline \
                completes or fails"
    )]
    monitor: bool,

    #[arg(
        long,
        conflicts_with = "monitor",
        help = "Monitor continuously in a detached background process that outlives \
                this shell session"
    )]
    background: bool,

    #[arg(
        short = 'r',
        long,
        help = "Run pipelines recursively: check every sub-directory for exactly one \
                file matching *pipeline* and run the executor there (`-c` is ignored)"
    )]
    recursive: bool,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the batch config file (mapping or csv)"
    )]
    config: PathBuf,

    #[arg(long = "dry", help = "Make job directories without running pipelines")]
    dry_run: bool,

    #[arg(long, help = "Cancel all jobs across all batch sub-pipelines")]
    cancel: bool,

    #[arg(long, help = "Delete all generated batch subdirectories named in the index csv")]
    delete: bool,

    #[arg(
        long = "monitor-background",
        help = "Monitor each batch pipeline continuously in a detached background process"
    )]
    monitor_background: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(value_name = "FOLDER", help = "Project directories (default: current directory)")]
    dirs: Vec<PathBuf>,

    #[arg(
        short = 'p',
        long = "pipe-steps",
        value_name = "STEP",
        help = "Only display the requested pipeline steps"
    )]
    steps: Vec<String>,

    #[arg(
        short = 's',
        long = "status",
        value_name = "STATUS",
        help = "Only display jobs with the requested status (failed, running, submitted, \
                successful, not-submitted)"
    )]
    filters: Vec<String>,
}

#[derive(Args, Debug)]
struct ResetStatusArgs {
    #[arg(value_name = "FOLDER", help = "Project directories (default: current directory)")]
    dirs: Vec<PathBuf>,

    #[arg(
        short = 'f',
        long,
        help = "Force the reset even if jobs are queued or running"
    )]
    force: bool,

    #[arg(
        short = 'a',
        long = "after-step",
        value_name = "STEP",
        help = "Reset only the steps after this one; its own status is untouched"
    )]
    after_step: Option<String>,
}

#[derive(Args, Debug)]
struct TemplateConfigsArgs {
    #[arg(value_name = "STEP", help = "Commands to template (default: all registered)")]
    steps: Vec<String>,

    #[arg(
        short = 't',
        long = "type",
        value_name = "FORMAT",
        default_value = "json",
        help = "Config file format: json, json5, yaml, or toml"
    )]
    config_type: String,
}

/// Parse the process arguments and run the requested command.
pub fn run(registry: &CommandRegistry) -> Result<(), CliError> {
    run_with(registry, Cli::parse())
}

fn run_with(registry: &CommandRegistry, cli: Cli) -> Result<(), CliError> {
    let (level, log_file) = logging_settings(&cli);
    logging::init_logging(cli.verbose, level.as_deref(), log_file.as_deref());

    match cli.command {
        Commands::Pipeline(args) => pipeline_cmd(registry, args, cli.verbose),
        Commands::Batch(args) => batch_cmd(registry, args, cli.verbose),
        Commands::Status(args) => status_cmd(args),
        Commands::ResetStatus(args) => reset_status_cmd(args),
        Commands::TemplateConfigs(args) => template_configs_cmd(registry, args),
        Commands::Step(argv) => step_cmd(registry, argv, cli.verbose),
    }
}

/// Pipeline and batch configs may carry a `logging` block naming a log
/// file and level; peek at it before the subscriber goes up.
fn logging_settings(cli: &Cli) -> (Option<String>, Option<PathBuf>) {
    let config_path = match &cli.command {
        Commands::Pipeline(args) => args.config.clone(),
        Commands::Batch(args) => Some(args.config.clone()),
        _ => None,
    };

    let Some(config_path) = config_path else {
        return (None, None);
    };
    let Ok(config) = config::load_config(&config_path) else {
        return (None, None);
    };
    let Some(block) = config.get("logging").and_then(Value::as_object) else {
        return (None, None);
    };

    let level = block
        .get("log_level")
        .or_else(|| block.get("level"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let file = block
        .get("log_file")
        .or_else(|| block.get("file"))
        .and_then(Value::as_str)
        .map(PathBuf::from);
    (level, file)
}

fn pipeline_cmd(
    registry: &CommandRegistry,
    args: PipelineArgs,
    verbose: bool,
) -> Result<(), CliError> {
    if args.recursive {
        let found = find_pipeline_configs(Path::new("."));
        if found.is_empty() {
            warn!("No pipeline configs found in any sub-directory");
            return Ok(());
        }
        for (_, config_path) in found {
            run_one_pipeline(registry, &config_path, &args, verbose)?;
        }
        return Ok(());
    }

    let config_path = match &args.config {
        Some(config_path) => config_path.clone(),
        None => discover_pipeline_config(Path::new("."))?,
    };
    run_one_pipeline(registry, &config_path, &args, verbose)
}

fn run_one_pipeline(
    registry: &CommandRegistry,
    config_path: &Path,
    args: &PipelineArgs,
    verbose: bool,
) -> Result<(), CliError> {
    if args.cancel {
        Pipeline::new(registry, config_path, verbose)?.cancel_all()?;
        return Ok(());
    }

    let project_dir = config_path
        .canonicalize()
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    // refuse to double-drive a project that a live monitor already owns
    if let Some(pid) = StatusStore::monitor_pid(&project_dir)? {
        if pid != std::process::id() as i32 && pid_alive(pid) {
            warn!(
                "Another pipeline in {} is running on monitor PID {pid}; not starting \
                 a new pipeline execution",
                project_dir.display()
            );
            return Ok(());
        }
    }

    if args.background {
        Pipeline::kickoff_background(config_path)?;
        return Ok(());
    }

    let pipeline = Pipeline::new(registry, config_path, verbose)?;
    if pipeline.steps().is_empty() {
        info!("Pipeline has no steps; nothing to do");
        return Ok(());
    }

    if args.monitor {
        StatusStore::record_monitor_pid(&project_dir, std::process::id() as i32)?;
        let result = pipeline.monitor(Duration::from_secs(DEFAULT_POLL_SECONDS));
        StatusStore::clear_monitor_pid(&project_dir);
        result?;
    } else {
        match pipeline.one_shot()? {
            CycleOutcome::Submitted(step) => info!(step = %step, "Dispatched pipeline step"),
            CycleOutcome::Active(step) => {
                info!(step = %step, "Step is still processing; check back later")
            }
            CycleOutcome::Complete => {}
        }
    }

    Ok(())
}

fn discover_pipeline_config(dir: &Path) -> Result<PathBuf, CliError> {
    let mut candidates = pipeline_configs_in(dir);
    if candidates.len() == 1 {
        Ok(candidates.remove(0))
    } else {
        Err(CliError::AmbiguousPipelineConfig(
            dir.to_path_buf(),
            candidates.len(),
        ))
    }
}

fn batch_cmd(registry: &CommandRegistry, args: BatchArgs, verbose: bool) -> Result<(), CliError> {
    let expander = BatchExpander::new(registry, &args.config, verbose)?;

    if args.delete {
        expander.delete()?;
    } else if args.cancel {
        expander.cancel()?;
    } else {
        expander.run(args.dry_run, args.monitor_background)?;
    }

    Ok(())
}

fn status_cmd(args: StatusArgs) -> Result<(), CliError> {
    let dirs = if args.dirs.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.dirs.clone()
    };

    let filters: Vec<TaskState> = args
        .filters
        .iter()
        .filter_map(|filter| parse_status_filter(filter))
        .collect();

    for dir in dirs {
        if !dir.join(STATE_DIR).is_dir() {
            info!("No status info detected in {}; skipping", dir.display());
            continue;
        }

        let mut store = StatusStore::open(&dir)?;
        store.update_from_task_files(false)?;
        store.reconcile(&mut crate::backend::QueueProbe::new())?;

        let steps = if args.steps.is_empty() {
            None
        } else {
            Some(args.steps.as_slice())
        };
        let mut rows = store.summary(steps);
        if !filters.is_empty() {
            rows.retain(|row| filters.contains(&row.state));
        }

        println!("\nProject: {}", store.project_dir().display());
        if rows.is_empty() {
            println!("  (no matching jobs)");
            continue;
        }

        let mut widths = [3usize, 13, 6, 20, 20, 9, 8];
        for row in &rows {
            widths[0] = widths[0].max(row.job_name.len());
            widths[1] = widths[1].max(row.state.as_str().len());
        }

        println!(
            "  {:<width0$}  {:<width1$}  {:>width2$}  {:<width3$}  {:<width4$}  {:>width5$}  {:<width6$}",
            "job",
            "job_status",
            "job_id",
            "time_submitted",
            "time_end",
            "runtime",
            "hardware",
            width0 = widths[0],
            width1 = widths[1],
            width2 = widths[2],
            width3 = widths[3],
            width4 = widths[4],
            width5 = widths[5],
            width6 = widths[6],
        );

        for row in rows {
            let runtime = row
                .runtime_seconds
                .map(elapsed_time_as_str)
                .unwrap_or_else(|| "--".into());
            println!(
                "  {:<width0$}  {:<width1$}  {:>width2$}  {:<width3$}  {:<width4$}  {:>width5$}  {:<width6$}",
                row.job_name,
                row.state.as_str(),
                row.job_id.map(|id| id.to_string()).unwrap_or_else(|| "--".into()),
                row.time_submitted.unwrap_or_else(|| "--".into()),
                row.time_end.unwrap_or_else(|| "--".into()),
                runtime,
                row.hardware.unwrap_or_else(|| "--".into()),
                width0 = widths[0],
                width1 = widths[1],
                width2 = widths[2],
                width3 = widths[3],
                width4 = widths[4],
                width5 = widths[5],
                width6 = widths[6],
            );
        }
    }

    Ok(())
}

fn parse_status_filter(filter: &str) -> Option<TaskState> {
    match filter.to_ascii_lowercase().as_str() {
        "failure" | "fail" | "failed" | "f" => Some(TaskState::Failed),
        "running" | "run" | "r" => Some(TaskState::Running),
        "submitted" | "submit" | "sb" | "pending" | "pend" | "p" => Some(TaskState::Submitted),
        "successful" | "success" | "s" => Some(TaskState::Successful),
        "unsubmitted" | "u" | "not_submitted" | "not-submitted" | "ns" => {
            Some(TaskState::NotSubmitted)
        }
        other => {
            warn!("Requested status not recognized: {other:?}; no filtering performed");
            None
        }
    }
}

fn reset_status_cmd(args: ResetStatusArgs) -> Result<(), CliError> {
    let dirs = if args.dirs.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.dirs.clone()
    };

    for dir in dirs {
        if !dir.join(STATE_DIR).is_dir() {
            info!("No status info detected in {}; skipping", dir.display());
            continue;
        }

        let mut store = StatusStore::open(&dir)?;
        store.update_from_task_files(false)?;

        let processing = store
            .summary(None)
            .iter()
            .any(|row| row.state.is_processing());
        if processing && !args.force {
            warn!(
                "Found queued/running jobs in {}; not resetting (override with --force)",
                dir.display()
            );
            continue;
        }

        match &args.after_step {
            Some(after_step) => {
                if store.step_index(after_step).is_none() {
                    warn!(
                        "Step {after_step:?} not found as part of the pipeline in {}; \
                         not resetting",
                        dir.display()
                    );
                    continue;
                }
                info!("Resetting status for all steps after {after_step:?}");
                store.update_from_task_files(true)?;
                store.reset_after(after_step)?;
            }
            None => {
                info!("Removing status info for directory {}", dir.display());
                StatusStore::remove_state_dir(&dir)?;
            }
        }
    }

    Ok(())
}

fn template_configs_cmd(
    registry: &CommandRegistry,
    args: TemplateConfigsArgs,
) -> Result<(), CliError> {
    let format = ConfigFormat::from_path(Path::new(&format!("x.{}", args.config_type)))?;

    let selected: Vec<&crate::command::EntryPoint> = registry
        .iter()
        .filter(|entry| {
            args.steps.is_empty() || args.steps.iter().any(|step| step == entry.name.as_str())
        })
        .collect();

    let mut pipeline_steps = Vec::new();
    for entry in &selected {
        let file_name = format!(
            "config_{}.{}",
            entry.name.replace('-', "_"),
            format.extension()
        );
        pipeline_steps.push(json!({ entry.name.as_str(): format!("./{file_name}") }));

        let mut template = Map::new();
        let mut execution_control = Map::new();
        execution_control.insert("option".into(), json!("local"));
        execution_control.insert("allocation".into(), json!(HPC_PLACEHOLDER));
        execution_control.insert("walltime".into(), json!(HPC_PLACEHOLDER));
        if entry.is_split_spatially() {
            execution_control.insert("nodes".into(), json!(1));
        }
        template.insert("execution_control".into(), Value::Object(execution_control));
        template.insert("log_directory".into(), json!("./logs"));
        template.insert("log_level".into(), json!("INFO"));
        for split in &entry.split_keys {
            for key in split.keys() {
                template.insert(key.to_owned(), json!(config::PLACEHOLDER));
            }
        }
        for (key, value) in &entry.template_defaults {
            template.insert(key.clone(), value.clone());
        }

        let path = PathBuf::from(&file_name);
        if path.exists() {
            warn!("Template config {file_name} already exists; not overwriting");
            continue;
        }
        config::dump_config(&path, &Value::Object(template))?;
        info!("Generated template config: {file_name}");
    }

    let pipeline_template = json!({
        "pipeline": pipeline_steps,
        "logging": {"log_file": null, "log_level": "INFO"},
    });
    let pipeline_path = PathBuf::from(format!("config_pipeline.{}", format.extension()));
    if pipeline_path.exists() {
        warn!(
            "Template config {} already exists; not overwriting",
            pipeline_path.display()
        );
    } else {
        config::dump_config(&pipeline_path, &pipeline_template)?;
        info!("Generated template config: {}", pipeline_path.display());
    }

    Ok(())
}

/// `<step-alias> -c CONFIG [-v]`: dispatch a step config from the driver,
/// or execute a derived task config on a node.
fn step_cmd(
    registry: &CommandRegistry,
    argv: Vec<String>,
    global_verbose: bool,
) -> Result<(), CliError> {
    let mut argv = argv.into_iter();
    let alias = argv
        .next()
        .ok_or_else(|| CliError::BadStepArgs("missing step alias".into()))?;

    let mut config_path = None;
    let mut verbose = global_verbose;
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = Some(PathBuf::from(argv.next().ok_or_else(|| {
                    CliError::BadStepArgs("expected a path after -c".into())
                })?));
            }
            "-v" | "--verbose" => verbose = true,
            other => return Err(CliError::BadStepArgs(format!("unexpected argument {other:?}"))),
        }
    }
    let config_path =
        config_path.ok_or_else(|| CliError::BadStepArgs("missing -c CONFIG".into()))?;

    let config = config::load_config(&config_path)?;
    if config.contains_key(TASK_KEY) {
        command::execute_task_config(registry, &alias, &config_path, config, verbose)?;
    } else {
        dispatch_step(registry, &alias, None, &config_path, verbose)?;
    }

    Ok(())
}
