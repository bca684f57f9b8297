use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vmr_core::config::{load_settings_or_default, ConfigError, Settings, DEFAULT_SETTINGS_PATH};
use vmr_core::events::LogLevel;
use vmr_core::placeholder::dated_result_dir;
use vmr_core::result::format_duration;
use vmr_core::scenario::Scenario;
use vmr_core::validation::{Validate, ValidationIssue, ValidationLevel};
use vmr_notify::{NotificationDispatcher, Notifier, NotifyError};
use vmr_vm::{parse_inventory, VmControl, VmError, VmrunClient};
use vmrd::{
    retain_steps_for_vm, ConsoleSink, ConsoleTarget, EventLogError, ExecutorConfig, FanoutSink,
    HistoryError, HistoryStore, JsonlSink, OrchestratorError, ResultStore, ResultStoreError,
    RunExit, RunLog, ScenarioOrchestrator, ScenarioStore, ScenarioStoreError, VmRegistry,
};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "vmregress")]
#[command(about = "Run regression test scenarios against VMware virtual machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file path
    #[arg(short, long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a scenario
    Run(RunArgs),
    /// List stored scenarios
    ListScenarios,
    /// List registered VMs
    ListVms {
        /// Also read VMware's inventory file
        #[arg(long)]
        discover: bool,

        /// Inventory file to read instead of the per-user default
        #[arg(long, requires = "discover")]
        inventory: Option<PathBuf>,
    },
    /// Show recent runs
    History {
        #[arg(short, long)]
        scenario: Option<String>,

        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Check a scenario without running it
    Validate {
        #[arg(short, long)]
        scenario: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Scenario name (case-insensitive)
    #[arg(short, long)]
    scenario: String,

    /// Override the scenario's max_parallel
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Only run steps targeting this VM
    #[arg(long)]
    vm: Option<String>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Directory for the result JSON (defaults to the dated result directory)
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Overall deadline in minutes
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Validate and print the plan without touching any VM
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error("failed to load settings at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{0}")]
    InvalidConfig(String),
    #[error("scenario '{name}' not found in {dir}")]
    ScenarioNotFound { name: String, dir: PathBuf },
    #[error("{0}")]
    InvalidScenario(String),
    #[error(transparent)]
    Scenarios(#[from] ScenarioStoreError),
    #[error("failed to connect to vmrun: {source}")]
    VmConnect {
        #[source]
        source: VmError,
    },
    #[error("notification setup failed: {source}")]
    Notify {
        #[from]
        source: NotifyError,
    },
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    SaveResult(#[from] ResultStoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("failed to serialize output: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read VMware inventory at {path}: {source}")]
    ReadInventory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MainError {
    fn exit(&self) -> RunExit {
        match self {
            MainError::ScenarioNotFound { .. } => RunExit::ScenarioNotFound,
            MainError::VmConnect { .. } => RunExit::VmConnectFailed,
            MainError::Args(_)
            | MainError::LoadConfig { .. }
            | MainError::InvalidConfig(_)
            | MainError::InvalidScenario(_)
            | MainError::Notify { .. } => RunExit::InvalidInput,
            MainError::Scenarios(_)
            | MainError::EventLog(_)
            | MainError::Orchestrator(_)
            | MainError::SaveResult(_)
            | MainError::History(_)
            | MainError::Serialize { .. }
            | MainError::ReadInventory { .. } => RunExit::TimedOutOrInternal,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                RunExit::InvalidInput.code()
            } else {
                0
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(exit) => std::process::exit(exit.code()),
        Err(err) => {
            eprintln!("vmregress: {err}");
            std::process::exit(err.exit().code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> Result<RunExit, MainError> {
    let settings = load_checked_settings(&cli.config)?;
    match cli.command {
        Commands::Run(args) => run_scenario(&settings, args, cli.verbose).await,
        Commands::ListScenarios => list_scenarios(&settings),
        Commands::ListVms {
            discover,
            inventory,
        } => list_vms(&settings, discover, inventory),
        Commands::History { scenario, limit } => show_history(&settings, scenario, limit),
        Commands::Validate { scenario } => validate_scenario(&settings, &scenario),
    }
}

fn load_checked_settings(path: &Path) -> Result<Settings, MainError> {
    let settings = load_settings_or_default(path).map_err(|source| MainError::LoadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let issues = settings.validate();
    print_warnings(&issues);
    reject_errors("settings", &issues).map_err(MainError::InvalidConfig)?;
    Ok(settings)
}

fn load_scenario(settings: &Settings, name: &str) -> Result<Scenario, MainError> {
    let store = ScenarioStore::new(&settings.scenarios_dir);
    store
        .find(name)?
        .ok_or_else(|| MainError::ScenarioNotFound {
            name: name.to_string(),
            dir: settings.scenarios_dir.clone(),
        })
}

async fn run_scenario(
    settings: &Settings,
    args: RunArgs,
    verbose: bool,
) -> Result<RunExit, MainError> {
    let mut scenario = load_scenario(settings, &args.scenario)?;
    if let Some(parallel) = args.parallel {
        if parallel == 0 {
            return Err(MainError::Args("--parallel must be at least 1".to_string()));
        }
        scenario.max_parallel = parallel;
    }

    let registry = VmRegistry::from_settings(settings);
    if let Some(vm) = args.vm.as_deref() {
        let kept = retain_steps_for_vm(&mut scenario, vm, |vm_ref| registry.resolve(vm_ref).name);
        if kept == 0 {
            return Err(MainError::Args(format!(
                "scenario '{}' has no steps for VM '{vm}'",
                scenario.name
            )));
        }
    }

    let issues = scenario.validate();
    print_warnings(&issues);
    reject_errors("scenario", &issues).map_err(MainError::InvalidScenario)?;

    if args.dry_run {
        print!("{}", render_plan(&scenario, &registry));
        return Ok(RunExit::AllPassed);
    }

    let client = Arc::new(VmrunClient::new(
        settings.vmrun_path.clone(),
        settings.install_dirs.clone(),
    ));
    client
        .connect()
        .await
        .map_err(|source| MainError::VmConnect { source })?;

    let notifier: Arc<dyn Notifier> =
        Arc::new(NotificationDispatcher::from_settings(&settings.notification)?);

    let started = Local::now();
    let run_log = RunLog::for_run(&settings.result_root, &scenario.name, started);
    let console_level = if verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let mut sinks = FanoutSink::default();
    sinks.push(Arc::new(ConsoleSink::new(console_level, ConsoleTarget::Stderr)));
    sinks.push(Arc::new(JsonlSink::create(run_log.clone())?));

    let orchestrator = ScenarioOrchestrator::new(
        client,
        Arc::new(sinks),
        registry,
        ExecutorConfig::from_settings(settings),
    )
    .with_notifier(notifier);

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());
    if let Some(minutes) = args.timeout {
        watch_deadline(cancel.clone(), Duration::from_secs(minutes.saturating_mul(60)));
    }

    let result = orchestrator.run_with_cancel(&scenario, cancel).await?;

    match args.output {
        OutputFormat::Text => print!("{}", vmrd::render_text(&result)),
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&result)
                .map_err(|source| MainError::Serialize { source })?;
            println!("{rendered}");
        }
    }

    let report_dir = args
        .report
        .unwrap_or_else(|| dated_result_dir(&settings.result_root, started));
    let saved = ResultStore::new(report_dir).save(&result)?;
    eprintln!("result saved to {}", saved.display());
    eprintln!("run log at {}", run_log.path().display());

    let history = HistoryStore::open(&settings.history_db)?;
    history.record(&result, Some(saved.as_path()))?;
    mark_last_run(settings, &args.scenario, &result.started_at);

    Ok(RunExit::for_result(&result))
}

fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; no further steps will start");
            cancel.cancel();
        }
    });
}

fn watch_deadline(cancel: CancellationToken, after: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                tracing::warn!(minutes = after.as_secs() / 60, "run deadline reached");
                cancel.cancel();
            }
        }
    });
}

/// Stamps the stored scenario. The run itself already succeeded, so failures only warn.
fn mark_last_run(settings: &Settings, name: &str, at: &chrono::DateTime<chrono::Utc>) {
    let store = ScenarioStore::new(&settings.scenarios_dir);
    let updated = store.find(name).and_then(|found| match found {
        Some(mut scenario) => {
            scenario.last_run_at = Some(*at);
            store.save(&scenario).map(|_| ())
        }
        None => Ok(()),
    });
    if let Err(err) = updated {
        tracing::warn!(error = %err, "failed to update scenario last_run_at");
    }
}

fn list_scenarios(settings: &Settings) -> Result<RunExit, MainError> {
    let scenarios = ScenarioStore::new(&settings.scenarios_dir).load_all()?;
    if scenarios.is_empty() {
        println!("no scenarios in {}", settings.scenarios_dir.display());
        return Ok(RunExit::AllPassed);
    }
    for scenario in scenarios {
        let last_run = scenario
            .last_run_at
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}\t{} steps\tmax_parallel {}\tlast run {}",
            scenario.name,
            scenario.steps.len(),
            scenario.max_parallel,
            last_run
        );
    }
    Ok(RunExit::AllPassed)
}

fn list_vms(
    settings: &Settings,
    discover: bool,
    inventory: Option<PathBuf>,
) -> Result<RunExit, MainError> {
    for vm in &settings.registered_vms {
        println!("{}\t{}", vm.name, vm.vmx_path);
    }
    if !discover {
        if settings.registered_vms.is_empty() {
            println!("no registered VMs (try --discover)");
        }
        return Ok(RunExit::AllPassed);
    }

    let Some(path) = inventory.or_else(default_inventory_path) else {
        return Err(MainError::Args(
            "no inventory path; pass --inventory".to_string(),
        ));
    };
    let raw = std::fs::read_to_string(&path).map_err(|source| MainError::ReadInventory {
        path: path.clone(),
        source,
    })?;
    for entry in parse_inventory(&raw) {
        if settings.find_vm(&entry.vmx_path).is_some() {
            continue;
        }
        println!("{}\t{}\t(discovered)", entry.name, entry.vmx_path);
    }
    Ok(RunExit::AllPassed)
}

/// VMware Workstation's per-user inventory.
fn default_inventory_path() -> Option<PathBuf> {
    if cfg!(windows) {
        env::var_os("APPDATA").map(|dir| PathBuf::from(dir).join("VMware").join("inventory.vmls"))
    } else {
        env::var_os("HOME").map(|dir| PathBuf::from(dir).join(".vmware").join("inventory.vmls"))
    }
}

fn show_history(
    settings: &Settings,
    scenario: Option<String>,
    limit: usize,
) -> Result<RunExit, MainError> {
    let history = HistoryStore::open(&settings.history_db)?;
    let entries = history.recent(limit, scenario.as_deref())?;
    if entries.is_empty() {
        println!("no recorded runs");
    }
    for entry in entries {
        let duration = entry
            .ended_at
            .map(|end| format_duration(end - entry.started_at))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{}\t{}\t{}\t{}\t{}/{} passed, {} failed, {} errors\t{}",
            entry.run_id,
            entry.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            entry.scenario_name,
            duration,
            entry.passed,
            entry.total,
            entry.failed,
            entry.errors,
            if entry.success { "PASSED" } else { "FAILED" }
        );
    }
    Ok(RunExit::AllPassed)
}

fn validate_scenario(settings: &Settings, name: &str) -> Result<RunExit, MainError> {
    let scenario = load_scenario(settings, name)?;
    let issues = scenario.validate();
    if issues.is_empty() {
        println!("scenario '{}' is valid", scenario.name);
        return Ok(RunExit::AllPassed);
    }
    for issue in &issues {
        println!("{}", render_issue(issue));
    }
    match reject_errors("scenario", &issues) {
        Ok(()) => Ok(RunExit::AllPassed),
        Err(_) => Ok(RunExit::InvalidInput),
    }
}

fn render_issue(issue: &ValidationIssue) -> String {
    let level = match issue.level {
        ValidationLevel::Error => "error",
        ValidationLevel::Warning => "warning",
    };
    format!("{level}: {}: {}", issue.code, issue.message)
}

fn print_warnings(issues: &[ValidationIssue]) {
    for issue in issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Warning)
    {
        tracing::warn!("{}", render_issue(issue));
    }
}

fn reject_errors(subject: &str, issues: &[ValidationIssue]) -> Result<(), String> {
    let errors = issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .collect::<Vec<_>>();

    if errors.is_empty() {
        return Ok(());
    }

    let rendered = errors
        .iter()
        .map(|issue| format!("{}: {}", issue.code, issue.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(format!("{subject} validation failed ({rendered})"))
}

fn render_plan(scenario: &Scenario, registry: &VmRegistry) -> String {
    let mut out = format!(
        "Scenario: {} ({} steps, max_parallel {}, continue_on_failure {})\n",
        scenario.name,
        scenario.steps.len(),
        scenario.max_parallel,
        scenario.continue_on_failure
    );
    for (index, step) in scenario.ordered_steps().into_iter().enumerate() {
        let vm = registry.resolve(&step.vm);
        out.push_str(&format!(
            "  {}. {} on {} from '{}': {} {} {}\n",
            index + 1,
            step.name,
            vm.name,
            step.snapshot_name,
            step.execution.kind,
            step.execution.path,
            step.execution.arguments
        ));
    }
    out
}
