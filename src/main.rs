//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use halldyll_converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use halldyll_converge::config::{
    ConfigParser, ConfigValidator, ProviderKind, StackConfig, StateBackend, find_config_file,
};
use halldyll_converge::error::{ConfigError, ConvergeError, EXIT_SUCCESS, Result};
use halldyll_converge::planner::{CancellationFlag, ExecutorSettings};
use halldyll_converge::provider::{HttpProvider, MemoryProvider, Provider};
use halldyll_converge::reconciler::{PlannedRun, Reconciler};
use halldyll_converge::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("{}", formatter.format_error(&e));
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<()> {
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, formatter).await,
        Commands::Apply { yes, concurrency } => {
            cmd_apply(config, yes, concurrency, formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config, yes, formatter).await,
        Commands::Refresh => cmd_refresh(config, formatter).await,
        Commands::Output { name } => cmd_output(config, name.as_deref(), formatter).await,
        Commands::Drift => cmd_drift(config, formatter).await,
        Commands::State { command } => cmd_state(config, command, formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("converge.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your provider token");
    eprintln!("  2. Edit converge.stack.yaml with your resources");
    eprintln!("  3. Run 'converge validate' to check the stack");
    eprintln!("  4. Run 'converge plan' to see what will change");
    eprintln!("  5. Run 'converge apply' to converge");

    Ok(())
}

/// Validate configuration and the resource graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config_file, parser) = parser_for(config_path)?;
    info!("Validating stack file: {}", config_file.display());
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&result, show_warnings))?;
    if !result.is_valid() {
        return Err(ConfigError::ValidationError {
            message: format!("{} error(s) in {}", result.error_count(), config_file.display()),
            field: None,
        }
        .into());
    }

    config.graph().validate()?;

    if formatter_is_text(formatter) {
        eprintln!("\nStack summary:");
        eprintln!("  Stack: {}", config.qualified_name());
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Outputs: {}", config.outputs.len());
        eprintln!("  State backend: {:?}", config.state.backend);
    }
    Ok(())
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;
    let reconciler = Reconciler::new(&config, &state_store, provider);

    let run = reconciler.plan().await?;
    emit(&formatter.format_plan(&run.plan, detailed))
}

/// Converge infrastructure.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;

    let mut settings = ExecutorSettings::from(&config.execution);
    if let Some(concurrency) = concurrency {
        settings.concurrency = concurrency.max(1);
    }
    let reconciler = Reconciler::new(&config, &state_store, provider)
        .with_settings(settings)
        .with_cancellation(cancel_on_ctrl_c());

    let run = reconciler.plan().await?;
    if !run.plan.is_empty() {
        eprintln!("{}", formatter.format_plan(&run.plan, false));
        if !auto_approve && !confirm("Do you want to apply this plan?")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    execute(&reconciler, run, formatter).await
}

/// Destroy all managed resources.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;
    let reconciler =
        Reconciler::new(&config, &state_store, provider).with_cancellation(cancel_on_ctrl_c());

    let run = reconciler.plan_destroy().await?;
    if run.plan.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&run.plan, false));
    if !auto_approve
        && !confirm(&format!(
            "This will DELETE every resource of {}. Continue?",
            config.qualified_name()
        ))?
    {
        eprintln!("Destroy cancelled.");
        return Ok(());
    }

    execute(&reconciler, run, formatter).await
}

async fn execute<S: StateStore>(
    reconciler: &Reconciler<'_, S>,
    run: PlannedRun,
    formatter: &OutputFormatter,
) -> Result<()> {
    let report = reconciler.execute(run).await?;
    emit(&formatter.format_apply(&report))?;

    let outputs = reconciler.outputs(&report.state);
    if !outputs.is_empty() && formatter_is_text(formatter) {
        eprintln!("\nOutputs:");
        emit(&formatter.format_outputs(&outputs))?;
    }
    Ok(())
}

/// Refresh recorded outputs from the provider.
async fn cmd_refresh(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;
    let report = Reconciler::new(&config, &state_store, provider)
        .refresh()
        .await?;
    emit(&formatter.format_refresh(&report))
}

/// Show stack outputs.
async fn cmd_output(
    config_path: Option<&Path>,
    name: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;
    let state = state_store.load().await?;
    let mut outputs = Reconciler::new(&config, &state_store, provider).outputs(&state);

    if let Some(name) = name {
        let value = outputs.remove(name).ok_or_else(|| {
            ConvergeError::Config(ConfigError::validation(
                format!("no output named '{name}'"),
                format!("outputs.{name}"),
            ))
        })?;
        outputs = std::iter::once((name.to_string(), value)).collect();
    }

    emit(&formatter.format_outputs(&outputs))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config)?;
    let report = Reconciler::new(&config, &state_store, provider)
        .check_drift()
        .await?;
    emit(&formatter.format_drift(&report))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_config, state_store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if state_store.exists().await? {
                let state = state_store.load().await?;
                emit(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
            let lock = state_store.get_lock_info().await?;
            if lock.is_some() {
                emit(&formatter.format_lock(lock.as_ref()))?;
            }
        }
        StateCommands::Lock { holder } => {
            let lock = state_store
                .acquire_lock(holder.as_deref().unwrap_or(""), "manual")
                .await?;
            emit(&formatter.format_lock(Some(&lock)))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                warn!("Forcing state unlock");
                state_store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file and a parser rooted next to it, loading `.env`.
fn parser_for(config_path: Option<&Path>) -> Result<(PathBuf, ConfigParser)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |p| Ok(p.to_path_buf()))?;
    let parser =
        ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")));
    parser.load_dotenv()?;
    Ok((config_file, parser))
}

/// Loads configuration and creates the configured state store.
async fn load_config_and_state(
    config_path: Option<&Path>,
) -> Result<(StackConfig, Box<dyn StateStore>)> {
    let (config_file, parser) = parser_for(config_path)?;
    debug!("Loading stack file from: {}", config_file.display());

    let config = parser.load_with_env(&config_file)?;
    let validation = ConfigValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let key = config.qualified_name();
    let state_store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || {
                    config_file
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join(STATE_DIR)
                },
                PathBuf::from,
            );
            Box::new(LocalStateStore::new(path, &key))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 bucket not configured", "state.bucket")
            })?;
            Box::new(
                S3StateStore::new(
                    bucket,
                    config.state.prefix.as_deref(),
                    config.state.region.as_deref(),
                    &key,
                )
                .await?,
            )
        }
    };
    debug!("Using {} state backend", state_store.backend_type());

    Ok((config, state_store))
}

/// Creates the configured provider adapter.
fn create_provider(config: &StackConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.kind {
        ProviderKind::Http => {
            let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
                ConfigError::validation("provider endpoint is required", "provider.endpoint")
            })?;
            let token = ConfigParser::provider_token(config);
            if token.is_none() {
                debug!("{} is not set; sending unauthenticated requests", config.provider.token_env);
            }
            let provider = HttpProvider::new(
                endpoint,
                token,
                Duration::from_secs(config.provider.timeout_secs),
            )?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Memory => {
            debug!("Using the in-memory provider");
            Ok(Arc::new(MemoryProvider::new()))
        }
    }
}

/// Returns a flag that is set on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: waiting for in-flight steps to finish");
            handle.cancel();
        }
    });
    flag
}

/// Asks for confirmation on stderr.
fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

fn formatter_is_text(formatter: &OutputFormatter) -> bool {
    formatter.format() == OutputFormat::Text
}
