use anyhow::{Context, Result};
use clap::Parser;
use extrun_config::domains::logging::LogFormat;
use extrun_config::{ConfigLoader, ExtrunConfig, LoggingConfig};
use serde_json::{from_str, json, to_string_pretty, Value as JsonValue};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use extrun_execution::{
    ExtensionWatcher, HttpInfoLookup, InvocationMeta, ProcessSpawner, StepMeta, Supervisor,
    WorkerRuntime,
};

mod cli;
mod steps;
use cli::{Cli, Commands};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<ExtrunConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                eprintln!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Initialize tracing on stderr; stdout carries step output or IPC frames
fn init_tracing(logging: &LoggingConfig, log_level: Option<&String>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", level);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(logging.filter_directives()))
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Text => builder.init(),
    }

    debug!("Tracing initialized");
    Ok(())
}

/// Parse input JSON or use empty object if none provided
fn parse_input_json(input_json: Option<&String>) -> Result<JsonValue> {
    match input_json {
        Some(json_str) => from_str(json_str).context("Failed to parse input JSON"),
        None => Ok(json!({})),
    }
}

/// Build a supervisor that spawns this binary in worker mode
fn build_supervisor(cli: &Cli, config: &ExtrunConfig) -> Result<Supervisor> {
    let mut worker_args: Vec<std::ffi::OsString> = vec![
        "worker".into(),
        "--app-folder".into(),
        config.workspace.application_folder().as_os_str().to_owned(),
    ];
    if let Some(path) = &cli.config {
        worker_args.push("--config".into());
        worker_args.push(path.as_os_str().to_owned());
    }
    if let Some(level) = &cli.log_level {
        worker_args.push("--log-level".into());
        worker_args.push(level.into());
    }

    let spawner = ProcessSpawner::current_exe()
        .context("Failed to locate the extrun executable")?
        .args(worker_args);
    let lookup = HttpInfoLookup::from_config(&config.backend)
        .context("Failed to create info lookup client")?;

    Ok(Supervisor::new(
        config.execution.clone(),
        Arc::new(spawner),
        Arc::new(lookup),
    ))
}

fn apply_overrides(config: &mut ExtrunConfig, app_folder: Option<&PathBuf>, inspect: bool) {
    if let Some(folder) = app_folder {
        config.workspace.application_folder = folder.clone();
    }
    if inspect {
        config.execution.inspect = true;
    }
}

async fn run_step(
    supervisor: &Supervisor,
    extension: &str,
    step: &str,
    input: JsonValue,
    app_id: &str,
    device_id: &str,
    user_id: Option<&String>,
) -> Result<JsonValue> {
    let mut meta = InvocationMeta::new(app_id, device_id);
    if let Some(user) = user_id {
        meta = meta.with_user(user.as_str());
    }
    let path = format!("{}/{}", extension, step.trim_start_matches("./"));
    let step_meta = StepMeta::new(extension, path.as_str(), meta);

    info!("Executing step {}", path);
    supervisor
        .execute(input, step_meta)
        .await
        .with_context(|| format!("Step {} failed", path))
}

async fn watch(supervisor: &Supervisor, config: &ExtrunConfig) -> Result<()> {
    let (mut watcher, changes) = ExtensionWatcher::start(config.workspace.extensions_path())
        .context("Failed to watch extensions folder")?;
    let watching = supervisor.watch_changes(changes);

    info!("Runtime ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    watcher.stop();
    watching.abort();
    supervisor.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging, cli.log_level.as_ref())?;

    match &cli.command {
        // Hands its exit code to the supervisor
        Commands::Worker { app_folder, inspect } => {
            apply_overrides(&mut config, Some(app_folder), *inspect);

            let runtime =
                WorkerRuntime::from_workspace(&config.workspace, Arc::new(steps::registry()))
                    .with_inspect(config.execution.inspect);
            let exit = runtime.run_stdio().await;
            debug!("Worker exiting: {:?}", exit);
            std::process::exit(exit.code());
        }
        Commands::Run {
            extension,
            step,
            input_json,
            app_id,
            device_id,
            user_id,
            app_folder,
            inspect,
        } => {
            apply_overrides(&mut config, app_folder.as_ref(), *inspect);
            let input = parse_input_json(input_json.as_ref())?;

            let supervisor = build_supervisor(&cli, &config)?;
            supervisor
                .start()
                .await
                .context("Failed to start step runtime")?;

            let result = run_step(
                &supervisor,
                extension,
                step,
                input,
                app_id,
                device_id,
                user_id.as_ref(),
            )
            .await;

            if let Err(e) = supervisor.stop().await {
                warn!("Failed to stop runtime: {}", e);
            }

            match result {
                Ok(output) => {
                    let formatted =
                        to_string_pretty(&output).context("Failed to format result as JSON")?;
                    println!("{}", formatted);
                    Ok(())
                }
                Err(e) => {
                    error!("{:#}", e);
                    Err(e)
                }
            }
        }
        Commands::Watch { app_folder, inspect } => {
            apply_overrides(&mut config, app_folder.as_ref(), *inspect);

            let supervisor = build_supervisor(&cli, &config)?;
            supervisor
                .start()
                .await
                .context("Failed to start step runtime")?;
            watch(&supervisor, &config).await
        }
    }
}
