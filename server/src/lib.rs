// Forum setup service
//
// Serves the first-run wizard (`/setup`, `/setup/first`) until the forum is installed.

pub mod api;
pub mod auth;
pub mod config_store;
pub mod database;
pub mod error;
pub mod extensions;
pub mod models;
pub mod security;
pub mod settings;
pub mod setup;
pub mod utils;

use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::DatabaseAuthenticator;
use crate::config_store::{keys, ConfigStore};
use crate::database::connection::{Database, DatabaseSettings, MySqlConnector};
use crate::database::structure::MySqlStructureInstaller;
use crate::database::users::MySqlUserStore;
use crate::extensions::FileExtensionRegistry;
use crate::models::state::AppState;
use crate::settings::Settings;
use crate::setup::prerequisites::{BuildRuntimeProbe, PrerequisiteChecker};
use crate::setup::rewrite::{ApacheModules, ReqwestProbe};
use crate::setup::{SetupServices, SetupWorkflow};

fn init_logging(log_dir: &Path, with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder(log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("forum-setup-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("forum-setup-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("sqlx", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Settings plus logging, or exit. Shared by every entry point.
fn bootstrap(with_stdout: bool) -> Settings {
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load settings: {:#}", e);
            std::process::exit(1);
        }
    };

    let log_dir = match settings.resolve_paths() {
        Ok(paths) => paths.logs,
        Err(e) => {
            eprintln!("Failed to resolve forum folders: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&log_dir, with_stdout) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    settings
}

/// Wire the production collaborators. When a database is already configured the
/// shared handle points at it, so `/setup/first` works after a restart.
pub async fn build_workflow(settings: &Settings) -> anyhow::Result<SetupWorkflow> {
    let paths = settings.resolve_paths()?;
    info!(
        "[PHASE: initialization] [STEP: paths] Forum root: {:?}, configuration: {:?}",
        paths.root, paths.config_file
    );

    let config = Arc::new(ConfigStore::open(paths.config_file.clone()).await?);
    let database = Arc::new(Database::new());

    if !config.get_text(keys::DATABASE_NAME, "").await.trim().is_empty() {
        database
            .reconfigure(&DatabaseSettings::from_store(&config).await)
            .await;
    }
    if config.is_installed().await {
        warn!("[PHASE: initialization] Forum is already installed; setup requests will be refused");
    }

    let probe_timeout = Duration::from_secs(settings.setup.probe_timeout_secs);
    let runtime = Arc::new(BuildRuntimeProbe);

    let services = SetupServices {
        connector: Arc::new(MySqlConnector),
        schema: Arc::new(MySqlStructureInstaller::new(database.clone())),
        users: Arc::new(MySqlUserStore::new(database.clone())),
        auth: Arc::new(DatabaseAuthenticator::new(database.clone())),
        extensions: Arc::new(FileExtensionRegistry::new(
            paths.applications.clone(),
            paths.plugins.clone(),
            config.clone(),
            database.clone(),
        )),
        probe: Arc::new(ReqwestProbe::new(probe_timeout)),
        modules: Arc::new(ApacheModules::new(probe_timeout)),
        runtime: runtime.clone(),
        config,
        database,
    };

    let checker = PrerequisiteChecker::new(
        paths,
        settings.setup.minimum_runtime_version.clone(),
        runtime,
    );

    Ok(SetupWorkflow::new(services, checker))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[PHASE: server] Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("[PHASE: server] Shutdown requested");
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let workflow = build_workflow(&settings).await?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    info!(
        "[PHASE: server] [STEP: listen] Setup wizard listening on {} (web root {})",
        addr,
        settings.web_root()
    );

    let router = api::build_router(AppState::new(workflow, settings));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("[PHASE: server] Server stopped");
    Ok(())
}

/// Run the HTTP service until interrupted.
pub fn run_server() {
    let settings = bootstrap(true);

    info!(
        "[PHASE: initialization] forum-setup {} starting at {:?}",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now()
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build();
    let result = match rt {
        Ok(rt) => rt.block_on(serve(settings)),
        Err(e) => Err(anyhow::anyhow!("Failed to create async runtime: {}", e)),
    };

    if let Err(e) = result {
        error!("[PHASE: server] Server exited with error: {:#}", e);
        eprintln!("forum-setup: {:#}", e);
        std::process::exit(1);
    }
}

/// Print the prerequisite report and exit 0 when the environment is ready, 1 otherwise.
pub fn run_prerequisite_check() {
    let settings = bootstrap(false);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let result = match rt {
        Ok(rt) => rt.block_on(async {
            let workflow = build_workflow(&settings).await?;
            Ok::<_, anyhow::Error>(workflow.check_prerequisites().await)
        }),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to create async runtime for prerequisite check: {}",
            e
        )),
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(
                "[PHASE: prerequisites] [STEP: check] Check exited with error: {:#}",
                e
            );
            eprintln!("forum-setup: {:#}", e);
            std::process::exit(1);
        }
    };

    if report.ok() {
        println!("All prerequisites are met.");
        return;
    }

    for message in report.errors.messages() {
        println!("- {}", message);
    }
    std::process::exit(1);
}
