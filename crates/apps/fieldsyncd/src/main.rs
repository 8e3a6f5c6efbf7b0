//! fieldsyncd - Scheduled field-service data replication
//!
//! This is the main entry point for the sync service.
//!
//! Usage:
//!   fieldsyncd              run the scheduler until interrupted
//!   fieldsyncd once <kind>  run a single quick or full sync and exit
//!   fieldsyncd status       print the persisted sync state as JSON

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fieldsync::{
    ApiClient, ClientCredentialsExchange, CredentialCache, LockedRunner, ProcessLock,
    ServiceSettings, SqliteStore, SyncEngine, SyncKind, SyncStateMachine, UreqTransport,
};
use log::{error, info, warn};

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => run_service(),
        ["once"] | ["once", "quick"] => run_once(SyncKind::Quick),
        ["once", "full"] => run_once(SyncKind::Full),
        ["status"] => print_status(),
        other => {
            eprintln!("Unknown arguments: {}", other.join(" "));
            eprintln!("Usage: fieldsyncd [run | once [quick|full] | status]");
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load settings, pointing the operator at the config options on failure
fn load_settings() -> Result<ServiceSettings> {
    ServiceSettings::load().inspect_err(|_| {
        if let Some(path) = ServiceSettings::default_settings_path() {
            warn!(
                "To configure the service, either:\n\
                 1. Place a settings file at: {}\n\
                 2. Point FIELDSYNC_CONFIG at a settings file\n\
                 3. Or set ST_TENANT, ST_CLIENT_ID, ST_CLIENT_SECRET and ST_APP_KEY",
                path.display()
            );
        }
    })
}

/// Take the process lock and arrange for it to be released on panic
fn acquire_lock(settings: &ServiceSettings) -> Result<ProcessLock> {
    let lock_path = settings.lock_path()?;
    if ProcessLock::is_held(&lock_path) {
        bail!(
            "Another fieldsync instance holds {}; refusing to start",
            lock_path.display()
        );
    }

    let lock = ProcessLock::new(lock_path);
    if !lock.acquire()? {
        bail!("Could not acquire the sync lock; another instance is starting");
    }

    // A panic anywhere (including on the blocking pool) ends the process;
    // drop the lock on the way out so the next start is not refused.
    let hook_lock = lock.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        if let Err(e) = hook_lock.release() {
            eprintln!("Failed to release sync lock after panic: {:#}", e);
        }
        std::process::exit(1);
    }));

    Ok(lock)
}

fn build_engine(settings: &ServiceSettings) -> Result<SyncEngine> {
    let data_dir = settings.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let exchange = ClientCredentialsExchange::new(
        settings.token_url.clone(),
        settings.client_id.clone(),
        settings.client_secret.clone(),
        Box::new(UreqTransport::new(settings.token_timeout())),
    );
    let credentials = Arc::new(CredentialCache::new(exchange));

    let client = ApiClient::new(
        &settings.api_base,
        settings.tenant.clone(),
        settings.app_key.clone(),
        credentials,
        Box::new(UreqTransport::new(settings.request_timeout())),
    )?;

    let db_path = settings.db_path()?;
    let store = SqliteStore::new(&db_path)?;
    info!("Using database at {}", db_path.display());

    let state = SyncStateMachine::open(settings.state_path()?)?;

    Ok(SyncEngine::new(
        Arc::new(client),
        Arc::new(store),
        Arc::new(state),
        settings.fetch_policy(),
    ))
}

fn run_service() -> Result<()> {
    let settings = load_settings()?;
    let lock = acquire_lock(&settings)?;

    // `serve` returns within the shutdown grace even if a sync is still
    // running, so the lock is released before the process exits.
    let result = build_engine(&settings).and_then(|engine| {
        info!("fieldsyncd started for tenant {}", settings.tenant);
        let runner = Arc::new(LockedRunner::new(engine, lock.clone()));
        fieldsync::serve(runner, settings.schedule_config(), shutdown_signal())
    });

    lock.release()?;
    info!("fieldsyncd stopped");
    result
}

fn run_once(kind: SyncKind) -> Result<()> {
    let settings = load_settings()?;
    let lock = acquire_lock(&settings)?;

    let result = build_engine(&settings).and_then(|engine| engine.run(kind));
    lock.release()?;

    match result? {
        Some(report) if report.success => Ok(()),
        Some(report) => bail!(
            "{} sync finished with failures ({} records pulled)",
            kind,
            report.total_pulled()
        ),
        None => bail!("Another sync holds the sync state"),
    }
}

fn print_status() -> Result<()> {
    let settings = load_settings()?;
    let state_path = settings.state_path()?;
    let status = SyncStateMachine::read_status(&state_path);

    let status = serde_json::json!({
        "statePath": state_path,
        "lockHeld": ProcessLock::is_held(&settings.lock_path()?),
        "stale": status.stale,
        "elapsedSecs": status.elapsed_secs,
        "state": status.state,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
