#![forbid(unsafe_code)]

//! `fenix`: session host binary.
//!
//! Loads configuration and secrets, builds the shared registries, starts the
//! configured sessions and the IPC server for `fenix-ctl`, then runs until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fenix::config::GlobalConfig;
use fenix::credentials::CredentialRepository;
use fenix::driver::connection::NativeDriverFactory;
use fenix::ipc::server::{publish_token, spawn_ipc_server, IpcState};
use fenix::platform::{NativePlatform, Platform};
use fenix::pool::ProcessPool;
use fenix::resource_lock::ResourceLock;
use fenix::session::{SessionContext, SessionHost};
use fenix::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fenix", about = "Game client and bot driver session host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Sessions to start (repeatable). Defaults to every configured session.
    #[arg(long = "session")]
    sessions: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("fenix bootstrap");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    for name in &args.sessions {
        if config.session(name).is_none() {
            return Err(AppError::Config(format!("no session named '{name}' in config")));
        }
    }
    config.load_secrets().await?;
    info!(
        accounts = config.accounts.len(),
        sessions = config.sessions.len(),
        "configuration loaded"
    );

    // ── Build registries ────────────────────────────────
    let platform: Arc<dyn Platform> = Arc::new(NativePlatform::new(config.target.input));
    let lock = ResourceLock::new(config.launch_throttle());
    let pool = Arc::new(ProcessPool::new(
        Arc::clone(&platform),
        lock,
        config.pool_settings(),
    ));
    for pid in &config.target.adopt_pids {
        if let Err(err) = pool.adopt(*pid) {
            warn!(pid, %err, "cannot adopt configured process");
        }
    }

    let host = Arc::new(SessionHost::new(SessionContext {
        platform: Arc::clone(&platform),
        pool,
        keys: config.key_pool(),
        drivers: Arc::new(NativeDriverFactory::new(
            Arc::clone(&platform),
            config.driver_settings(),
        )),
        credentials: Arc::new(CredentialRepository::new(config.credentials())),
        client: config.client_settings()?,
        retries: config.retries,
        default_combat_routine: config.driver.default_combat_routine.clone(),
    }));

    for session in &config.sessions {
        host.create(&session.name, session.tasks.clone())?;
    }

    // ── IPC server ──────────────────────────────────────
    let ct = CancellationToken::new();
    let auth_token = config
        .ipc_token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match publish_token(&config.ipc_name, &auth_token) {
        Ok(path) => info!(path = %path.display(), "ipc token published"),
        Err(err) => warn!(%err, "failed to publish ipc token"),
    }
    let ipc_state = Arc::new(IpcState {
        host: Arc::clone(&host),
        auth_token: Some(auth_token),
    });
    let ipc_handle = spawn_ipc_server(&config.ipc_name, ipc_state, ct.clone())?;

    // ── Start sessions ──────────────────────────────────
    let selected: Vec<&str> = if args.sessions.is_empty() {
        config.sessions.iter().map(|s| s.name.as_str()).collect()
    } else {
        args.sessions.iter().map(String::as_str).collect()
    };
    let mut started = 0_usize;
    for name in selected {
        match host.start(name) {
            Ok(_) => started += 1,
            Err(err) => error!(session = name, %err, "failed to start session"),
        }
    }
    info!(started, "fenix ready");

    // ── Wait for shutdown signal or the sessions to end ─
    if started == 0 {
        shutdown_signal().await;
        info!("shutdown signal received");
    } else {
        tokio::select! {
            () = shutdown_signal() => info!("shutdown signal received"),
            () = host.wait_all() => info!("all sessions finished"),
        }
    }
    ct.cancel();
    host.shutdown().await;

    if let Err(err) = ipc_handle.await {
        warn!(%err, "ipc server ended abnormally");
    }
    info!("fenix shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
