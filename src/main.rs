//! pairgate binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use pairgate::api::{self, AppState, ServerConfig};
use pairgate::cli::{parse_args, print_help, print_version};
use pairgate::config::Config;
use pairgate::logging;
use pairgate::manager::SessionManager;
use pairgate::store::{SessionRepository, SqliteSessionRepository};
use pairgate::transport::loopback::LoopbackProvider;
use tracing::{error, info, warn};

const MEMORY_URL: &str = "sqlite::memory:";

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run 'pairgate --help' for usage.");
            return ExitCode::FAILURE;
        }
    };

    if args.help {
        print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server_config = match config.to_server_config() {
        Ok(server_config) => server_config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_with_level(config.log_filter()) {
        eprintln!("warning: logging already initialized: {}", e);
    }

    match run(config, server_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pairgate stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, server_config: ServerConfig) -> pairgate::Result<()> {
    info!("pairgate v{}", env!("CARGO_PKG_VERSION"));

    if !server_config.auth.is_enabled() {
        warn!("authentication is disabled, do not expose this server");
    }

    let repo: Arc<dyn SessionRepository> = if config.database.url == MEMORY_URL {
        warn!("using an in-memory session store, sessions are lost on exit");
        Arc::new(SqliteSessionRepository::in_memory().await?)
    } else {
        Arc::new(
            SqliteSessionRepository::connect(&config.database.url, config.database.max_connections)
                .await?,
        )
    };

    warn!("no network transport is linked in, using the loopback device provider");
    let devices = Arc::new(LoopbackProvider::new());

    let manager = Arc::new(SessionManager::new(repo, devices, config.manager_config())?);
    match manager.reconcile().await {
        Ok(report) => info!(
            reconnected = report.reconnected,
            pending = report.pending,
            failed = report.failed,
            "startup reconciliation done"
        ),
        Err(e) => error!(error = %e, "startup reconciliation failed"),
    }

    let state = AppState::new(Arc::clone(&manager));
    let result = api::serve(server_config, state, shutdown_signal()).await;

    info!("shutting down sessions");
    manager.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
