use outbox_dispatcher::clients::{setup_db_pool, setup_publisher};
use outbox_dispatcher::config::Config;
use outbox_dispatcher::dispatcher::Dispatcher;
use outbox_dispatcher::{outbox, scheduler};

use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[get("/health")]
async fn health_check() -> impl Responder {
    // Just return a 200 OK response
    HttpResponse::Ok().body("OK")
}

// Graceful shutdown signal future
async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received. Stopping outbox dispatcher.");
}

/// Sets up logging, forwarding errors to Sentry when a DSN is configured.
fn init_telemetry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();

    guard
}

async fn run_dispatcher_logic(config: Config, shutdown: CancellationToken) -> Result<(), BoxError> {
    // 1. Connect to the Database
    info!("Connecting to database...");
    let db_pool = setup_db_pool(&config).await?;
    info!("Database connection established.");

    if config.apply_schema {
        outbox::ensure_schema(&db_pool).await?;
        info!("Outbox schema ready.");
    }

    // 2. Broker publisher; connects lazily on the first tick
    let broker = config.broker_settings();
    info!(host = %broker.host, port = broker.port, exchange = %broker.exchange, "Broker publisher configured.");
    let publisher = setup_publisher(&config);

    // 3. Non-overlapping dispatch timer
    let dispatcher = Dispatcher::new(db_pool, publisher, config.dispatch_options());
    scheduler::run(dispatcher, config.dispatch_interval(), shutdown).await;

    info!("Dispatcher shut down.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::load()?;
    let _sentry = init_telemetry(&config);
    info!("Configuration loaded.");

    let shutdown = CancellationToken::new();

    // Health check server; signals are handled below so the dispatcher can
    // drain before the process exits.
    let health_server = HttpServer::new(|| App::new().service(health_check))
        .bind(("0.0.0.0", config.health_port))?
        .disable_signals()
        .run();
    info!(port = config.health_port, "Health check server running");

    let server_handle = health_server.handle();
    let dispatcher_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = run_dispatcher_logic(config, shutdown).await;
            if let Err(e) = &result {
                error!("Outbox dispatcher failed: {}", e);
            }
            server_handle.stop(true).await;
            result
        }
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    health_server.await?;
    dispatcher_handle.await??;

    Ok(())
}
