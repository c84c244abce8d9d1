use anyhow::Context;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::task;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use checkin_system::{
    AppState,
    config::{AppConfig, Config, LogFormat},
    services::audit::AuditService,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(app: &AppConfig) {
    let filter = EnvFilter::new(&app.rust_log);
    match app.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(&config.app);

    info!("Starting check-in service ({})", config.app.environment);

    // Хранилище, зал, seat map и привязка курсора
    let app_state = AppState::new(config.clone()).await?;

    // --- Start background tasks ---

    // Сверка курсора и выданных мест
    if config.audit.interval_seconds > 0 {
        let audit = AuditService::new(
            app_state.status.clone(),
            Duration::from_secs(config.audit.interval_seconds),
        );
        task::spawn(audit.run_forever());
    }

    // --- Start the web server ---

    let app = checkin_system::app(app_state.clone());

    let ip: IpAddr = config
        .app
        .host
        .parse()
        .with_context(|| format!("HOST must be an IP address, got '{}'", config.app.host))?;
    let addr = SocketAddr::new(ip, config.app.port);
    info!("Server is running on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
