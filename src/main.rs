use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

use llm_gateway::health::HealthChecker;
use llm_gateway::{config, db, server};

#[tokio::main]
async fn main() -> llm_gateway::error::Result<()> {
    // Local development: load `.env` without panicking (no-op if missing).
    dotenvy::dotenv().ok();

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = config::Settings::load()?;
    let database = db::Database::open(&settings.database.path).await?;

    let state = server::AppState::new(settings, database);

    // 后台任务统一用 watch 通道协作停机
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = Arc::clone(&state.pool).spawn_sweeper(shutdown_rx.clone());
    let checker = HealthChecker::new(
        state.db.clone(),
        Arc::clone(&state.pool),
        Arc::clone(&state.health),
    )
    .spawn(shutdown_rx);

    let addr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    let app = server::create_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway server running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 通知后台任务退出并等待收尾
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, checker);
    tracing::info!(
        pool = ?state.pool.stats(),
        cache = ?state.cache.stats(),
        "gateway stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
