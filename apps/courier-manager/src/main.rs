use std::{net::SocketAddr, sync::Arc, time::Duration};

use courier_manager::{
    build_router,
    clock::SystemClock,
    config::AppConfig,
    state::AppState,
    store::{CourierStore, MemoryStore, PostgresStore},
    telemetry::init_tracing,
};
use tokio::time::MissedTickBehavior;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);
    cfg.validate()?;

    let store: Arc<dyn CourierStore> = match &cfg.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.migrate().await?;
            info!("database migrations applied");
            Arc::new(store)
        }
        None => {
            warn!("COURIER_DATABASE_URL not set; leases and commands live in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::with_store(cfg.clone(), store, Arc::new(SystemClock));
    spawn_expiry_sweeper(state.clone(), cfg.expiry_sweep_interval_ms);
    spawn_dispatcher(state.clone(), cfg.dispatch_interval_ms);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(%addr, "starting courier manager");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Leases are also checked lazily on every call; the sweeper exists so that expiry
/// requeues in-flight work even when no agent calls back.
fn spawn_expiry_sweeper(state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.sweep_expired_leases().await {
                Ok(0) => {}
                Ok(swept) => info!(swept, "expired leases swept"),
                Err(err) => warn!(error = %err, "lease expiry sweep failed"),
            }
        }
    });
}

fn spawn_dispatcher(state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.processor().dispatch_all().await {
                Ok(report) if report.dispatched > 0 => {
                    debug!(dispatched = report.dispatched, skipped = report.skipped, "dispatch pass")
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "dispatch pass failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
