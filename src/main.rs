//! Fraudgate - Real-Time Transaction Decision Middleware
//!
//! Classifies every inbound transaction within a millisecond budget while
//! watching its own API surface for abuse and tracking behavioral risk
//! across logical user sessions.

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use chrono::{Duration as ChronoDuration, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fraudgate_backend::{
    api::{self, AppState},
    config::{Config, EngineConfig, EngineHandle},
    middleware::logging::request_logging,
    orchestrator::Orchestrator,
    pipeline::{scorer::MlScorer, DecisionPipeline, HistoryStore},
    security::{EventQueue, EventStore, RateLimiter, SecurityMonitor},
    session::{BehaviorScorer, SessionStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("🛡️ Fraudgate decision middleware starting");

    let config = Config::from_env()?;

    // Immutable-after-startup inputs. A missing model artifact is fatal; a
    // missing engine document falls back to built-in defaults.
    let engine = Arc::new(EngineHandle::new(
        EngineConfig::load(&config.engine_config_path)?,
        &config.engine_config_path,
    ));
    let scorer = Arc::new(MlScorer::load(&config.model_path, &config.calibration_path)?);

    // Durable stores.
    let event_store = Arc::new(EventStore::new(&config.event_db_path)?);
    let sessions = Arc::new(SessionStore::new(&config.session_db_path)?);

    // In-memory request-path state.
    let history = Arc::new(HistoryStore::new());
    let rate_limiter = Arc::new(RateLimiter::new());
    let monitor = Arc::new(SecurityMonitor::new());
    let event_queue = Arc::new(EventQueue::new(config.event_queue_capacity));

    let orchestrator = Arc::new(Orchestrator {
        engine: engine.clone(),
        pipeline: Arc::new(DecisionPipeline::new(history, scorer.clone())),
        rate_limiter: rate_limiter.clone(),
        monitor: monitor.clone(),
        event_store: event_store.clone(),
        event_queue: event_queue.clone(),
        sessions: sessions.clone(),
        behavior: BehaviorScorer::new(),
    });

    // Blocked-source rows without an unblocked_at are the source of truth
    // for blocking state across restarts.
    let restored = orchestrator.restore_blocks()?;
    if restored > 0 {
        info!("🚫 Re-armed {} blocked sources from the event store", restored);
    }

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid METRICS_ADDR {}", addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("📊 Prometheus metrics exposed on {}", addr);
    }

    // Background workers.
    event_queue.spawn_drain(event_store.clone());

    {
        let sessions = sessions.clone();
        let max_age_hours = config.session_max_age_hours;
        let cleanup_secs = config.session_cleanup_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cleanup_secs.max(60)));
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let cutoff = now - ChronoDuration::hours(max_age_hours);
                if let Err(e) = sessions.cleanup(cutoff, now) {
                    warn!(error = %e, "session cleanup sweep failed");
                }
            }
        });
    }

    {
        let rate_limiter = rate_limiter.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                let now = Utc::now();
                rate_limiter.cleanup(now);
                monitor.cleanup(now);
            }
        });
    }

    // SIGHUP swaps in fresh rules/policy/tier config and model artifacts
    // without stopping admission. The change itself is a security signal.
    {
        let engine = engine.clone();
        let scorer = scorer.clone();
        let monitor = monitor.clone();
        let event_queue = event_queue.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("SIGHUP handler unavailable, config hot-reload disabled");
                return;
            };
            while hangup.recv().await.is_some() {
                if let Err(e) = engine.reload() {
                    warn!(error = %e, "engine config reload failed, keeping previous");
                }
                if let Err(e) = scorer.reload() {
                    warn!(error = %e, "model reload failed, keeping previous");
                }
                event_queue.push(fraudgate_backend::security::StoreJob::Event(
                    monitor.system_anomaly("system", "-", "engine configuration reloaded"),
                ));
            }
        });
    }

    let state = AppState {
        orchestrator,
        started_at: Utc::now(),
    };

    let app = api::router(state, config.analyst_api_token.clone())
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fraudgate_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
