//! Conversation Insights Service — ingest threaded support conversations,
//! persist them, and derive per-thread insights (sentiment, topics, gaps)
//! through an LLM in the background.
//!
//! HTTP API under /api/v1; health at /health, metrics at /metrics.

mod circuit_breaker;
mod config;
mod db;
mod llm;
mod metrics;
mod normalize;
mod pre_filter;
mod queue;
mod rate_limiter;
mod routes;
mod worker;

use routes::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = config::Config::from_env();

    log::info!("Opening database at: {}", config.database_url);
    let database = Arc::new(db::Db::open(&config.database_url).expect("Failed to open database"));

    let llm_client = llm::LlmClient::new(&config).expect("Failed to build LLM client");
    if config.llm_api_key.is_empty() {
        log::warn!("LLM_API_KEY not set — analyses will be recorded as skipped");
    }

    let state = Arc::new(AppState {
        db: database.clone(),
        queue: Arc::new(queue::WorkQueue::new(config.max_queue_depth)),
        rate_limiter: Arc::new(rate_limiter::RateLimiter::new(config.llm_rpm, config.llm_tpm)),
        breaker: Arc::new(circuit_breaker::CircuitBreaker::new(
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_cooldown_seconds),
        )),
        llm: Arc::new(llm::LlmBackend::Http(llm_client)),
        metrics: Arc::new(metrics::Metrics::new()),
        accepting: AtomicBool::new(true),
        config: config.clone(),
    });

    // Re-enqueue conversations a previous process persisted but never
    // analyzed (the in-memory queue does not survive a crash).
    let recovered = worker::sweep_pending(&state);
    if recovered > 0 {
        log::info!("Boot recovery enqueued {} pending conversations", recovered);
    }

    let worker_state = state.clone();
    let worker_handle = tokio::spawn(async move {
        worker::run_worker(worker_state).await;
    });
    let sweeper_state = state.clone();
    let sweeper_handle = tokio::spawn(async move {
        worker::run_sweeper(sweeper_state).await;
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route(
            "/api/v1/conversations",
            axum::routing::post(routes::ingest_single),
        )
        .route(
            "/api/v1/conversations/bulk",
            axum::routing::post(routes::ingest_bulk),
        )
        .route(
            "/api/v1/conversations/bulk/stream",
            axum::routing::post(routes::ingest_stream),
        )
        .route("/api/v1/insights", axum::routing::get(routes::get_insights))
        .route("/api/v1/trends", axum::routing::get(routes::get_trends))
        .route("/health", axum::routing::get(routes::health))
        .route("/metrics", axum::routing::get(routes::metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            routes::track_latency,
        ))
        .with_state(state.clone())
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    log::info!("Conversation Insights Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            begin_shutdown(&shutdown_state);
        })
        .await
        .expect("Server error");

    // Let the analyzer drain what it already holds, then exit.
    sweeper_handle.abort();
    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    match tokio::time::timeout(grace, worker_handle).await {
        Ok(_) => log::info!("Analyzer drained, exiting"),
        Err(_) => log::warn!(
            "Analyzer did not drain within {}s, exiting anyway",
            config.shutdown_grace_seconds
        ),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Flip the service into drain mode: refuse new writes, close the queue,
/// and cancel any analyzer wait blocked in the rate limiter.
fn begin_shutdown(state: &AppState) {
    log::info!("Shutdown signal received; refusing new writes and draining");
    state.accepting.store(false, Ordering::SeqCst);
    state.queue.close();
    state.rate_limiter.close();
}
