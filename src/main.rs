//! Rentvault Backend Server
//!
//! Composition root for the booking/escrow/wallet core: builds the database
//! pool, wires the gateway and notification collaborators into the
//! services, owns the two reconciliation workers, and serves the API.

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use rentvault_server::app_state::AppState;
use rentvault_server::booking_service::BookingService;
use rentvault_server::config::AppConfig;
use rentvault_server::expiry_sweeper::ExpiredBookingSweeper;
use rentvault_server::fees::PlatformFeeService;
use rentvault_server::gateway::HttpPaymentGateway;
use rentvault_server::notifications::TracingNotificationSink;
use rentvault_server::payment_verifier::PaymentVerifier;
use rentvault_server::routes;
use rentvault_server::wallet_service::WalletService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let gateway = Arc::new(HttpPaymentGateway::new(
        config.gateway.base_url.clone(),
        config.gateway.secret_key.clone(),
        config.gateway.timeout,
    ));
    let notifier = Arc::new(TracingNotificationSink);
    let fees = PlatformFeeService::new(config.platform_fee_bps);

    let booking_service = Arc::new(BookingService::new(
        pool.clone(),
        gateway,
        notifier.clone(),
        fees,
    ));
    let wallet_service = Arc::new(WalletService::new(pool.clone(), notifier));

    // Reconciliation workers are owned here and stopped on shutdown.
    let verifier = Arc::new(PaymentVerifier::new(
        pool.clone(),
        booking_service.clone(),
        config.workers.verifier_interval,
        config.workers.verifier_min_age,
        config.workers.verifier_max_retries,
    ));
    let sweeper = Arc::new(ExpiredBookingSweeper::new(
        pool.clone(),
        config.workers.sweeper_interval,
        config.workers.sweeper_threshold,
    ));
    let verifier_handle = verifier.clone().start();
    let sweeper_handle = sweeper.clone().start();

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(routes::booking_routes())
        .merge(routes::wallet_routes())
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(AppState::new(booking_service, wallet_service));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    verifier.stop();
    sweeper.stop();
    let _ = verifier_handle.await;
    let _ = sweeper_handle.await;

    Ok(())
}

async fn root() -> &'static str {
    "Rentvault API Server"
}

async fn health_check() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn build_cors_layer() -> CorsLayer {
    let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(false)
}
