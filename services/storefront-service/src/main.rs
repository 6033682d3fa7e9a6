// =============================================================================
// STOREFRONT SERVICE - Main Entry Point
// =============================================================================
// Backend for the Bloomspace plant shop.
//
// WHAT THIS SERVICE DOES:
// - Serves the product catalog and categories
// - Keeps carts for logged-in users and guests
// - Turns a cart into an order in one transaction: stock checked and
//   decremented, prices taken from the catalog, coupon applied, cart cleared
// - Exposes Prometheus metrics and JSON logs
//
// LEARNING GOALS:
// - Transactions and row locks with sqlx
// - Putting a trait between business logic and storage so it can be tested
//   without a database
// - Custom Axum extractors
// =============================================================================

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
// The modules live in the library crate (lib.rs)
use axum::{
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_service::checkout::OrderAssembler;
use storefront_service::config::Config;
use storefront_service::db::Database;
use storefront_service::metrics::setup_metrics;
use storefront_service::{handlers, session, AppState};

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Example: RUST_LOG=info,storefront_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,storefront_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Storefront Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        product_cache_ttl_secs = config.product_cache_ttl_secs,
        session_cleanup = config.session_cleanup,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL and migrate
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis
    // -------------------------------------------------------------------------
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    // -------------------------------------------------------------------------
    // STEP 7: Create application state
    // -------------------------------------------------------------------------
    let port = config.port;
    let state = Arc::new(AppState {
        checkout: OrderAssembler::new(db.clone()),
        db,
        redis: redis_conn,
        metrics_handle,
        config,
    });

    // -------------------------------------------------------------------------
    // STEP 8: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))

        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Catalog -----
        .route("/api/v1/products", get(handlers::list_products))
        .route("/api/v1/products/:id", get(handlers::get_product))
        .route("/api/v1/categories", get(handlers::list_categories))

        // ----- Cart -----
        .route(
            "/api/v1/cart",
            get(handlers::get_cart).post(handlers::add_to_cart),
        )
        .route(
            "/api/v1/cart/:product_id",
            put(handlers::update_cart_item).delete(handlers::remove_cart_item),
        )

        // ----- Orders -----
        .route(
            "/api/v1/orders",
            get(handlers::list_orders).post(handlers::create_order),
        )
        .route("/api/v1/orders/:id", get(handlers::get_order))

        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                // The browser must be able to read a freshly issued guest key
                .expose_headers([axum::http::HeaderName::from_static(session::GUEST_HEADER)]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Storefront Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
