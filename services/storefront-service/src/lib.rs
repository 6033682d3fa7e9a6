// =============================================================================
// STOREFRONT SERVICE - Library Root
// =============================================================================
// Everything except process startup lives in the library, so the integration
// tests under tests/ can drive the real Database against a throwaway Postgres.
// main.rs only wires these modules together.
// =============================================================================

pub mod checkout;    // Order assembly (checkout.rs)
pub mod config;      // Configuration loading (config.rs)
pub mod coupon;      // Coupon rules (coupon.rs)
pub mod db;          // PostgreSQL operations (db.rs)
pub mod error;       // Error types (error.rs)
pub mod handlers;    // HTTP request handlers (handlers.rs)
pub mod metrics;     // Prometheus metrics setup (metrics.rs)
pub mod models;      // Data structures (models.rs)
pub mod pricing;     // Shipping, tax and totals (pricing.rs)
pub mod session;     // Shopper identity (session.rs)

#[cfg(test)]
mod testing;         // In-memory checkout store for unit tests

use crate::checkout::OrderAssembler;
use crate::config::Config;
use crate::db::Database;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler through State<Arc<AppState>>.
//
// LEARNING NOTE:
// Database, the assembler and ConnectionManager are all cheap handles over
// shared pools, so cloning them is fine; nothing here needs a Mutex.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,

    /// Checkout flow, running its transactions on the same pool as `db`
    pub checkout: OrderAssembler<Database>,

    /// Redis connection for the product detail cache
    pub redis: redis::aio::ConnectionManager,

    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    pub config: Config,
}
