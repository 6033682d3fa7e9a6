// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer).
//
// LEARNING NOTES:
// - Handlers stay thin: parse input, call db/checkout, record metrics
// - `Shopper` is our own extractor (session.rs); listing it as an argument
//   resolves the logged-in user or guest before the handler body runs
// - Every response that might have minted a guest key carries the
//   X-Guest-Session header, so handlers return (HeaderMap, Json<T>)
//
// AXUM EXTRACTORS USED:
// - State<T>: shared application state
// - Path<T>: /api/v1/products/:id → id
// - Query<T>: ?page=1&limit=12
// - Json<T>: request body
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::db::{ProductFilter, ProductSort};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::session::Shopper;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness check
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "storefront-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check: database and Redis both reachable.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// CATALOG ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// QUERY PARAMETERS
// -----------------------------------------------------------------------------
/// Query parameters for the product listing
///
/// # Example
/// GET /api/v1/products?category=succulents&sort=price&order=asc&limit=24
#[derive(Debug, Default, Deserialize)]
pub struct ProductListParams {
    #[serde(default = "default_page")]
    pub page: i64,

    /// Items per page (default: 12, max: 100)
    #[serde(default = "default_product_limit")]
    pub limit: i64,

    /// Category slug
    pub category: Option<String>,
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub featured: Option<bool>,

    /// name | price | created_at
    pub sort: Option<String>,

    /// asc | desc (default: desc)
    pub order: Option<String>,
}

/// Query parameters for order history
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: i64,

    /// Orders per page (default: 10, max: 50)
    #[serde(default = "default_order_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}
fn default_product_limit() -> i64 {
    12
}
fn default_order_limit() -> i64 {
    10
}

impl ProductListParams {
    fn into_filter(self) -> ProductFilter {
        let non_blank = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        ProductFilter {
            page: self.page.max(1),
            per_page: self.limit.clamp(1, 100),
            category: non_blank(self.category),
            search: non_blank(self.search),
            min_price: self.min_price,
            max_price: self.max_price,
            featured: self.featured,
            sort: self.sort.as_deref().map(ProductSort::parse).unwrap_or_default(),
            descending: !matches!(self.order.as_deref(), Some(o) if o.eq_ignore_ascii_case("asc")),
        }
    }
}

fn product_cache_key(product_id: i64) -> String {
    format!("product:{}", product_id)
}

// -----------------------------------------------------------------------------
// LIST PRODUCTS
// -----------------------------------------------------------------------------
/// GET /api/v1/products
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProductListParams>,
) -> AppResult<Json<ProductListResponse>> {
    let start = Instant::now();

    let filter = params.into_filter();
    let (items, total) = state.db.list_products(&filter).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/products", 200, duration);
    metrics::record_db_query("list_products", duration);

    Ok(Json(ProductListResponse {
        items,
        total,
        page: filter.page,
        per_page: filter.per_page,
    }))
}

// -----------------------------------------------------------------------------
// GET SINGLE PRODUCT
// -----------------------------------------------------------------------------
/// Product detail, served from Redis when cached.
///
/// The cache is for display only. Checkout always re-reads the product row
/// under lock.
///
/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> AppResult<Json<ProductDetail>> {
    let start = Instant::now();

    let cache_key = product_cache_key(product_id);
    let cached: Option<String> = redis::cmd("GET")
        .arg(&cache_key)
        .query_async(&mut state.redis.clone())
        .await
        .ok()
        .flatten();

    if let Some(cached_json) = cached {
        if let Ok(product) = serde_json::from_str::<ProductDetail>(&cached_json) {
            let duration = start.elapsed().as_secs_f64();
            metrics::record_http_request("GET", "/api/v1/products/:id", 200, duration);
            metrics::record_redis_operation("get", duration);
            return Ok(Json(product));
        }
    }

    let product = state
        .db
        .get_product_detail(product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", product_id)))?;

    // A cache write failure only costs us the next lookup
    match serde_json::to_string(&product) {
        Ok(product_json) => {
            let set_start = Instant::now();
            let result: Result<(), _> = redis::cmd("SETEX")
                .arg(&cache_key)
                .arg(state.config.product_cache_ttl_secs)
                .arg(&product_json)
                .query_async(&mut state.redis.clone())
                .await;
            metrics::record_redis_operation("set", set_start.elapsed().as_secs_f64());
            if let Err(e) = result {
                tracing::warn!(error = %e, product_id, "Failed to cache product");
            }
        }
        Err(e) => tracing::warn!(error = %e, product_id, "Failed to serialise product for cache"),
    }

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/products/:id", 200, duration);
    metrics::record_db_query("get_product_detail", duration);

    Ok(Json(product))
}

// -----------------------------------------------------------------------------
// LIST CATEGORIES
// -----------------------------------------------------------------------------
/// GET /api/v1/categories
pub async fn list_categories(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<CategoryListResponse>> {
    let start = Instant::now();

    let categories = state.db.list_categories().await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/categories", 200, duration);
    metrics::record_db_query("list_categories", duration);

    Ok(Json(CategoryListResponse {
        total: categories.len(),
        categories,
    }))
}

// =============================================================================
// CART ENDPOINTS
// =============================================================================

/// Cart lines plus a preview of what checkout would charge.
///
/// GET /api/v1/cart
pub async fn get_cart(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
) -> AppResult<(HeaderMap, Json<CartResponse>)> {
    let start = Instant::now();

    let items = state.db.cart_lines(&shopper.owner).await?;
    let settings = state.db.site_settings().await?;

    let response = cart_response(items, &settings);

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/cart", 200, duration);

    Ok((shopper.response_headers(), Json(response)))
}

fn cart_response(items: Vec<CartItemView>, settings: &crate::pricing::SiteSettings) -> CartResponse {
    let subtotal: Decimal = items.iter().map(CartItemView::line_total).sum();
    let mut quote = crate::pricing::Quote::compute(subtotal, settings, Decimal::ZERO);
    if items.is_empty() {
        // Nothing to ship yet
        quote.shipping_amount = Decimal::ZERO;
        quote.total_amount = quote.subtotal + quote.tax_amount;
    }

    CartResponse {
        item_count: items.len() as i64,
        items,
        subtotal: quote.subtotal,
        shipping_amount: quote.shipping_amount,
        tax_amount: quote.tax_amount,
        total: quote.total_amount,
        free_shipping_threshold: settings.free_shipping_threshold,
        free_shipping_eligible: subtotal >= settings.free_shipping_threshold,
        remaining_for_free_shipping: settings.remaining_for_free_shipping(subtotal),
    }
}

/// POST /api/v1/cart
///
/// # Request Body
/// ```json
/// { "product_id": 3, "quantity": 1 }
/// ```
pub async fn add_to_cart(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Json(request): Json<AddToCartRequest>,
) -> AppResult<(HeaderMap, Json<CartSummary>)> {
    let start = Instant::now();

    let message = state.db.add_to_cart(&shopper.owner, &request).await?;
    let summary = cart_summary(&state, &shopper, message).await?;

    tracing::info!(
        product_id = request.product_id,
        quantity = request.quantity,
        user_id = ?shopper.user_id(),
        "Cart updated"
    );

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/cart", 200, duration);

    Ok((shopper.response_headers(), Json(summary)))
}

/// Set a line's quantity; zero or less removes the line.
///
/// PUT /api/v1/cart/:product_id
pub async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Path(product_id): Path<i64>,
    Json(request): Json<UpdateCartRequest>,
) -> AppResult<(HeaderMap, Json<CartSummary>)> {
    let start = Instant::now();

    let message = if request.quantity <= 0 {
        state.db.remove_from_cart(&shopper.owner, product_id).await?;
        "Item removed from cart"
    } else {
        state
            .db
            .update_cart_quantity(&shopper.owner, product_id, request.quantity)
            .await?;
        "Cart updated successfully"
    };
    let summary = cart_summary(&state, &shopper, message).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("PUT", "/api/v1/cart/:product_id", 200, duration);

    Ok((shopper.response_headers(), Json(summary)))
}

/// DELETE /api/v1/cart/:product_id
pub async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Path(product_id): Path<i64>,
) -> AppResult<(HeaderMap, Json<CartSummary>)> {
    let start = Instant::now();

    state.db.remove_from_cart(&shopper.owner, product_id).await?;
    let summary = cart_summary(&state, &shopper, "Item removed from cart").await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("DELETE", "/api/v1/cart/:product_id", 200, duration);

    Ok((shopper.response_headers(), Json(summary)))
}

async fn cart_summary(state: &AppState, shopper: &Shopper, message: &str) -> AppResult<CartSummary> {
    let (cart_count, cart_total) = state.db.cart_summary(&shopper.owner).await?;
    Ok(CartSummary {
        message: message.to_string(),
        cart_count,
        cart_total,
    })
}

// =============================================================================
// ORDER ENDPOINTS
// =============================================================================

/// Place an order from the submitted cart snapshot.
///
/// POST /api/v1/orders
///
/// # Response
/// - 201 Created: receipt with order number and totals
/// - 400 Bad Request: empty cart or bad quantity
/// - 404 Not Found: a product is gone or disabled
/// - 409 Conflict: out of stock / not enough stock
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, HeaderMap, Json<OrderReceipt>)> {
    let start = Instant::now();

    tracing::info!(
        lines = request.cart_items.len(),
        user_id = ?shopper.user_id(),
        coupon = ?request.coupon_code,
        "Checkout requested"
    );

    let result = state.checkout.create_order(&shopper.owner, &request).await;
    let duration = start.elapsed().as_secs_f64();

    let receipt = match result {
        Ok(receipt) => receipt,
        Err(err) => {
            metrics::record_checkout(err.kind());
            let error = AppError::from(err);
            metrics::record_http_request("POST", "/api/v1/orders", error.status().as_u16(), duration);
            return Err(error);
        }
    };

    metrics::record_checkout("success");
    metrics::record_order_total(receipt.total_amount);
    metrics::record_http_request("POST", "/api/v1/orders", 201, duration);

    // Stock changed: drop cached product details and refresh the gauges
    for line in &receipt.items {
        invalidate_product(&state, line.product_id).await;
        if let Ok(Some(product)) = state.db.get_product(line.product_id).await {
            metrics::set_stock_level(product.id, product.stock_quantity);
        }
    }

    Ok((StatusCode::CREATED, shopper.response_headers(), Json(receipt)))
}

async fn invalidate_product(state: &AppState, product_id: i64) {
    let del_start = Instant::now();
    let result: Result<(), _> = redis::cmd("DEL")
        .arg(product_cache_key(product_id))
        .query_async(&mut state.redis.clone())
        .await;
    metrics::record_redis_operation("delete", del_start.elapsed().as_secs_f64());

    if let Err(e) = result {
        tracing::warn!(error = %e, product_id, "Failed to invalidate product cache");
    }
}

/// Logged-in user's orders, newest first.
///
/// GET /api/v1/orders?page=1&limit=10
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Query(params): Query<PageParams>,
) -> AppResult<Json<OrderHistoryResponse>> {
    let start = Instant::now();

    let user_id = shopper.require_user()?;
    let page = params.page.max(1);
    let per_page = params.limit.clamp(1, 50);

    let (orders, total) = state.db.order_history(user_id, page, per_page).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/orders", 200, duration);
    metrics::record_db_query("order_history", duration);

    Ok(Json(OrderHistoryResponse {
        orders,
        pagination: Pagination::new(page, per_page, total),
    }))
}

/// One order with its lines. Someone else's order looks the same as a
/// missing one.
///
/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    shopper: Shopper,
    Path(order_id): Path<i64>,
) -> AppResult<(HeaderMap, Json<OrderDetail>)> {
    let start = Instant::now();

    let order = state
        .db
        .get_order(order_id)
        .await?
        .filter(|detail| detail.order.is_owned_by(&shopper.owner))
        .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", order_id)))?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/orders/:id", 200, duration);

    Ok((shopper.response_headers(), Json(order)))
}
