// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the database layer, the checkout flow and the
// HTTP handlers.
//
// LEARNING NOTES:
// - Rows are typed structs (FromRow), one per table, never untyped maps
// - Money is rust_decimal::Decimal, matching NUMERIC(10,2) columns
// - Postgres enum types map onto Rust enums with #[derive(sqlx::Type)]
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

// =============================================================================
// ENUMS
// =============================================================================

/// Coarse purchasability flag, independent of the exact stock count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "stock_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StockStatus {
    InStock,
    OutOfStock,
}

/// How a coupon's `value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    /// Flat amount off the subtotal
    Fixed,
    /// Percent of the subtotal
    Percentage,
}

/// Fulfilment lifecycle: pending → processing → shipped → delivered,
/// or cancelled. Only `Pending` is ever written by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
}

// =============================================================================
// CATALOG
// =============================================================================

/// A purchasable product as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub sku: String,
    pub description: Option<String>,

    /// List price
    pub price: Decimal,

    /// Promotional price, only honoured when lower than `price`
    pub sale_price: Option<Decimal>,

    /// Never negative (CHECK constraint)
    pub stock_quantity: i32,
    pub stock_status: StockStatus,
    pub is_active: bool,
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// The price a shopper pays right now.
    pub fn effective_price(&self) -> Decimal {
        crate::pricing::unit_price(self.price, self.sale_price)
    }

    /// What the product page shows as "in stock".
    pub fn is_in_stock(&self) -> bool {
        self.stock_status == StockStatus::InStock && self.stock_quantity > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
    pub is_active: bool,

    /// Number of active products in this category
    pub product_count: i64,
}

/// A product as shown in the listing: the row plus its primary image and
/// approved-review rating.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductListItem {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub product: Product,
    pub primary_image: Option<String>,
    pub image_alt: Option<String>,

    /// Mean approved rating rounded to 1 dp, 0 when unreviewed
    pub average_rating: Decimal,
    pub review_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProductImage {
    pub image_url: String,
    pub alt_text: Option<String>,
    pub sort_order: i32,
    pub is_primary: bool,
}

/// Category reference embedded in a product detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CategoryRef {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

/// An approved review. Reviews awaiting moderation are never returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub id: i64,
    pub rating: i16,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub is_verified_purchase: bool,
    pub helpful_count: i32,
    pub created_at: DateTime<Utc>,
    pub author_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub average_rating: Decimal,
    pub review_count: i64,

    /// Newest first, at most ten
    pub recent: Vec<Review>,
}

/// Product sharing a category with the one being viewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RelatedProduct {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub price: Decimal,
    pub sale_price: Option<Decimal>,
    pub primary_image: Option<String>,
    pub image_alt: Option<String>,
}

/// Everything the product page needs. Also the shape stored in the Redis
/// product cache, so it round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    pub in_stock: bool,
    pub images: Vec<ProductImage>,
    pub categories: Vec<CategoryRef>,
    pub reviews: ReviewSummary,
    pub related_products: Vec<RelatedProduct>,
}

/// Response for listing products with pagination metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductListResponse {
    pub items: Vec<ProductListItem>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryListResponse {
    pub categories: Vec<Category>,
    pub total: usize,
}

// =============================================================================
// CART
// =============================================================================

/// Who a cart belongs to. Exactly one of user id / guest key is ever set on
/// a cart row; this enum makes the XOR unrepresentable in Rust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOwner {
    User(i64),
    Guest(String),
}

impl CartOwner {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            CartOwner::User(id) => Some(*id),
            CartOwner::Guest(_) => None,
        }
    }

    pub fn guest_key(&self) -> Option<&str> {
        match self {
            CartOwner::User(_) => None,
            CartOwner::Guest(key) => Some(key),
        }
    }
}

/// Cart line joined with the product fields the cart drawer shows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CartItemView {
    pub id: i64,
    pub product_id: i64,
    pub name: String,
    pub slug: String,
    pub sku: String,
    pub quantity: i32,
    pub price: Decimal,
    pub stock_quantity: i32,
    pub stock_status: StockStatus,
}

impl CartItemView {
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddToCartRequest {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCartRequest {
    pub quantity: i32,
}

/// Short summary returned after a cart mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartSummary {
    pub message: String,
    pub cart_count: i64,
    pub cart_total: Decimal,
}

/// Full cart with a preview of the checkout figures.
#[derive(Debug, Clone, Serialize)]
pub struct CartResponse {
    pub items: Vec<CartItemView>,
    pub item_count: i64,
    pub subtotal: Decimal,
    pub shipping_amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub free_shipping_threshold: Decimal,
    pub free_shipping_eligible: bool,
    pub remaining_for_free_shipping: Decimal,
}

// =============================================================================
// COUPONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    pub minimum_amount: Decimal,
    pub maximum_discount: Option<Decimal>,
    pub is_active: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub used_count: i32,
}

// =============================================================================
// ORDERS
// =============================================================================

/// Postal address captured verbatim into the order snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub address_line_1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_line_2: Option<String>,
    pub city: String,
    pub state: String,
    pub postcode: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

fn default_country() -> String {
    "Malaysia".to_string()
}

/// One line of the cart snapshot submitted at checkout.
///
/// `price` and `name` are whatever the browser had; both are ignored in
/// favour of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutLine {
    #[serde(alias = "id")]
    pub product_id: i64,
    pub quantity: i32,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Request body for `POST /api/v1/orders`
///
/// # Example JSON
/// ```json
/// {
///   "cart_items": [{ "product_id": 3, "quantity": 2 }],
///   "shipping_address": { "first_name": "Aina", "...": "..." },
///   "billing_address": { "first_name": "Aina", "...": "..." },
///   "payment_method": "fpx",
///   "coupon_code": "WELCOME10"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub cart_items: Vec<CheckoutLine>,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub payment_method: String,
    #[serde(default)]
    pub payment_details: Option<serde_json::Value>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Everything the order row needs, computed before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub order_number: String,
    pub user_id: Option<i64>,
    pub guest_session_id: Option<String>,
    pub payment_method: String,
    pub payment_details: Option<serde_json::Value>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub notes: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

/// Order line before it has an order id: name/sku/price are frozen copies.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLineDraft {
    pub product_id: i64,
    pub product_name: String,
    pub product_sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// One row of the `orders` table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub order_number: String,
    pub user_id: Option<i64>,
    #[serde(skip_serializing)]
    pub guest_session_id: Option<String>,
    pub payment_method: String,
    pub payment_details: Option<Json<serde_json::Value>>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub shipping_address: Json<Address>,
    pub billing_address: Json<Address>,
    pub notes: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Whether `owner` may read this order.
    pub fn is_owned_by(&self, owner: &CartOwner) -> bool {
        match owner {
            CartOwner::User(id) => self.user_id == Some(*id),
            CartOwner::Guest(key) => {
                self.user_id.is_none() && self.guest_session_id.as_deref() == Some(key.as_str())
            }
        }
    }
}

/// One row of the `order_items` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItemRecord {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub product_name: String,
    pub product_sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: OrderRecord,
    pub items: Vec<OrderItemRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub product_id: i64,
    pub name: String,
    pub sku: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl From<&OrderLineDraft> for ReceiptLine {
    fn from(line: &OrderLineDraft) -> Self {
        Self {
            product_id: line.product_id,
            name: line.product_name.clone(),
            sku: line.product_sku.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            line_total: line.line_total,
        }
    }
}

/// What a successful checkout returns to the shopper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: i64,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub items: Vec<ReceiptLine>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub current_page: i64,
    pub total_pages: i64,
    pub total_orders: i64,
    pub per_page: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        let total_pages = if per_page > 0 {
            (total + per_page - 1) / per_page
        } else {
            0
        };
        Self {
            current_page: page,
            total_pages,
            total_orders: total,
            per_page,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderHistoryResponse {
    pub orders: Vec<OrderDetail>,
    pub pagination: Pagination,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}
