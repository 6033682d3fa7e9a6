// =============================================================================
// CHECKOUT MODULE
// =============================================================================
// Turns a submitted cart snapshot into a persisted order, atomically.
//
// FLOW (one database transaction):
//   Validating     - lock every product row, check active / in stock / enough
//   PriceLocking   - catalog prices, subtotal, shipping, tax, coupon
//   Persisting     - order number, order row, order lines
//   StockAdjusting - decrement stock, record coupon usage, clear the cart
//   Committed      - transaction committed, receipt returned
//
// Any error moves the flow to Aborted and rolls the transaction back: no
// order, no order lines, no stock change, no coupon usage, cart untouched.
//
// LEARNING NOTES:
// - The store is injected through the CheckoutStore trait. Production uses
//   Postgres (db.rs), the tests use an in-memory store (testing.rs)
// - Product rows are read with SELECT ... FOR UPDATE, so two concurrent
//   checkouts for the last unit are serialized by the database
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coupon;
use crate::models::{
    CartOwner, CheckoutLine, CheckoutRequest, Coupon, NewOrder, OrderLineDraft, OrderReceipt,
    OrderStatus, PaymentStatus, Product, ReceiptLine, StockStatus,
};
use crate::pricing::{self, Quote, SiteSettings};

/// Order numbers are retried this many times when the random suffix collides
/// with an existing order. The UNIQUE constraint still backs this up.
const MAX_ORDER_NUMBER_ATTEMPTS: usize = 5;

// =============================================================================
// ERRORS
// =============================================================================

/// Storage failure underneath the checkout.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("could not allocate a unique order number (last tried {0})")]
    DuplicateOrderNumber(String),

    #[error("{0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a checkout was refused.
///
/// Everything except `Persistence` is the shopper's to fix and is reported
/// verbatim; `Persistence` is logged and reported generically.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: i64, quantity: i32 },

    #[error("Product with ID {product_id} is not available")]
    ProductUnavailable { product_id: i64 },

    #[error("Product '{name}' is out of stock")]
    OutOfStock { product_id: i64, name: String },

    #[error("Insufficient stock for '{name}'. Available: {available}")]
    InsufficientStock {
        product_id: i64,
        name: String,
        available: i32,
        requested: i32,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<sqlx::Error> for CheckoutError {
    fn from(err: sqlx::Error) -> Self {
        CheckoutError::Persistence(StoreError::Database(err))
    }
}

impl CheckoutError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckoutError::EmptyCart => "empty_cart",
            CheckoutError::InvalidQuantity { .. } => "invalid_quantity",
            CheckoutError::ProductUnavailable { .. } => "product_unavailable",
            CheckoutError::OutOfStock { .. } => "out_of_stock",
            CheckoutError::InsufficientStock { .. } => "insufficient_stock",
            CheckoutError::Persistence(_) => "persistence_failure",
        }
    }
}

// =============================================================================
// STORE TRAITS
// =============================================================================

/// Opens checkout transactions.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    type Tx: CheckoutTx;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// Everything the checkout needs from one open transaction.
///
/// Dropping a transaction without calling `commit` must roll it back.
#[async_trait]
pub trait CheckoutTx: Send + Sized {
    /// Read a product and hold its row lock until commit/rollback.
    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>>;

    async fn site_settings(&mut self) -> StoreResult<SiteSettings>;

    /// Look a coupon up by code, locking it for the usage counter update.
    async fn find_coupon(&mut self, code: &str) -> StoreResult<Option<Coupon>>;

    async fn order_number_exists(&mut self, order_number: &str) -> StoreResult<bool>;

    /// Insert the order row, returning its id and creation time.
    async fn insert_order(&mut self, order: &NewOrder) -> StoreResult<(i64, DateTime<Utc>)>;

    async fn insert_order_line(&mut self, order_id: i64, line: &OrderLineDraft)
        -> StoreResult<()>;

    /// Subtract `quantity` from stock, flipping the status to out of stock
    /// when it reaches zero.
    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<()>;

    async fn record_coupon_usage(
        &mut self,
        coupon_id: i64,
        user_id: Option<i64>,
        order_id: i64,
        discount: Decimal,
    ) -> StoreResult<()>;

    /// Delete every cart line of `owner`, returning how many went.
    async fn clear_cart(&mut self, owner: &CartOwner) -> StoreResult<u64>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

// =============================================================================
// STAGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutStage {
    Validating,
    PriceLocking,
    Persisting,
    StockAdjusting,
    Committed,
    Aborted,
}

impl fmt::Display for CheckoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckoutStage::Validating => "validating",
            CheckoutStage::PriceLocking => "price_locking",
            CheckoutStage::Persisting => "persisting",
            CheckoutStage::StockAdjusting => "stock_adjusting",
            CheckoutStage::Committed => "committed",
            CheckoutStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A validated line with the product row it was checked against.
struct LockedLine {
    product: Product,
    quantity: i32,
}

// =============================================================================
// ORDER ASSEMBLER
// =============================================================================

/// Runs checkouts against a [`CheckoutStore`].
#[derive(Debug, Clone)]
pub struct OrderAssembler<S> {
    store: S,
}

impl<S: CheckoutStore> OrderAssembler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Create an order for `owner` from `request`, using the current time.
    pub async fn create_order(
        &self,
        owner: &CartOwner,
        request: &CheckoutRequest,
    ) -> Result<OrderReceipt, CheckoutError> {
        self.create_order_at(owner, request, Utc::now()).await
    }

    /// Create an order as of `now` (coupon expiry, order number date).
    pub async fn create_order_at(
        &self,
        owner: &CartOwner,
        request: &CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<OrderReceipt, CheckoutError> {
        let mut stage = CheckoutStage::Validating;

        // Shape checks need no transaction and write nothing
        let lines = merge_lines(&request.cart_items)?;

        let mut tx = self.store.begin().await?;

        match assemble(&mut tx, &mut stage, owner, request, &lines, now).await {
            Ok(receipt) => {
                if let Err(commit_err) = tx.commit().await {
                    warn!(failed_stage = %stage, stage = %CheckoutStage::Aborted, error = %commit_err, "Commit failed");
                    return Err(commit_err.into());
                }
                stage = CheckoutStage::Committed;
                info!(
                    stage = %stage,
                    order_id = receipt.order_id,
                    order_number = %receipt.order_number,
                    total = %receipt.total_amount,
                    "Order committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed checkout also failed");
                }
                info!(
                    failed_stage = %stage,
                    stage = %CheckoutStage::Aborted,
                    reason = err.kind(),
                    error = %err,
                    "Checkout aborted"
                );
                Err(err)
            }
        }
    }
}

/// Stock rules shared by checkout and the cart.
///
/// A product sold down to zero reports how many are left (none) so the
/// losing side of a race for the last unit learns why. Any other product
/// not marked in stock is out of stock whatever its count says; only then
/// is the requested quantity compared with the stock on hand.
pub fn check_stock(product: &Product, quantity: i32) -> Result<(), CheckoutError> {
    let insufficient = |available: i32| CheckoutError::InsufficientStock {
        product_id: product.id,
        name: product.name.clone(),
        available,
        requested: quantity,
    };

    if product.stock_quantity <= 0 {
        return Err(insufficient(0));
    }
    if product.stock_status != StockStatus::InStock {
        return Err(CheckoutError::OutOfStock {
            product_id: product.id,
            name: product.name.clone(),
        });
    }
    if quantity > product.stock_quantity {
        return Err(insufficient(product.stock_quantity));
    }
    Ok(())
}

/// Merge duplicate product ids and reject empty carts or bad quantities.
///
/// The result is ordered by product id so concurrent checkouts always take
/// row locks in the same order.
fn merge_lines(items: &[CheckoutLine]) -> Result<Vec<(i64, i32)>, CheckoutError> {
    if items.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }

    let mut merged: BTreeMap<i64, i32> = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(CheckoutError::InvalidQuantity {
                product_id: item.product_id,
                quantity: item.quantity,
            });
        }
        let entry = merged.entry(item.product_id).or_insert(0);
        *entry = entry
            .checked_add(item.quantity)
            .ok_or(CheckoutError::InvalidQuantity {
                product_id: item.product_id,
                quantity: item.quantity,
            })?;
    }

    Ok(merged.into_iter().collect())
}

async fn assemble<T: CheckoutTx>(
    tx: &mut T,
    stage: &mut CheckoutStage,
    owner: &CartOwner,
    request: &CheckoutRequest,
    lines: &[(i64, i32)],
    now: DateTime<Utc>,
) -> Result<OrderReceipt, CheckoutError> {
    // -------------------------------------------------------------------------
    // VALIDATING
    // -------------------------------------------------------------------------
    let mut locked = Vec::with_capacity(lines.len());
    for &(product_id, quantity) in lines {
        let product = tx
            .lock_product(product_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or(CheckoutError::ProductUnavailable { product_id })?;

        check_stock(&product, quantity)?;

        locked.push(LockedLine { product, quantity });
    }

    // -------------------------------------------------------------------------
    // PRICE LOCKING
    // -------------------------------------------------------------------------
    *stage = CheckoutStage::PriceLocking;
    debug!(stage = %stage, lines = locked.len(), "Stock validated");

    let drafts: Vec<OrderLineDraft> = locked
        .into_iter()
        .map(|line| {
            let unit_price = line.product.effective_price();
            OrderLineDraft {
                product_id: line.product.id,
                product_name: line.product.name,
                product_sku: line.product.sku,
                quantity: line.quantity,
                unit_price,
                line_total: pricing::line_total(unit_price, line.quantity),
            }
        })
        .collect();

    let subtotal: Decimal = drafts.iter().map(|d| d.line_total).sum();
    let settings = tx.site_settings().await?;

    let mut applied_coupon = None;
    let mut discount = Decimal::ZERO;
    if let Some(code) = request
        .coupon_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
    {
        let found = tx.find_coupon(code).await?;
        match coupon::evaluate(found.as_ref(), subtotal, now) {
            Ok(amount) => {
                discount = amount;
                applied_coupon = found.map(|c| c.id);
            }
            // Bad codes are not an error: the order goes through without one
            Err(reason) => info!(code, reason = %reason, "Coupon not applied"),
        }
    }

    let quote = Quote::compute(subtotal, &settings, discount);

    // -------------------------------------------------------------------------
    // PERSISTING
    // -------------------------------------------------------------------------
    *stage = CheckoutStage::Persisting;
    debug!(stage = %stage, subtotal = %quote.subtotal, total = %quote.total_amount, "Prices locked");

    let order_number = allocate_order_number(tx, now).await?;

    let new_order = NewOrder {
        order_number,
        user_id: owner.user_id(),
        guest_session_id: owner.guest_key().map(str::to_string),
        payment_method: request.payment_method.clone(),
        payment_details: request.payment_details.clone(),
        subtotal: quote.subtotal,
        tax_amount: quote.tax_amount,
        shipping_amount: quote.shipping_amount,
        discount_amount: quote.discount_amount,
        total_amount: quote.total_amount,
        shipping_address: request.shipping_address.clone(),
        billing_address: request.billing_address.clone(),
        notes: request.notes.clone(),
        status: OrderStatus::Pending,
        payment_status: PaymentStatus::Unpaid,
    };

    let (order_id, created_at) = tx.insert_order(&new_order).await?;
    for draft in &drafts {
        tx.insert_order_line(order_id, draft).await?;
    }

    // -------------------------------------------------------------------------
    // STOCK ADJUSTING
    // -------------------------------------------------------------------------
    *stage = CheckoutStage::StockAdjusting;
    debug!(stage = %stage, order_id, "Order rows written");

    for draft in &drafts {
        tx.decrement_stock(draft.product_id, draft.quantity).await?;
    }

    if quote.discount_amount > Decimal::ZERO {
        if let Some(coupon_id) = applied_coupon {
            tx.record_coupon_usage(coupon_id, owner.user_id(), order_id, quote.discount_amount)
                .await?;
        }
    }

    let cleared = tx.clear_cart(owner).await?;
    debug!(order_id, cleared, "Cart cleared");

    Ok(OrderReceipt {
        order_id,
        order_number: new_order.order_number,
        status: new_order.status,
        payment_status: new_order.payment_status,
        payment_method: new_order.payment_method,
        subtotal: quote.subtotal,
        tax_amount: quote.tax_amount,
        shipping_amount: quote.shipping_amount,
        discount_amount: quote.discount_amount,
        total_amount: quote.total_amount,
        items: drafts.iter().map(ReceiptLine::from).collect(),
        created_at,
    })
}

// -----------------------------------------------------------------------------
// ORDER NUMBERS
// -----------------------------------------------------------------------------

/// `BS` + `YYYYMMDD` + four digit random suffix, e.g. `BS202610170042`.
pub fn generate_order_number<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> String {
    format!("BS{}{:04}", now.format("%Y%m%d"), rng.gen_range(1..=9999))
}

/// Pick an order number not yet used. Only 9999 numbers exist per day, so
/// this retries a few times before giving up.
async fn allocate_order_number<T: CheckoutTx>(
    tx: &mut T,
    now: DateTime<Utc>,
) -> Result<String, CheckoutError> {
    let mut candidate = String::new();
    for attempt in 1..=MAX_ORDER_NUMBER_ATTEMPTS {
        candidate = generate_order_number(now, &mut rand::thread_rng());
        if !tx.order_number_exists(&candidate).await? {
            return Ok(candidate);
        }
        warn!(order_number = %candidate, attempt, "Order number collision, retrying");
    }
    Err(StoreError::DuplicateOrderNumber(candidate).into())
}
