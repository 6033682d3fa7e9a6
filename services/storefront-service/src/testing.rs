//! In-memory checkout store for unit tests.
//!
//! A transaction takes the whole store lock for its lifetime and works on a
//! private copy of the state; `commit` swaps the copy in, dropping or rolling
//! back throws it away. That is stricter than Postgres row locks but gives the
//! same guarantees the checkout relies on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::checkout::{CheckoutStore, CheckoutTx, StoreError, StoreResult};
use crate::models::{CartOwner, Coupon, NewOrder, OrderLineDraft, Product, StockStatus};
use crate::pricing::SiteSettings;

/// Where an injected write failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertOrderLine,
    DecrementStock,
    ClearCart,
    Commit,
}

/// A stored cart row: exactly one of `user_id` / `session_id` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct CartLine {
    pub id: i64,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub product_id: i64,
    pub quantity: i32,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub products: BTreeMap<i64, Product>,
    pub coupons: Vec<Coupon>,
    /// (coupon id, user id, order id, discount)
    pub coupon_usage: Vec<(i64, Option<i64>, i64, Decimal)>,
    /// Order id is the position in this vec plus one
    pub orders: Vec<NewOrder>,
    pub order_lines: Vec<(i64, OrderLineDraft)>,
    pub cart: Vec<CartLine>,
    pub settings: Vec<(String, String)>,
    /// Number of transactions opened so far
    pub begun: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_at: Arc<StdMutex<Option<FailPoint>>>,
    reject_order_numbers: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    pub async fn put_coupon(&self, coupon: Coupon) {
        self.state.lock().await.coupons.push(coupon);
    }

    pub async fn put_cart_line(
        &self,
        owner: &CartOwner,
        product_id: i64,
        quantity: i32,
        price: Decimal,
    ) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let id = state.cart.len() as i64 + 1;
        state.cart.push(CartLine {
            id,
            user_id: owner.user_id(),
            session_id: owner.guest_key().map(str::to_string),
            product_id,
            quantity,
            price,
            created_at: now,
        });
    }

    /// Make the next transaction fail at `point`.
    pub fn fail_at(&self, point: FailPoint) {
        if let Ok(mut slot) = self.fail_at.lock() {
            *slot = Some(point);
        }
    }

    /// Pretend every generated order number is already taken.
    pub fn reject_all_order_numbers(&self) {
        self.reject_order_numbers.store(true, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_at: Option<FailPoint>,
    reject_order_numbers: bool,
}

impl MemoryTx {
    fn check(&self, point: FailPoint) -> StoreResult<()> {
        if self.fail_at == Some(point) {
            return Err(StoreError::Unavailable(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckoutStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let mut guard = self.state.clone().lock_owned().await;
        guard.begun += 1;
        let working = guard.clone();
        let fail_at = self.fail_at.lock().ok().and_then(|mut slot| slot.take());
        Ok(MemoryTx {
            guard,
            working,
            fail_at,
            reject_order_numbers: self.reject_order_numbers.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl CheckoutTx for MemoryTx {
    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>> {
        Ok(self.working.products.get(&product_id).cloned())
    }

    async fn site_settings(&mut self) -> StoreResult<SiteSettings> {
        Ok(SiteSettings::from_pairs(self.working.settings.clone()))
    }

    async fn find_coupon(&mut self, code: &str) -> StoreResult<Option<Coupon>> {
        Ok(self
            .working
            .coupons
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn order_number_exists(&mut self, order_number: &str) -> StoreResult<bool> {
        Ok(self.reject_order_numbers
            || self
                .working
                .orders
                .iter()
                .any(|o| o.order_number == order_number))
    }

    async fn insert_order(&mut self, order: &NewOrder) -> StoreResult<(i64, DateTime<Utc>)> {
        self.working.orders.push(order.clone());
        Ok((self.working.orders.len() as i64, Utc::now()))
    }

    async fn insert_order_line(
        &mut self,
        order_id: i64,
        line: &OrderLineDraft,
    ) -> StoreResult<()> {
        self.check(FailPoint::InsertOrderLine)?;
        self.working.order_lines.push((order_id, line.clone()));
        Ok(())
    }

    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<()> {
        self.check(FailPoint::DecrementStock)?;
        let product = self
            .working
            .products
            .get_mut(&product_id)
            .ok_or_else(|| StoreError::Unavailable(format!("no product {product_id}")))?;
        let remaining = product.stock_quantity - quantity;
        if remaining < 0 {
            // mirrors the CHECK (stock_quantity >= 0) constraint
            return Err(StoreError::Unavailable(format!(
                "stock for product {product_id} would go negative"
            )));
        }
        product.stock_quantity = remaining;
        if remaining == 0 {
            product.stock_status = StockStatus::OutOfStock;
        }
        Ok(())
    }

    async fn record_coupon_usage(
        &mut self,
        coupon_id: i64,
        user_id: Option<i64>,
        order_id: i64,
        discount: Decimal,
    ) -> StoreResult<()> {
        self.working
            .coupon_usage
            .push((coupon_id, user_id, order_id, discount));
        if let Some(coupon) = self.working.coupons.iter_mut().find(|c| c.id == coupon_id) {
            coupon.used_count += 1;
        }
        Ok(())
    }

    async fn clear_cart(&mut self, owner: &CartOwner) -> StoreResult<u64> {
        self.check(FailPoint::ClearCart)?;
        let before = self.working.cart.len();
        self.working.cart.retain(|line| match owner {
            CartOwner::User(id) => line.user_id != Some(*id),
            CartOwner::Guest(key) => line.session_id.as_deref() != Some(key.as_str()),
        });
        Ok((before - self.working.cart.len()) as u64)
    }

    async fn commit(mut self) -> StoreResult<()> {
        self.check(FailPoint::Commit)?;
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

/// An active, in-stock product with sensible defaults.
pub fn product(id: i64, name: &str, price: Decimal, stock: i32) -> Product {
    let now = Utc::now();
    Product {
        id,
        name: name.to_string(),
        slug: name.to_lowercase().replace(' ', "-"),
        sku: format!("BS-{id:04}"),
        description: None,
        price,
        sale_price: None,
        stock_quantity: stock,
        stock_status: if stock > 0 {
            StockStatus::InStock
        } else {
            StockStatus::OutOfStock
        },
        is_active: true,
        is_featured: false,
        created_at: now,
        updated_at: now,
    }
}
