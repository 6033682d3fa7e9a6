//! PostgreSQL integration tests for the storefront database layer.
//!
//! Run with: cargo test --test postgres_storefront -- --nocapture
//!
//! Each test starts its own PostgreSQL container with testcontainers-rs,
//! runs the service's migrations (which also seed the demo catalog) and
//! exercises `Database` / `PgCheckoutTx` directly.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use storefront_service::checkout::{CheckoutError, OrderAssembler};
use storefront_service::db::{Database, ProductFilter, ProductSort};
use storefront_service::error::AppError;
use storefront_service::models::{
    AddToCartRequest, Address, CartOwner, CheckoutLine, CheckoutRequest, StockStatus,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

/// A migrated database plus a side pool for fixtures and verification.
struct Storefront {
    db: Database,
    pool: PgPool,
    // Kept alive for the whole test; dropping it stops PostgreSQL
    _container: ContainerAsync<GenericImage>,
}

async fn storefront() -> Storefront {
    // PostgreSQL prints the ready message once during init and once for real;
    // the short sleep below covers the gap
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "bloomspace")
        .with_env_var("POSTGRES_PASSWORD", "bloomspace")
        .with_env_var("POSTGRES_DB", "bloomspace")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let host = container.get_host().await.expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");
    let url = format!("postgres://bloomspace:bloomspace@{}:{}/bloomspace", host, port);

    let db = Database::connect(&url).await.expect("Failed to connect");
    db.run_migrations().await.expect("Failed to migrate");
    let pool = PgPool::connect(&url).await.expect("Failed to open fixture pool");

    Storefront {
        db,
        pool,
        _container: container,
    }
}

async fn insert_product(pool: &PgPool, sku: &str, price: Decimal, stock: i32) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO products (name, slug, sku, price, stock_quantity)
        VALUES ($1, $2, $1, $3, $4)
        RETURNING id
        "#,
    )
    .bind(sku)
    .bind(sku.to_lowercase())
    .bind(price)
    .bind(stock)
    .fetch_one(pool)
    .await
    .expect("Failed to insert product");
    id
}

async fn insert_user(pool: &PgPool, email: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO users (email, first_name, last_name) VALUES ($1, 'Test', 'Shopper') RETURNING id",
    )
    .bind(email)
    .fetch_one(pool)
    .await
    .expect("Failed to insert user");
    id
}

async fn stock_of(pool: &PgPool, product_id: i64) -> (i32, StockStatus) {
    sqlx::query_as("SELECT stock_quantity, stock_status FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_one(pool)
        .await
        .expect("Failed to read stock")
}

async fn product_id_by_slug(pool: &PgPool, slug: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as("SELECT id FROM products WHERE slug = $1")
        .bind(slug)
        .fetch_one(pool)
        .await
        .expect("Seeded product missing");
    id
}

fn address() -> Address {
    Address {
        first_name: "Nur".into(),
        last_name: "Hassan".into(),
        company: None,
        address_line_1: "12 Jalan Bunga".into(),
        address_line_2: None,
        city: "Kuala Lumpur".into(),
        state: "WP".into(),
        postcode: "50450".into(),
        country: "Malaysia".into(),
        phone: None,
        email: None,
    }
}

fn checkout_request(lines: &[(i64, i32)]) -> CheckoutRequest {
    CheckoutRequest {
        cart_items: lines
            .iter()
            .map(|&(product_id, quantity)| CheckoutLine {
                product_id,
                quantity,
                price: None,
                name: None,
            })
            .collect(),
        shipping_address: address(),
        billing_address: address(),
        payment_method: "cod".into(),
        payment_details: None,
        coupon_code: None,
        notes: None,
    }
}

fn add(product_id: i64, quantity: i32) -> AddToCartRequest {
    AddToCartRequest {
        product_id,
        quantity,
    }
}

// =============================================================================
// CHECKOUT
// =============================================================================

#[tokio::test]
async fn last_unit_goes_to_exactly_one_checkout() {
    let sf = storefront().await;
    let fern = insert_product(&sf.pool, "TEST-FERN", dec!(40), 1).await;
    let assembler = OrderAssembler::new(sf.db.clone());

    let first = CartOwner::Guest("guest-first".into());
    let second = CartOwner::Guest("guest-second".into());
    let req = checkout_request(&[(fern, 1)]);

    let (a, b) = tokio::join!(
        assembler.create_order(&first, &req),
        assembler.create_order(&second, &req)
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert!(
        matches!(
            loser,
            CheckoutError::InsufficientStock { available: 0, requested: 1, .. }
        ),
        "unexpected error: {loser:?}"
    );

    // Selling the last unit flips the status too
    assert_eq!(stock_of(&sf.pool, fern).await, (0, StockStatus::OutOfStock));

    let (orders,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(&sf.pool)
        .await
        .unwrap();
    assert_eq!(orders, 1);
}

#[tokio::test]
async fn partial_sale_keeps_product_in_stock() {
    let sf = storefront().await;
    let palm = insert_product(&sf.pool, "TEST-PALM", dec!(30), 5).await;

    OrderAssembler::new(sf.db.clone())
        .create_order(&CartOwner::Guest("g".into()), &checkout_request(&[(palm, 2)]))
        .await
        .unwrap();

    assert_eq!(stock_of(&sf.pool, palm).await, (3, StockStatus::InStock));
}

#[tokio::test]
async fn order_reads_back_with_its_lines() {
    let sf = storefront().await;
    let user_id = insert_user(&sf.pool, "reader@bloomspace.test").await;
    let owner = CartOwner::User(user_id);
    let pothos = insert_product(&sf.pool, "TEST-POTHOS", dec!(25), 10).await;
    let ivy = insert_product(&sf.pool, "TEST-IVY", dec!(19.90), 10).await;

    let receipt = OrderAssembler::new(sf.db.clone())
        .create_order(&owner, &checkout_request(&[(pothos, 2), (ivy, 1)]))
        .await
        .unwrap();

    let detail = sf.db.get_order(receipt.order_id).await.unwrap().unwrap();
    assert!(detail.order.is_owned_by(&owner));
    assert!(!detail.order.is_owned_by(&CartOwner::User(user_id + 1)));
    assert_eq!(detail.order.order_number, receipt.order_number);
    assert_eq!(detail.items.len(), 2);

    let lines: Decimal = detail.items.iter().map(|i| i.line_total).sum();
    assert_eq!(lines, dec!(69.90));
    assert_eq!(detail.order.subtotal, lines);
    assert_eq!(
        detail.order.total_amount,
        detail.order.subtotal + detail.order.shipping_amount + detail.order.tax_amount
            - detail.order.discount_amount
    );
    assert_eq!(detail.order.total_amount, receipt.total_amount);

    let (history, total) = sf.db.order_history(user_id, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(history[0].order.id, receipt.order_id);
}

#[tokio::test]
async fn checkout_clears_only_the_buyers_cart() {
    let sf = storefront().await;
    let user_id = insert_user(&sf.pool, "buyer@bloomspace.test").await;
    let buyer = CartOwner::User(user_id);
    let guest = CartOwner::Guest("someone-else".into());
    let cactus = insert_product(&sf.pool, "TEST-CACTUS", dec!(15), 10).await;

    sf.db.add_to_cart(&buyer, &add(cactus, 1)).await.unwrap();
    sf.db.add_to_cart(&guest, &add(cactus, 1)).await.unwrap();

    OrderAssembler::new(sf.db.clone())
        .create_order(&buyer, &checkout_request(&[(cactus, 1)]))
        .await
        .unwrap();

    assert!(sf.db.cart_lines(&buyer).await.unwrap().is_empty());
    assert_eq!(sf.db.cart_lines(&guest).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_checkout_leaves_everything_untouched() {
    let sf = storefront().await;
    let owner = CartOwner::Guest("short-guest".into());
    let orchid = insert_product(&sf.pool, "TEST-ORCHID", dec!(80), 2).await;
    let moss = insert_product(&sf.pool, "TEST-MOSS", dec!(9), 10).await;

    sf.db.add_to_cart(&owner, &add(moss, 1)).await.unwrap();

    let err = OrderAssembler::new(sf.db.clone())
        .create_order(&owner, &checkout_request(&[(moss, 1), (orchid, 3)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckoutError::InsufficientStock { available: 2, requested: 3, .. }
    ));

    assert_eq!(sf.db.cart_lines(&owner).await.unwrap().len(), 1);
    assert_eq!(stock_of(&sf.pool, moss).await, (10, StockStatus::InStock));
    let (orders,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(&sf.pool)
        .await
        .unwrap();
    assert_eq!(orders, 0);
}

#[tokio::test]
async fn coupon_code_matches_ignoring_case_and_is_counted() {
    let sf = storefront().await;
    let user_id = insert_user(&sf.pool, "saver@bloomspace.test").await;
    let owner = CartOwner::User(user_id);
    let rose = insert_product(&sf.pool, "TEST-ROSE", dec!(60), 10).await;

    sqlx::query(
        "INSERT INTO coupons (code, kind, value, minimum_amount) VALUES ('Spring5', 'fixed', 5, 0)",
    )
    .execute(&sf.pool)
    .await
    .unwrap();

    let mut req = checkout_request(&[(rose, 2)]);
    req.coupon_code = Some("SPRING5".into());
    let receipt = OrderAssembler::new(sf.db.clone())
        .create_order(&owner, &req)
        .await
        .unwrap();
    assert_eq!(receipt.discount_amount, dec!(5));

    let (used,): (i32,) = sqlx::query_as("SELECT used_count FROM coupons WHERE code = 'Spring5'")
        .fetch_one(&sf.pool)
        .await
        .unwrap();
    assert_eq!(used, 1);

    let usage: (i64, Option<i64>, Decimal) = sqlx::query_as(
        "SELECT order_id, user_id, discount_amount FROM coupon_usage",
    )
    .fetch_one(&sf.pool)
    .await
    .unwrap();
    assert_eq!(usage, (receipt.order_id, Some(user_id), dec!(5)));
}

#[tokio::test]
async fn coupon_codes_differing_only_in_case_are_rejected() {
    let sf = storefront().await;

    // WELCOME10 is seeded
    let duplicate = sqlx::query(
        "INSERT INTO coupons (code, kind, value) VALUES ('welcome10', 'percentage', 50)",
    )
    .execute(&sf.pool)
    .await;
    assert!(duplicate.is_err());
}

// =============================================================================
// CART
// =============================================================================

#[tokio::test]
async fn concurrent_adds_merge_into_one_line() {
    let sf = storefront().await;
    let owner = CartOwner::Guest("double-click".into());
    let basil = insert_product(&sf.pool, "TEST-BASIL", dec!(8), 10).await;

    let (req_a, req_b) = (add(basil, 1), add(basil, 1));
    let (a, b) = tokio::join!(
        sf.db.add_to_cart(&owner, &req_a),
        sf.db.add_to_cart(&owner, &req_b)
    );
    let mut messages = vec![a.unwrap(), b.unwrap()];
    messages.sort();
    assert_eq!(
        messages,
        vec!["Item added to cart successfully", "Item quantity updated in cart"]
    );

    let lines = sf.db.cart_lines(&owner).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 2);
}

#[tokio::test]
async fn cart_add_beyond_stock_is_rolled_back() {
    let sf = storefront().await;
    let owner = CartOwner::Guest("greedy".into());
    let sage = insert_product(&sf.pool, "TEST-SAGE", dec!(12), 3).await;

    sf.db.add_to_cart(&owner, &add(sage, 2)).await.unwrap();
    let err = sf.db.add_to_cart(&owner, &add(sage, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Checkout(CheckoutError::InsufficientStock { available: 3, requested: 4, .. })
    ));

    let lines = sf.db.cart_lines(&owner).await.unwrap();
    assert_eq!(lines[0].quantity, 2);
}

#[tokio::test]
async fn cart_update_and_remove_touch_only_the_owner() {
    let sf = storefront().await;
    let owner = CartOwner::Guest("owner".into());
    let stranger = CartOwner::Guest("stranger".into());
    let mint = insert_product(&sf.pool, "TEST-MINT", dec!(7.50), 20).await;

    sf.db.add_to_cart(&owner, &add(mint, 1)).await.unwrap();
    sf.db.update_cart_quantity(&owner, mint, 4).await.unwrap();

    let (count, total) = sf.db.cart_summary(&owner).await.unwrap();
    assert_eq!((count, total), (1, dec!(30)));

    assert!(matches!(
        sf.db.remove_from_cart(&stranger, mint).await,
        Err(AppError::NotFound(_))
    ));
    sf.db.remove_from_cart(&owner, mint).await.unwrap();
    assert!(sf.db.cart_lines(&owner).await.unwrap().is_empty());
}

// =============================================================================
// CATALOG
// =============================================================================

#[tokio::test]
async fn product_detail_includes_images_reviews_and_related() {
    let sf = storefront().await;
    let monstera = product_id_by_slug(&sf.pool, "monstera-deliciosa").await;

    let detail = sf.db.get_product_detail(monstera).await.unwrap().unwrap();
    assert!(detail.in_stock);
    assert_eq!(detail.images.len(), 1);
    assert!(detail.images[0].is_primary);
    assert_eq!(detail.categories[0].slug, "indoor-plants");

    // The unapproved one-star review is hidden from both count and average
    assert_eq!(detail.reviews.review_count, 2);
    assert_eq!(detail.reviews.average_rating, dec!(4.5));
    assert_eq!(detail.reviews.recent.len(), 2);
    assert!(detail.reviews.recent.iter().all(|r| r.rating >= 4));

    let related: Vec<&str> = detail
        .related_products
        .iter()
        .map(|p| p.slug.as_str())
        .collect();
    // Featured first
    assert_eq!(related, vec!["snake-plant", "fiddle-leaf-fig"]);
    assert!(detail.related_products[0].primary_image.is_some());

    assert!(sf.db.get_product_detail(i64::MAX).await.unwrap().is_none());
}

#[tokio::test]
async fn listing_carries_primary_image_and_rating() {
    let sf = storefront().await;

    let filter = ProductFilter {
        page: 1,
        per_page: 3,
        sort: ProductSort::Rating,
        descending: true,
        ..Default::default()
    };
    let (items, total) = sf.db.list_products(&filter).await.unwrap();

    assert_eq!(total, 8);
    assert_eq!(items[0].product.slug, "snake-plant");
    assert_eq!(items[0].average_rating, dec!(5.0));
    assert_eq!(items[1].product.slug, "monstera-deliciosa");
    assert_eq!(items[1].review_count, 2);
    assert!(items.iter().all(|i| i.primary_image.is_some()));
}
