// =============================================================================
// DATABASE MODULE
// =============================================================================
// This module handles all PostgreSQL database operations.
//
// LEARNING NOTES:
// - Every query binds its parameters; no SQL is built by concatenating input
// - The checkout runs in one transaction (PgCheckoutTx) and locks the product
//   rows it touches with SELECT ... FOR UPDATE
// - Dropping a sqlx Transaction without commit() rolls it back
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, QueryBuilder, Transaction};

use crate::checkout::{self, CheckoutStore, CheckoutTx, StoreError, StoreResult};
use crate::error::{AppError, AppResult};
use crate::models::{
    AddToCartRequest, CartItemView, CartOwner, Category, CategoryRef, Coupon, NewOrder,
    OrderDetail, OrderItemRecord, OrderLineDraft, OrderRecord, Product, ProductDetail,
    ProductImage, ProductListItem, RelatedProduct, Review, ReviewSummary,
};
use crate::pricing::SiteSettings;
use crate::session::SessionLookup;

/// Column list shared by every product query.
const PRODUCT_COLUMNS: &str = "p.id, p.name, p.slug, p.sku, p.description, p.price, p.sale_price, \
     p.stock_quantity, p.stock_status, p.is_active, p.is_featured, p.created_at, p.updated_at";

/// Primary image of `p`, joined with LEFT JOIN LATERAL ... ON TRUE.
const PRIMARY_IMAGE: &str = "(SELECT pi.image_url, pi.alt_text FROM product_images pi \
     WHERE pi.product_id = p.id AND pi.is_primary = TRUE ORDER BY pi.sort_order, pi.id LIMIT 1) img";

/// Approved-review rating of `p`; always exactly one row.
const RATING: &str = "(SELECT ROUND(AVG(r.rating), 1) AS average_rating, COUNT(*) AS review_count \
     FROM reviews r WHERE r.product_id = p.id AND r.is_approved = TRUE) rv";

const ORDER_COLUMNS: &str = "id, order_number, user_id, guest_session_id, payment_method, \
     payment_details, subtotal, tax_amount, shipping_amount, discount_amount, total_amount, \
     shipping_address, billing_address, notes, status, payment_status, created_at, updated_at";

const ORDER_ITEM_COLUMNS: &str =
    "id, order_id, product_id, product_name, product_sku, quantity, unit_price, line_total";

// -----------------------------------------------------------------------------
// QUERY PARAMETERS
// -----------------------------------------------------------------------------

/// Whitelisted sort columns for the product listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProductSort {
    Name,
    Price,
    Rating,
    #[default]
    CreatedAt,
}

impl ProductSort {
    /// Unknown values fall back to newest first.
    pub fn parse(value: &str) -> Self {
        match value {
            "name" => ProductSort::Name,
            "price" => ProductSort::Price,
            "rating" => ProductSort::Rating,
            _ => ProductSort::CreatedAt,
        }
    }

    fn column(self) -> &'static str {
        match self {
            ProductSort::Name => "p.name",
            ProductSort::Price => "p.price",
            ProductSort::Rating => "COALESCE(rv.average_rating, 0)",
            ProductSort::CreatedAt => "p.created_at",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub page: i64,
    pub per_page: i64,
    pub category: Option<String>,
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub featured: Option<bool>,
    pub sort: ProductSort,
    pub descending: bool,
}

impl ProductFilter {
    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" WHERE p.is_active = TRUE");

        if let Some(slug) = &self.category {
            qb.push(
                " AND EXISTS (SELECT 1 FROM product_categories pc \
                 JOIN categories c ON c.id = pc.category_id \
                 WHERE pc.product_id = p.id AND c.slug = ",
            )
            .push_bind(slug.clone())
            .push(")");
        }
        if let Some(search) = &self.search {
            let pattern = format!("%{}%", search);
            qb.push(" AND (p.name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR p.description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(min) = self.min_price {
            qb.push(" AND p.price >= ").push_bind(min);
        }
        if let Some(max) = self.max_price {
            qb.push(" AND p.price <= ").push_bind(max);
        }
        if let Some(featured) = self.featured {
            qb.push(" AND p.is_featured = ").push_bind(featured);
        }
    }
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            // Checkout waits on row locks; don't let a request wait forever
            // for a connection on top of that
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create types, tables and indexes if they don't exist, then seed the
    /// catalog when it is empty. Safe to run on every start.
    pub async fn run_migrations(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Migration failed: {}", first_line(statement)))?;
        }

        self.seed_sample_data().await?;

        Ok(())
    }

    async fn seed_sample_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let categories = [
            ("Indoor Plants", "indoor-plants", "Easy-going greenery for every room", 1),
            ("Outdoor Plants", "outdoor-plants", "Hardy plants for balconies and gardens", 2),
            ("Succulents", "succulents", "Low water, high charm", 3),
            ("Care Tools", "care-tools", "Pots, soil and tools", 4),
            ("Plant Gifts", "plant-gifts", "Ready-to-gift plant bundles", 5),
        ];
        for (name, slug, description, sort_order) in categories {
            sqlx::query(
                r#"
                INSERT INTO categories (name, slug, description, sort_order)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (slug) DO NOTHING
                "#,
            )
            .bind(name)
            .bind(slug)
            .bind(description)
            .bind(sort_order)
            .execute(&mut *tx)
            .await?;
        }

        // (name, slug, sku, list price, sale price, stock, featured, category)
        let products: [(&str, &str, &str, i64, Option<i64>, i32, bool, &str); 8] = [
            ("Monstera Deliciosa", "monstera-deliciosa", "BS-IND-001", 12900, Some(9900), 25, true, "indoor-plants"),
            ("Snake Plant", "snake-plant", "BS-IND-002", 5500, None, 40, true, "indoor-plants"),
            ("Fiddle Leaf Fig", "fiddle-leaf-fig", "BS-IND-003", 18900, None, 8, false, "indoor-plants"),
            ("Bougainvillea", "bougainvillea", "BS-OUT-001", 7500, None, 30, false, "outdoor-plants"),
            ("Echeveria Trio", "echeveria-trio", "BS-SUC-001", 3900, Some(3500), 60, true, "succulents"),
            ("Terracotta Pot 20cm", "terracotta-pot-20cm", "BS-TOOL-001", 2500, None, 100, false, "care-tools"),
            ("Premium Potting Mix 5L", "premium-potting-mix-5l", "BS-TOOL-002", 1990, None, 80, false, "care-tools"),
            ("Desk Buddy Gift Box", "desk-buddy-gift-box", "BS-GIFT-001", 8900, None, 15, true, "plant-gifts"),
        ];
        for (name, slug, sku, price, sale, stock, featured, category) in products {
            let (product_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO products (name, slug, sku, price, sale_price, stock_quantity, is_featured)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(slug)
            .bind(sku)
            .bind(Decimal::new(price, 2))
            .bind(sale.map(|s| Decimal::new(s, 2)))
            .bind(stock)
            .bind(featured)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO product_categories (product_id, category_id)
                SELECT $1, id FROM categories WHERE slug = $2
                "#,
            )
            .bind(product_id)
            .bind(category)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO product_images (product_id, image_url, alt_text, sort_order, is_primary)
            SELECT id, '/images/products/' || slug || '.jpg', name, 0, TRUE FROM products
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let (reviewer_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO users (email, first_name, last_name)
            VALUES ('demo@bloomspace.test', 'Demo', 'Shopper')
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        // (product slug, rating, title, approved)
        let reviews: [(&str, i16, &str, bool); 4] = [
            ("monstera-deliciosa", 5, "Huge new leaves within a month", true),
            ("monstera-deliciosa", 4, "Arrived well packed", true),
            ("monstera-deliciosa", 1, "Awaiting moderation", false),
            ("snake-plant", 5, "Impossible to kill", true),
        ];
        for (slug, rating, title, approved) in reviews {
            sqlx::query(
                r#"
                INSERT INTO reviews (product_id, user_id, rating, title, is_verified_purchase, is_approved)
                SELECT id, $2, $3, $4, TRUE, $5 FROM products WHERE slug = $1
                "#,
            )
            .bind(slug)
            .bind(reviewer_id)
            .bind(rating)
            .bind(title)
            .bind(approved)
            .execute(&mut *tx)
            .await?;
        }

        for (key, value) in [
            ("free_shipping_threshold", "150"),
            ("tax_rate", "6"),
            ("shipping_flat_fee", "15"),
        ] {
            sqlx::query(
                r#"
                INSERT INTO site_settings (setting_key, setting_value)
                VALUES ($1, $2)
                ON CONFLICT (setting_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO coupons (code, kind, value, minimum_amount, maximum_discount)
            VALUES ('WELCOME10', 'percentage', 10, 100, 20),
                   ('GREEN15', 'fixed', 15, 80, NULL)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!("Seeded sample catalog");

        Ok(())
    }

    // -------------------------------------------------------------------------
    // CATALOG READS
    // -------------------------------------------------------------------------

    /// Active products matching `filter`, plus the total match count.
    pub async fn list_products(&self, filter: &ProductFilter) -> Result<(Vec<ProductListItem>, i64)> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM products p");
        filter.push_where(&mut count_qb);
        let total = count_qb
            .build_query_as::<(i64,)>()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count products")?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {}, img.image_url AS primary_image, img.alt_text AS image_alt, \
             COALESCE(rv.average_rating, 0) AS average_rating, rv.review_count \
             FROM products p \
             LEFT JOIN LATERAL {} ON TRUE \
             LEFT JOIN LATERAL {} ON TRUE",
            PRODUCT_COLUMNS, PRIMARY_IMAGE, RATING
        ));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY ")
            .push(filter.sort.column())
            .push(if filter.descending { " DESC" } else { " ASC" })
            .push(", p.id ASC LIMIT ")
            .push_bind(filter.per_page)
            .push(" OFFSET ")
            .push_bind((filter.page - 1) * filter.per_page);

        let items = qb
            .build_query_as::<ProductListItem>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch products")?;

        Ok((items, total.0))
    }

    /// One active product by id.
    pub async fn get_product(&self, product_id: i64) -> Result<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products p WHERE p.id = $1 AND p.is_active = TRUE",
            PRODUCT_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch product")?;

        Ok(product)
    }

    /// The product page: product, images, categories, approved reviews and
    /// up to four related products from the same categories.
    pub async fn get_product_detail(&self, product_id: i64) -> Result<Option<ProductDetail>> {
        let Some(product) = self.get_product(product_id).await? else {
            return Ok(None);
        };

        let images = sqlx::query_as::<_, ProductImage>(
            r#"
            SELECT image_url, alt_text, sort_order, is_primary
            FROM product_images
            WHERE product_id = $1
            ORDER BY is_primary DESC, sort_order, id
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch product images")?;

        let categories = sqlx::query_as::<_, CategoryRef>(
            r#"
            SELECT c.id, c.name, c.slug
            FROM categories c
            JOIN product_categories pc ON pc.category_id = c.id
            WHERE pc.product_id = $1 AND c.is_active = TRUE
            ORDER BY c.name
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch product categories")?;

        let (average_rating, review_count): (Decimal, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(ROUND(AVG(rating), 1), 0), COUNT(*)
            FROM reviews
            WHERE product_id = $1 AND is_approved = TRUE
            "#,
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch product rating")?;

        let recent = sqlx::query_as::<_, Review>(
            r#"
            SELECT r.id, r.rating, r.title, r.comment, r.is_verified_purchase, r.helpful_count,
                   r.created_at, u.first_name || ' ' || u.last_name AS author_name
            FROM reviews r
            JOIN users u ON u.id = r.user_id
            WHERE r.product_id = $1 AND r.is_approved = TRUE
            ORDER BY r.created_at DESC, r.id DESC
            LIMIT 10
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch reviews")?;

        let related = sqlx::query_as::<_, RelatedProduct>(&format!(
            r#"
            SELECT p.id, p.name, p.slug, p.price, p.sale_price,
                   img.image_url AS primary_image, img.alt_text AS image_alt
            FROM products p
            LEFT JOIN LATERAL {} ON TRUE
            WHERE p.is_active = TRUE
              AND p.id <> $1
              AND EXISTS (
                  SELECT 1 FROM product_categories pc
                  JOIN product_categories mine ON mine.category_id = pc.category_id
                  JOIN categories c ON c.id = mine.category_id AND c.is_active = TRUE
                  WHERE pc.product_id = p.id AND mine.product_id = $1
              )
            ORDER BY p.is_featured DESC, p.created_at DESC, p.id
            LIMIT 4
            "#,
            PRIMARY_IMAGE
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch related products")?;

        Ok(Some(ProductDetail {
            in_stock: product.is_in_stock(),
            product,
            images,
            categories,
            reviews: ReviewSummary {
                average_rating,
                review_count,
                recent,
            },
            related_products: related,
        }))
    }

    /// Active categories with their active-product counts.
    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>(
            r#"
            SELECT c.id, c.name, c.slug, c.description, c.parent_id, c.sort_order, c.is_active,
                   COUNT(p.id) AS product_count
            FROM categories c
            LEFT JOIN product_categories pc ON pc.category_id = c.id
            LEFT JOIN products p ON p.id = pc.product_id AND p.is_active = TRUE
            WHERE c.is_active = TRUE
            GROUP BY c.id
            ORDER BY c.sort_order, c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch categories")?;

        Ok(categories)
    }

    pub async fn site_settings(&self) -> Result<SiteSettings> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT setting_key, setting_value FROM site_settings")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch site settings")?;

        Ok(SiteSettings::from_pairs(rows))
    }

    // -------------------------------------------------------------------------
    // CART
    // -------------------------------------------------------------------------
    // Owner matching uses IS NOT DISTINCT FROM on both columns: a user's rows
    // have a NULL session_id and vice versa (cart_single_owner constraint).

    pub async fn cart_lines(&self, owner: &CartOwner) -> Result<Vec<CartItemView>> {
        let items = sqlx::query_as::<_, CartItemView>(
            r#"
            SELECT c.id, c.product_id, p.name, p.slug, p.sku, c.quantity, c.price,
                   p.stock_quantity, p.stock_status
            FROM cart c
            JOIN products p ON p.id = c.product_id
            WHERE c.user_id IS NOT DISTINCT FROM $1
              AND c.session_id IS NOT DISTINCT FROM $2
            ORDER BY c.created_at, c.id
            "#,
        )
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch cart")?;

        Ok(items)
    }

    /// Number of lines and captured-price total of the owner's cart.
    pub async fn cart_summary(&self, owner: &CartOwner) -> Result<(i64, Decimal)> {
        let summary: (i64, Decimal) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(quantity * price), 0)
            FROM cart
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .fetch_one(&self.pool)
        .await
        .context("Failed to summarise cart")?;

        Ok(summary)
    }

    /// Add a product to the cart, merging with an existing line.
    ///
    /// Stock is checked against the merged quantity, and the line's captured
    /// price is refreshed to the current catalog price.
    pub async fn add_to_cart(&self, owner: &CartOwner, req: &AddToCartRequest) -> AppResult<&'static str> {
        let mut tx = self.pool.begin().await?;

        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products p WHERE p.id = $1 AND p.is_active = TRUE FOR SHARE",
            PRODUCT_COLUMNS
        ))
        .bind(req.product_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", req.product_id)))?;

        ensure_purchasable(&product, req.quantity)?;

        // Two concurrent adds of the same product meet on the unique index:
        // the second one waits, then merges into the first one's row
        let (merged, inserted): (i32, bool) = sqlx::query_as(&format!(
            r#"
            INSERT INTO cart (user_id, session_id, product_id, quantity, price)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT {}
            DO UPDATE SET quantity = cart.quantity + EXCLUDED.quantity,
                          price = EXCLUDED.price,
                          updated_at = NOW()
            RETURNING quantity, (xmax = 0) AS inserted
            "#,
            cart_conflict_target(owner)
        ))
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .bind(req.product_id)
        .bind(req.quantity)
        .bind(product.effective_price())
        .fetch_one(&mut *tx)
        .await?;

        // Rolls back on error when tx is dropped
        ensure_purchasable(&product, merged)?;

        tx.commit().await?;
        Ok(if inserted {
            "Item added to cart successfully"
        } else {
            "Item quantity updated in cart"
        })
    }

    /// Set a cart line's quantity outright.
    pub async fn update_cart_quantity(
        &self,
        owner: &CartOwner,
        product_id: i64,
        quantity: i32,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products p WHERE p.id = $1 AND p.is_active = TRUE FOR SHARE",
            PRODUCT_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", product_id)))?;

        ensure_purchasable(&product, quantity)?;

        let result = sqlx::query(
            r#"
            UPDATE cart SET quantity = $1, price = $2, updated_at = NOW()
            WHERE user_id IS NOT DISTINCT FROM $3
              AND session_id IS NOT DISTINCT FROM $4
              AND product_id = $5
            "#,
        )
        .bind(quantity)
        .bind(product.effective_price())
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .bind(product_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Product {} is not in the cart",
                product_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_from_cart(&self, owner: &CartOwner, product_id: i64) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM cart
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_id IS NOT DISTINCT FROM $2
              AND product_id = $3
            "#,
        )
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Product {} is not in the cart",
                product_id
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ORDER READS
    // -------------------------------------------------------------------------

    pub async fn get_order(&self, order_id: i64) -> Result<Option<OrderDetail>> {
        let order = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch order")?;

        let Some(order) = order else {
            return Ok(None);
        };

        let items = self.order_items(order.id).await?;
        Ok(Some(OrderDetail { order, items }))
    }

    /// A user's orders, newest first, plus their total count.
    pub async fn order_history(
        &self,
        user_id: i64,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<OrderDetail>, i64)> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count orders")?;

        let orders = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .bind(per_page)
        .bind((page - 1) * per_page)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders")?;

        let mut details = Vec::with_capacity(orders.len());
        for order in orders {
            let items = self.order_items(order.id).await?;
            details.push(OrderDetail { order, items });
        }

        Ok((details, total.0))
    }

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItemRecord>> {
        let items = sqlx::query_as::<_, OrderItemRecord>(&format!(
            "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY id",
            ORDER_ITEM_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch order items")?;

        Ok(items)
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

/// Cart-side stock check. Uses the checkout's rules so that adding to the
/// cart and checking out report the same error for the same product.
fn ensure_purchasable(product: &Product, quantity: i32) -> AppResult<()> {
    if quantity <= 0 {
        return Err(AppError::BadRequest("Quantity must be at least 1".to_string()));
    }
    checkout::check_stock(product, quantity)?;
    Ok(())
}

/// ON CONFLICT target matching the owner's partial unique index.
fn cart_conflict_target(owner: &CartOwner) -> &'static str {
    match owner {
        CartOwner::User(_) => "(user_id, product_id) WHERE user_id IS NOT NULL",
        CartOwner::Guest(_) => "(session_id, product_id) WHERE session_id IS NOT NULL",
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

// =============================================================================
// SESSIONS
// =============================================================================
#[async_trait]
impl SessionLookup for Database {
    async fn user_for_token(&self, token: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT s.user_id
            FROM user_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = $1 AND s.expires_at > NOW() AND u.is_active = TRUE
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn delete_expired_sessions(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// CHECKOUT TRANSACTION
// =============================================================================

/// One open checkout transaction on Postgres.
pub struct PgCheckoutTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CheckoutStore for Database {
    type Tx = PgCheckoutTx;

    async fn begin(&self) -> StoreResult<PgCheckoutTx> {
        let tx = self.pool.begin().await?;
        Ok(PgCheckoutTx { tx })
    }
}

#[async_trait]
impl CheckoutTx for PgCheckoutTx {
    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>> {
        // FOR UPDATE: a concurrent checkout of the same product waits here
        // until this transaction commits, then sees the decremented stock
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products p WHERE p.id = $1 FOR UPDATE",
            PRODUCT_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(product)
    }

    async fn site_settings(&mut self) -> StoreResult<SiteSettings> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT setting_key, setting_value FROM site_settings")
                .fetch_all(&mut *self.tx)
                .await?;

        Ok(SiteSettings::from_pairs(rows))
    }

    async fn find_coupon(&mut self, code: &str) -> StoreResult<Option<Coupon>> {
        let coupon = sqlx::query_as::<_, Coupon>(
            r#"
            SELECT id, code, kind, value, minimum_amount, maximum_discount,
                   is_active, valid_until, used_count
            FROM coupons
            WHERE upper(code) = upper($1)
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(coupon)
    }

    async fn order_number_exists(&mut self, order_number: &str) -> StoreResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM orders WHERE order_number = $1)")
                .bind(order_number)
                .fetch_one(&mut *self.tx)
                .await?;

        Ok(exists)
    }

    async fn insert_order(&mut self, order: &NewOrder) -> StoreResult<(i64, DateTime<Utc>)> {
        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO orders (
                order_number, user_id, guest_session_id, payment_method, payment_details,
                subtotal, tax_amount, shipping_amount, discount_amount, total_amount,
                shipping_address, billing_address, notes, status, payment_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id, created_at
            "#,
        )
        .bind(&order.order_number)
        .bind(order.user_id)
        .bind(&order.guest_session_id)
        .bind(&order.payment_method)
        .bind(order.payment_details.clone().map(Json))
        .bind(order.subtotal)
        .bind(order.tax_amount)
        .bind(order.shipping_amount)
        .bind(order.discount_amount)
        .bind(order.total_amount)
        .bind(Json(order.shipping_address.clone()))
        .bind(Json(order.billing_address.clone()))
        .bind(&order.notes)
        .bind(order.status)
        .bind(order.payment_status)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row)
    }

    async fn insert_order_line(
        &mut self,
        order_id: i64,
        line: &OrderLineDraft,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_items (
                order_id, product_id, product_name, product_sku, quantity, unit_price, line_total
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order_id)
        .bind(line.product_id)
        .bind(&line.product_name)
        .bind(&line.product_sku)
        .bind(line.quantity)
        .bind(line.unit_price)
        .bind(line.line_total)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<()> {
        // The CHECK (stock_quantity >= 0) constraint is the last line of
        // defence; the row lock taken in lock_product is the first
        let result = sqlx::query(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $1,
                stock_status = CASE
                    WHEN stock_quantity - $1 <= 0 THEN 'outofstock'::stock_status
                    ELSE stock_status
                END,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(quantity)
        .bind(product_id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Unavailable(format!(
                "product {} vanished during checkout",
                product_id
            )));
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
        sqlx::query(
            r#"
            INSERT INTO coupon_usage (coupon_id, user_id, order_id, discount_amount)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(coupon_id)
        .bind(user_id)
        .bind(order_id)
        .bind(discount)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query("UPDATE coupons SET used_count = used_count + 1 WHERE id = $1")
            .bind(coupon_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn clear_cart(&mut self, owner: &CartOwner) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM cart
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(owner.user_id())
        .bind(owner.guest_key())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// SCHEMA
// =============================================================================
// One statement per entry: Postgres prepared statements can't hold several.
const SCHEMA: &[&str] = &[
    r#"
    DO $$ BEGIN
        CREATE TYPE stock_status AS ENUM ('instock', 'outofstock');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$
    "#,
    r#"
    DO $$ BEGIN
        CREATE TYPE discount_kind AS ENUM ('fixed', 'percentage');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$
    "#,
    r#"
    DO $$ BEGIN
        CREATE TYPE order_status AS ENUM ('pending', 'processing', 'shipped', 'delivered', 'cancelled');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$
    "#,
    r#"
    DO $$ BEGIN
        CREATE TYPE payment_status AS ENUM ('unpaid', 'paid', 'failed');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email VARCHAR(191) UNIQUE NOT NULL,
        first_name VARCHAR(100) NOT NULL,
        last_name VARCHAR(100) NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_sessions (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token VARCHAR(191) UNIQUE NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(100) NOT NULL,
        slug VARCHAR(100) UNIQUE NOT NULL,
        description TEXT,
        parent_id BIGINT REFERENCES categories(id) ON DELETE SET NULL,
        sort_order INTEGER NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        slug VARCHAR(255) UNIQUE NOT NULL,
        sku VARCHAR(50) UNIQUE NOT NULL,
        description TEXT,
        price NUMERIC(10, 2) NOT NULL,
        sale_price NUMERIC(10, 2),
        stock_quantity INTEGER NOT NULL DEFAULT 0,
        stock_status stock_status NOT NULL DEFAULT 'instock',
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_featured BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT non_negative_stock CHECK (stock_quantity >= 0),
        CONSTRAINT non_negative_price CHECK (price >= 0 AND (sale_price IS NULL OR sale_price >= 0))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_categories (
        product_id BIGINT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        category_id BIGINT NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
        PRIMARY KEY (product_id, category_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_images (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        image_url VARCHAR(500) NOT NULL,
        alt_text VARCHAR(255),
        sort_order INTEGER NOT NULL DEFAULT 0,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reviews (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        rating SMALLINT NOT NULL CHECK (rating BETWEEN 1 AND 5),
        title VARCHAR(255),
        comment TEXT,
        is_verified_purchase BOOLEAN NOT NULL DEFAULT FALSE,
        is_approved BOOLEAN NOT NULL DEFAULT FALSE,
        helpful_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS site_settings (
        setting_key VARCHAR(100) PRIMARY KEY,
        setting_value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coupons (
        id BIGSERIAL PRIMARY KEY,
        code VARCHAR(50) UNIQUE NOT NULL,
        kind discount_kind NOT NULL,
        value NUMERIC(10, 2) NOT NULL,
        minimum_amount NUMERIC(10, 2) NOT NULL DEFAULT 0,
        maximum_discount NUMERIC(10, 2),
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        valid_until TIMESTAMPTZ,
        used_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id BIGSERIAL PRIMARY KEY,
        order_number VARCHAR(32) UNIQUE NOT NULL,
        user_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
        guest_session_id VARCHAR(191),
        payment_method VARCHAR(50) NOT NULL,
        payment_details JSONB,
        subtotal NUMERIC(10, 2) NOT NULL,
        tax_amount NUMERIC(10, 2) NOT NULL,
        shipping_amount NUMERIC(10, 2) NOT NULL,
        discount_amount NUMERIC(10, 2) NOT NULL DEFAULT 0,
        total_amount NUMERIC(10, 2) NOT NULL,
        shipping_address JSONB NOT NULL,
        billing_address JSONB NOT NULL,
        notes TEXT,
        status order_status NOT NULL DEFAULT 'pending',
        payment_status payment_status NOT NULL DEFAULT 'unpaid',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_items (
        id BIGSERIAL PRIMARY KEY,
        order_id BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
        product_id BIGINT NOT NULL REFERENCES products(id),
        product_name VARCHAR(255) NOT NULL,
        product_sku VARCHAR(50) NOT NULL,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price NUMERIC(10, 2) NOT NULL,
        line_total NUMERIC(10, 2) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coupon_usage (
        id BIGSERIAL PRIMARY KEY,
        coupon_id BIGINT NOT NULL REFERENCES coupons(id),
        user_id BIGINT REFERENCES users(id) ON DELETE SET NULL,
        order_id BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
        discount_amount NUMERIC(10, 2) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cart (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT REFERENCES users(id) ON DELETE CASCADE,
        session_id VARCHAR(191),
        product_id BIGINT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        price NUMERIC(10, 2) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT cart_single_owner CHECK ((user_id IS NULL) <> (session_id IS NULL))
    )
    "#,
    // One line per product per owner; add_to_cart's ON CONFLICT relies on these
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_cart_user_product ON cart(user_id, product_id) WHERE user_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_cart_session_product ON cart(session_id, product_id) WHERE session_id IS NOT NULL",
    // Coupon codes are matched case-insensitively
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_coupons_code_upper ON coupons(upper(code))",
    "CREATE INDEX IF NOT EXISTS idx_product_images_product ON product_images(product_id, sort_order)",
    "CREATE INDEX IF NOT EXISTS idx_reviews_product ON reviews(product_id, created_at DESC) WHERE is_approved = TRUE",
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id)",
    "CREATE INDEX IF NOT EXISTS idx_user_sessions_expiry ON user_sessions(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_products_active ON products(is_active, created_at DESC)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::CheckoutError;
    use crate::models::StockStatus;
    use crate::testing::product;
    use rust_decimal_macros::dec;

    #[test]
    fn unknown_sort_falls_back_to_newest() {
        assert_eq!(ProductSort::parse("price"), ProductSort::Price);
        assert_eq!(ProductSort::parse("rating"), ProductSort::Rating);
        assert_eq!(ProductSort::parse("rating; DROP TABLE products"), ProductSort::CreatedAt);
    }

    #[test]
    fn filter_builds_bound_where_clause() {
        let filter = ProductFilter {
            page: 1,
            per_page: 12,
            category: Some("succulents".into()),
            search: Some("pot".into()),
            min_price: Some(dec!(10)),
            max_price: None,
            featured: Some(true),
            sort: ProductSort::Price,
            descending: false,
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM products p");
        filter.push_where(&mut qb);
        let sql = qb.sql();

        assert!(sql.contains("p.is_active = TRUE"));
        assert!(sql.contains("c.slug = $1"));
        assert!(sql.contains("p.name ILIKE $2"));
        assert!(sql.contains("p.price >= $4"));
        assert!(sql.contains("p.is_featured = $5"));
        assert!(!sql.contains("succulents"));
    }

    #[test]
    fn cart_rejects_more_than_stock() {
        let p = product(1, "Snake Plant", dec!(55), 3);
        assert!(ensure_purchasable(&p, 3).is_ok());
        assert!(matches!(
            ensure_purchasable(&p, 4),
            Err(AppError::Checkout(CheckoutError::InsufficientStock {
                available: 3,
                requested: 4,
                ..
            }))
        ));
        assert!(matches!(ensure_purchasable(&p, 0), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn cart_rejects_out_of_stock_products() {
        let mut p = product(1, "Snake Plant", dec!(55), 3);
        p.stock_status = StockStatus::OutOfStock;
        assert!(matches!(
            ensure_purchasable(&p, 1),
            Err(AppError::Checkout(CheckoutError::OutOfStock { .. }))
        ));
    }

    #[test]
    fn cart_and_checkout_agree_on_disabled_products() {
        // Disabled by hand with a little stock left: the status wins, so the
        // shopper isn't told to lower the quantity
        let mut p = product(4, "Fig", dec!(189), 2);
        p.stock_status = StockStatus::OutOfStock;

        let cart = ensure_purchasable(&p, 3).unwrap_err();
        let checkout = checkout::check_stock(&p, 3).unwrap_err();
        assert!(matches!(cart, AppError::Checkout(CheckoutError::OutOfStock { product_id: 4, .. })));
        assert!(matches!(checkout, CheckoutError::OutOfStock { product_id: 4, .. }));
    }

    #[test]
    fn cart_reports_sold_out_as_zero_available() {
        let p = product(5, "Echeveria Trio", dec!(35), 0);
        assert!(matches!(
            ensure_purchasable(&p, 1),
            Err(AppError::Checkout(CheckoutError::InsufficientStock { available: 0, .. }))
        ));
    }

    #[test]
    fn cart_conflict_target_matches_owner_index() {
        for owner in [CartOwner::User(1), CartOwner::Guest("g".into())] {
            let (columns, predicate) = cart_conflict_target(&owner).split_once(" WHERE ").unwrap();
            let index = format!("ON cart{} WHERE {}", columns, predicate);
            assert!(
                SCHEMA
                    .iter()
                    .any(|s| s.starts_with("CREATE UNIQUE INDEX") && s.contains(&index)),
                "no unique index for {index}"
            );
        }
    }

    #[test]
    fn coupon_codes_are_unique_ignoring_case() {
        assert!(SCHEMA
            .iter()
            .any(|s| s.contains("UNIQUE INDEX") && s.contains("coupons(upper(code))")));
    }

    #[test]
    fn listing_sorts_by_rating_column() {
        let filter = ProductFilter {
            page: 1,
            per_page: 12,
            sort: ProductSort::Rating,
            descending: true,
            ..Default::default()
        };
        assert_eq!(filter.sort.column(), "COALESCE(rv.average_rating, 0)");
        assert!(RATING.ends_with(" rv"));
        assert!(RATING.contains("r.is_approved = TRUE"));
    }

    #[test]
    fn schema_has_the_stock_guard() {
        assert!(SCHEMA
            .iter()
            .any(|s| s.contains("CHECK (stock_quantity >= 0)")));
        assert!(SCHEMA.iter().any(|s| s.contains("cart_single_owner")));
    }
}
