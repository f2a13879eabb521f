// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL implementation of the Store contract.
//
// LEARNING NOTES:
// - Status transitions lock the order row (SELECT ... FOR UPDATE) and apply
//   their ledger/coupon side effects inside the same transaction
// - Conditional UPDATEs (`WHERE stock >= $2`) guard the non-negative stock and
//   the coupon usage limit without any application-level lock
// - Order/address rows are mapped with #[sqlx(flatten)] for the shipping block
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AddressInput, ConfirmOutcome, Coupon, CouponUpdate, InventoryUpdate, Order, OrderFilter,
    OrderStatus, Product, RefundRecord, SavedAddress, Subscriber, WaitlistEntry,
};
use crate::store::Store;

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
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
    /// Create enum types, tables and indexes. Every statement is idempotent,
    /// so this runs on every startup.
    pub async fn run_migrations(&self) -> Result<()> {
        for &(name, statement) in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply migration step '{}'", name))?;
        }
        Ok(())
    }
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "order_status enum",
        r#"
        DO $$ BEGIN
            CREATE TYPE order_status AS ENUM ('pending', 'paid', 'cancelled', 'refunded');
        EXCEPTION WHEN duplicate_object THEN NULL;
        END $$
        "#,
    ),
    (
        "discount_type enum",
        r#"
        DO $$ BEGIN
            CREATE TYPE discount_type AS ENUM ('percentage', 'fixed');
        EXCEPTION WHEN duplicate_object THEN NULL;
        END $$
        "#,
    ),
    (
        "products table",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id VARCHAR(100) PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            description TEXT,
            sku VARCHAR(50) NOT NULL,
            price BIGINT NOT NULL,
            currency VARCHAR(3) NOT NULL DEFAULT 'usd',
            stock INTEGER NOT NULL DEFAULT 0,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            -- The ledger never goes negative
            CONSTRAINT non_negative_stock CHECK (stock >= 0),
            CONSTRAINT non_negative_price CHECK (price >= 0)
        )
        "#,
    ),
    (
        "orders table",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id UUID PRIMARY KEY,
            buyer_id VARCHAR(255) NOT NULL,
            product_id VARCHAR(100) NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL DEFAULT 1,
            amount BIGINT NOT NULL,
            currency VARCHAR(3) NOT NULL,
            status order_status NOT NULL DEFAULT 'pending',
            payment_session_id VARCHAR(255),
            coupon_code VARCHAR(50),
            discount_amount BIGINT,
            amount_paid BIGINT,
            reserved_at TIMESTAMPTZ,

            shipping_name VARCHAR(255) NOT NULL,
            shipping_phone VARCHAR(50) NOT NULL,
            shipping_email VARCHAR(255) NOT NULL,
            shipping_address TEXT NOT NULL,
            shipping_city VARCHAR(100) NOT NULL,
            shipping_state VARCHAR(100) NOT NULL,
            shipping_zip VARCHAR(20) NOT NULL,
            shipping_country VARCHAR(100) NOT NULL,

            tracking_number VARCHAR(100),
            tracking_status VARCHAR(50),
            confirmation_email_sent BOOLEAN NOT NULL DEFAULT FALSE,
            shipping_email_sent BOOLEAN NOT NULL DEFAULT FALSE,
            cancellation_reason TEXT,
            refund_id VARCHAR(255),
            refund_amount BIGINT,
            refunded_at TIMESTAMPTZ,

            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT positive_quantity CHECK (quantity > 0),
            CONSTRAINT non_negative_amount CHECK (amount >= 0),
            CONSTRAINT discount_within_amount
                CHECK (discount_amount IS NULL OR (discount_amount >= 0 AND discount_amount <= amount)),
            -- Advisory holds only exist on pending orders
            CONSTRAINT reservation_while_pending
                CHECK (reserved_at IS NULL OR status = 'pending')
        )
        "#,
    ),
    (
        "orders buyer index",
        "CREATE INDEX IF NOT EXISTS idx_orders_buyer ON orders(buyer_id, created_at DESC)",
    ),
    (
        "orders session index",
        "CREATE INDEX IF NOT EXISTS idx_orders_session ON orders(payment_session_id)",
    ),
    (
        "orders reservation index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_orders_pending_reserved
            ON orders(reserved_at) WHERE status = 'pending'
        "#,
    ),
    (
        "orders stock_decremented column",
        "ALTER TABLE orders ADD COLUMN IF NOT EXISTS stock_decremented BOOLEAN NOT NULL DEFAULT FALSE",
    ),
    (
        "coupons table",
        r#"
        CREATE TABLE IF NOT EXISTS coupons (
            id UUID PRIMARY KEY,
            code VARCHAR(50) UNIQUE NOT NULL,
            description TEXT,
            discount_type discount_type NOT NULL,
            discount_value BIGINT NOT NULL,
            min_amount BIGINT,
            max_discount BIGINT,
            usage_limit INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            valid_from TIMESTAMPTZ NOT NULL,
            valid_until TIMESTAMPTZ NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT valid_window CHECK (valid_from <= valid_until)
        )
        "#,
    ),
    (
        "waitlist table",
        r#"
        CREATE TABLE IF NOT EXISTS waitlist (
            id UUID PRIMARY KEY,
            email VARCHAR(255) UNIQUE NOT NULL,
            buyer_id VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "newsletter table",
        r#"
        CREATE TABLE IF NOT EXISTS newsletter_subscribers (
            id UUID PRIMARY KEY,
            email VARCHAR(255) UNIQUE NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            subscribed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            unsubscribed_at TIMESTAMPTZ
        )
        "#,
    ),
    (
        "saved addresses table",
        r#"
        CREATE TABLE IF NOT EXISTS saved_addresses (
            id UUID PRIMARY KEY,
            buyer_id VARCHAR(255) NOT NULL,
            label VARCHAR(100),
            shipping_name VARCHAR(255) NOT NULL,
            shipping_phone VARCHAR(50) NOT NULL,
            shipping_email VARCHAR(255) NOT NULL,
            shipping_address TEXT NOT NULL,
            shipping_city VARCHAR(100) NOT NULL,
            shipping_state VARCHAR(100) NOT NULL,
            shipping_zip VARCHAR(20) NOT NULL,
            shipping_country VARCHAR(100) NOT NULL,
            is_default BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "saved addresses buyer index",
        "CREATE INDEX IF NOT EXISTS idx_saved_addresses_buyer ON saved_addresses(buyer_id)",
    ),
];

fn unique_violation(err: sqlx::Error, message: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Validation(message.to_string())
        }
        _ => AppError::Database(err),
    }
}

#[async_trait]
impl Store for Database {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PRODUCTS / STOCK LEDGER
    // -------------------------------------------------------------------------

    async fn get_product(&self, id: &str) -> AppResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    async fn insert_product(&self, product: &Product) -> AppResult<Product> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, sku, price, currency, stock, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(&product.sku)
        .bind(product.price)
        .bind(&product.currency)
        .bind(product.stock)
        .bind(product.is_active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_product(&product.id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("product {} vanished after insert", product.id)))
    }

    async fn decrement_stock(&self, id: &str, quantity: i32) -> AppResult<Product> {
        let updated = sqlx::query_as::<_, Product>(
            r#"
            UPDATE products
            SET stock = stock - $2, updated_at = NOW()
            WHERE id = $1 AND stock >= $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(product) => Ok(product),
            None => match self.get_product(id).await? {
                Some(product) => Err(AppError::InsufficientStock {
                    available: i64::from(product.stock),
                    requested: i64::from(quantity),
                }),
                None => Err(AppError::NotFound(format!("Product not found: {}", id))),
            },
        }
    }

    async fn increment_stock(&self, id: &str, quantity: i32) -> AppResult<Product> {
        sqlx::query_as::<_, Product>(
            r#"
            UPDATE products
            SET stock = stock + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", id)))
    }

    async fn update_product(&self, id: &str, update: &InventoryUpdate) -> AppResult<Product> {
        sqlx::query_as::<_, Product>(
            r#"
            UPDATE products
            SET stock = COALESCE($2, GREATEST(stock + COALESCE($3, 0), 0)),
                is_active = COALESCE($4, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.stock)
        .bind(update.delta)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", id)))
    }

    async fn count_active_reservations(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let (units,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM orders
            WHERE product_id = $1
              AND status = 'pending'
              AND reserved_at IS NOT NULL
              AND reserved_at > $2
            "#,
        )
        .bind(product_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(units)
    }

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        let s = &order.shipping;
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, buyer_id, product_id, quantity, amount, currency, status,
                payment_session_id, coupon_code, discount_amount, reserved_at,
                shipping_name, shipping_phone, shipping_email, shipping_address,
                shipping_city, shipping_state, shipping_zip, shipping_country,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(order.id)
        .bind(&order.buyer_id)
        .bind(&order.product_id)
        .bind(order.quantity)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(order.status)
        .bind(&order.payment_session_id)
        .bind(&order.coupon_code)
        .bind(order.discount_amount)
        .bind(order.reserved_at)
        .bind(&s.shipping_name)
        .bind(&s.shipping_phone)
        .bind(&s.shipping_email)
        .bind(&s.shipping_address)
        .bind(&s.shipping_city)
        .bind(&s.shipping_state)
        .bind(&s.shipping_zip)
        .bind(&s.shipping_country)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn find_order_by_session(&self, session_id: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE payment_session_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE ($1::TEXT IS NULL OR buyer_id = $1)
              AND ($2::order_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(&filter.buyer_id)
        .bind(filter.status)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn set_payment_session(&self, id: Uuid, session_id: Option<&str>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET payment_session_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_reservation(&self, id: Uuid, at: Option<DateTime<Utc>>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET reserved_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_payment_hold(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET reserved_at = NULL, payment_session_id = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn confirm_payment(
        &self,
        id: Uuid,
        amount_paid: Option<i64>,
    ) -> AppResult<Option<ConfirmOutcome>> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent deliveries of the same event
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let order = match order {
            Some(order) => order,
            None => return Ok(None),
        };

        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Paid => return Ok(Some(ConfirmOutcome::AlreadyPaid(order))),
            OrderStatus::Cancelled | OrderStatus::Refunded => {
                return Ok(Some(ConfirmOutcome::NotPending(order)))
            }
        }

        let stock_decremented = sqlx::query(
            r#"
            UPDATE products
            SET stock = stock - $2, updated_at = NOW()
            WHERE id = $1 AND stock >= $2
            "#,
        )
        .bind(&order.product_id)
        .bind(order.quantity)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        // The row lock on the coupon serializes confirmations sharing a code
        let coupon_redeemed = match &order.coupon_code {
            Some(code) => Some(
                sqlx::query(
                    r#"
                    UPDATE coupons
                    SET usage_count = usage_count + 1, updated_at = NOW()
                    WHERE code = $1
                      AND (usage_limit IS NULL OR usage_count < usage_limit)
                    "#,
                )
                .bind(code)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    > 0,
            ),
            None => None,
        };

        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = 'paid',
                reserved_at = NULL,
                amount_paid = COALESCE($2, amount_paid),
                stock_decremented = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(amount_paid)
        .bind(stock_decremented)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ConfirmOutcome::Confirmed {
            order,
            stock_decremented,
            coupon_redeemed,
        }))
    }

    async fn cancel_pending(&self, id: Uuid, reason: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'cancelled',
                reserved_at = NULL,
                cancellation_reason = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_refund(&self, id: Uuid, refund: &RefundRecord) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = 'refunded',
                cancellation_reason = $2,
                refund_id = $3,
                refund_amount = $4,
                refunded_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'paid'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&refund.reason)
        .bind(&refund.refund_id)
        .bind(refund.amount)
        .bind(refund.refunded_at)
        .fetch_optional(&mut *tx)
        .await?;

        let order = match order {
            Some(order) => order,
            None => return Ok(false),
        };

        // Nothing to return if confirmation could not take the units
        if order.stock_decremented {
            sqlx::query("UPDATE products SET stock = stock + $2, updated_at = NOW() WHERE id = $1")
                .bind(&order.product_id)
                .bind(order.quantity)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_order(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM orders WHERE id = $1 AND status IN ('pending', 'cancelled')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_confirmation_sent(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE orders SET confirmation_email_sent = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tracking(
        &self,
        id: Uuid,
        tracking_number: &str,
        tracking_status: &str,
    ) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET tracking_number = $2, tracking_status = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tracking_number)
        .bind(tracking_status)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn mark_shipping_email_sent(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE orders SET shipping_email_sent = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET reserved_at = NULL, updated_at = NOW()
            WHERE status = 'pending'
              AND reserved_at IS NOT NULL
              AND reserved_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // COUPONS
    // -------------------------------------------------------------------------

    async fn find_coupon(&self, code: &str) -> AppResult<Option<Coupon>> {
        let coupon = sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(coupon)
    }

    async fn get_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        let coupon = sqlx::query_as::<_, Coupon>("SELECT * FROM coupons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(coupon)
    }

    async fn list_coupons(&self) -> AppResult<Vec<Coupon>> {
        let coupons = sqlx::query_as::<_, Coupon>("SELECT * FROM coupons ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(coupons)
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<Coupon> {
        sqlx::query_as::<_, Coupon>(
            r#"
            INSERT INTO coupons (
                id, code, description, discount_type, discount_value, min_amount,
                max_discount, usage_limit, usage_count, valid_from, valid_until,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(coupon.id)
        .bind(&coupon.code)
        .bind(&coupon.description)
        .bind(coupon.discount_type)
        .bind(coupon.discount_value)
        .bind(coupon.min_amount)
        .bind(coupon.max_discount)
        .bind(coupon.usage_limit)
        .bind(coupon.usage_count)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(coupon.is_active)
        .bind(coupon.created_at)
        .bind(coupon.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "Coupon code already exists"))
    }

    async fn update_coupon(&self, id: Uuid, update: &CouponUpdate) -> AppResult<Option<Coupon>> {
        let coupon = sqlx::query_as::<_, Coupon>(
            r#"
            UPDATE coupons
            SET description = COALESCE($2, description),
                discount_type = COALESCE($3, discount_type),
                discount_value = COALESCE($4, discount_value),
                min_amount = COALESCE($5, min_amount),
                max_discount = COALESCE($6, max_discount),
                usage_limit = COALESCE($7, usage_limit),
                usage_count = COALESCE($8, usage_count),
                valid_from = COALESCE($9, valid_from),
                valid_until = COALESCE($10, valid_until),
                is_active = COALESCE($11, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&update.description)
        .bind(update.discount_type)
        .bind(update.discount_value)
        .bind(update.min_amount)
        .bind(update.max_discount)
        .bind(update.usage_limit)
        .bind(update.usage_count)
        .bind(update.valid_from)
        .bind(update.valid_until)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(coupon)
    }

    async fn delete_coupon(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM coupons WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // WAITLIST / NEWSLETTER
    // -------------------------------------------------------------------------

    async fn upsert_waitlist(
        &self,
        email: &str,
        buyer_id: Option<&str>,
    ) -> AppResult<WaitlistEntry> {
        let entry = sqlx::query_as::<_, WaitlistEntry>(
            r#"
            INSERT INTO waitlist (id, email, buyer_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (email)
            DO UPDATE SET buyer_id = COALESCE(EXCLUDED.buyer_id, waitlist.buyer_id)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(buyer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn list_waitlist(&self) -> AppResult<Vec<WaitlistEntry>> {
        let entries =
            sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(entries)
    }

    async fn find_subscriber(&self, email: &str) -> AppResult<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM newsletter_subscribers WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscriber)
    }

    async fn insert_subscriber(&self, email: &str) -> AppResult<Subscriber> {
        sqlx::query_as::<_, Subscriber>(
            r#"
            INSERT INTO newsletter_subscribers (id, email, is_active, subscribed_at)
            VALUES ($1, $2, TRUE, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "Already subscribed"))
    }

    async fn set_subscription(
        &self,
        email: &str,
        active: bool,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            UPDATE newsletter_subscribers
            SET is_active = $2,
                subscribed_at = CASE WHEN $2 THEN $3 ELSE subscribed_at END,
                unsubscribed_at = CASE WHEN $2 THEN NULL ELSE $3 END
            WHERE email = $1
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(active)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscriber)
    }

    async fn list_subscribers(&self, active_only: bool) -> AppResult<Vec<Subscriber>> {
        let subscribers = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT * FROM newsletter_subscribers
            WHERE (NOT $1 OR is_active)
            ORDER BY subscribed_at DESC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscribers)
    }

    // -------------------------------------------------------------------------
    // SAVED ADDRESSES
    // -------------------------------------------------------------------------

    async fn list_addresses(&self, buyer_id: &str) -> AppResult<Vec<SavedAddress>> {
        let addresses = sqlx::query_as::<_, SavedAddress>(
            r#"
            SELECT * FROM saved_addresses
            WHERE buyer_id = $1
            ORDER BY is_default DESC, created_at DESC
            "#,
        )
        .bind(buyer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(addresses)
    }

    async fn insert_address(&self, address: &SavedAddress) -> AppResult<SavedAddress> {
        let mut tx = self.pool.begin().await?;

        if address.is_default {
            sqlx::query("UPDATE saved_addresses SET is_default = FALSE WHERE buyer_id = $1")
                .bind(&address.buyer_id)
                .execute(&mut *tx)
                .await?;
        }

        let c = &address.contact;
        let saved = sqlx::query_as::<_, SavedAddress>(
            r#"
            INSERT INTO saved_addresses (
                id, buyer_id, label, shipping_name, shipping_phone, shipping_email,
                shipping_address, shipping_city, shipping_state, shipping_zip,
                shipping_country, is_default, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(address.id)
        .bind(&address.buyer_id)
        .bind(&address.label)
        .bind(&c.shipping_name)
        .bind(&c.shipping_phone)
        .bind(&c.shipping_email)
        .bind(&c.shipping_address)
        .bind(&c.shipping_city)
        .bind(&c.shipping_state)
        .bind(&c.shipping_zip)
        .bind(&c.shipping_country)
        .bind(address.is_default)
        .bind(address.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(saved)
    }

    async fn update_address(
        &self,
        buyer_id: &str,
        id: Uuid,
        input: &AddressInput,
    ) -> AppResult<Option<SavedAddress>> {
        let mut tx = self.pool.begin().await?;

        if input.is_default {
            sqlx::query(
                "UPDATE saved_addresses SET is_default = FALSE WHERE buyer_id = $1 AND id <> $2",
            )
            .bind(buyer_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let c = &input.contact;
        let saved = sqlx::query_as::<_, SavedAddress>(
            r#"
            UPDATE saved_addresses
            SET label = $3, shipping_name = $4, shipping_phone = $5, shipping_email = $6,
                shipping_address = $7, shipping_city = $8, shipping_state = $9,
                shipping_zip = $10, shipping_country = $11, is_default = $12
            WHERE id = $1 AND buyer_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(buyer_id)
        .bind(&input.label)
        .bind(&c.shipping_name)
        .bind(&c.shipping_phone)
        .bind(&c.shipping_email)
        .bind(&c.shipping_address)
        .bind(&c.shipping_city)
        .bind(&c.shipping_state)
        .bind(&c.shipping_zip)
        .bind(&c.shipping_country)
        .bind(input.is_default)
        .fetch_optional(&mut *tx)
        .await?;

        // Dropping the transaction rolls back the cleared defaults
        if saved.is_some() {
            tx.commit().await?;
        }
        Ok(saved)
    }

    async fn delete_address(&self, buyer_id: &str, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM saved_addresses WHERE id = $1 AND buyer_id = $2")
            .bind(id)
            .bind(buyer_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
