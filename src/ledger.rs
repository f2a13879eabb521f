// =============================================================================
// STOCK LEDGER
// =============================================================================
// Units on hand per product. Only confirmed sales decrement the ledger and
// only refunds or restocks increment it; advisory reservations are subtracted
// when reporting availability but never written here.
//
// Availability checks fail open: if the lookup itself fails the sale is
// allowed to proceed. This can oversell during an outage and is an accepted
// business tradeoff in favour of conversion.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::cache::StockCache;
use crate::config::ProductConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{InventoryUpdate, Order, OrderStatus, Product, StockCheckResponse, StockLevel};
use crate::store::Store;

#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn Store>,
    cache: StockCache,
    product: ProductConfig,
    reservation_ttl: Duration,
    diagnostics: bool,
}

impl StockLedger {
    pub fn new(
        store: Arc<dyn Store>,
        cache: StockCache,
        product: ProductConfig,
        reservation_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            product,
            reservation_ttl,
            diagnostics: false,
        }
    }

    /// Report lookup failures in the `error` field of degraded stock checks.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// The single sellable product's id.
    pub fn default_product_id(&self) -> &str {
        &self.product.id
    }

    // -------------------------------------------------------------------------
    // READS
    // -------------------------------------------------------------------------

    /// Read the product row, seeding the configured product on first access.
    pub async fn product(&self, product_id: &str) -> AppResult<Product> {
        if let Some(product) = self.cache.get(product_id).await {
            return Ok(product);
        }

        let product = match self.store.get_product(product_id).await? {
            Some(product) => product,
            None if product_id == self.product.id => self.bootstrap().await?,
            None => return Err(AppError::NotFound(format!("Product not found: {}", product_id))),
        };

        self.cache.put(&product).await;
        Ok(product)
    }

    async fn bootstrap(&self) -> AppResult<Product> {
        let now = Utc::now();
        let seed = Product {
            id: self.product.id.clone(),
            name: self.product.name.clone(),
            description: None,
            sku: self.product.sku.clone(),
            price: self.product.price,
            currency: self.product.currency.clone(),
            stock: self.product.default_stock,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let product = self.store.insert_product(&seed).await?;
        tracing::info!(product_id = %product.id, stock = product.stock, "Seeded product ledger entry");
        Ok(product)
    }

    /// Units on hand less live reservations.
    pub async fn get_stock(&self, product_id: &str) -> AppResult<StockLevel> {
        self.get_stock_at(product_id, Utc::now()).await
    }

    pub async fn get_stock_at(&self, product_id: &str, now: DateTime<Utc>) -> AppResult<StockLevel> {
        let product = self.product(product_id).await?;
        let held = self
            .store
            .count_active_reservations(product_id, now - self.reservation_ttl)
            .await?;
        metrics::set_stock_level(&product.id, product.stock);
        Ok(StockLevel::from_product(&product, held))
    }

    /// Strict availability check; errors propagate.
    pub async fn try_check_availability(&self, product_id: &str, quantity: i32) -> AppResult<bool> {
        let level = self.get_stock(product_id).await?;
        Ok(level.available_units >= i64::from(quantity))
    }

    /// Strict check for an order that already exists. Its own live hold is
    /// not counted against it.
    pub async fn try_check_availability_for(&self, order: &Order, now: DateTime<Utc>) -> AppResult<bool> {
        let level = self.get_stock_at(&order.product_id, now).await?;
        let since = now - self.reservation_ttl;
        let own_hold = match order.reserved_at {
            Some(at) if order.status == OrderStatus::Pending && at > since => i64::from(order.quantity),
            _ => 0,
        };
        let held_by_others = (level.active_reservations - own_hold).max(0);
        Ok(i64::from(level.units_on_hand) - held_by_others >= i64::from(order.quantity))
    }

    /// Fail-open variant of [`Self::try_check_availability_for`].
    pub async fn check_availability_for(&self, order: &Order) -> bool {
        match self.try_check_availability_for(order, Utc::now()).await {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(error = %e, order_id = %order.id, "Stock lookup failed, failing open");
                true
            }
        }
    }

    /// Availability check that treats any lookup failure as "available".
    pub async fn check_availability(&self, product_id: &str, quantity: i32) -> bool {
        match self.try_check_availability(product_id, quantity).await {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(error = %e, product_id, quantity, "Stock lookup failed, failing open");
                true
            }
        }
    }

    /// Buyer-facing stock check. Never fails; on error it reports in stock.
    pub async fn stock_check(&self, product_id: Option<&str>, quantity: i32) -> StockCheckResponse {
        let product_id = product_id.unwrap_or(&self.product.id);
        let quantity = quantity.max(1);

        match self.get_stock(product_id).await {
            Ok(level) => StockCheckResponse {
                in_stock: level.available_units >= i64::from(quantity),
                stock: level.available_units,
                product_id: level.product_id,
                product_name: level.name,
                error: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, product_id, "Stock check failed, reporting in stock");
                StockCheckResponse {
                    in_stock: true,
                    stock: i64::from(self.product.default_stock),
                    product_id: product_id.to_string(),
                    product_name: self.product.name.clone(),
                    error: self.diagnostics.then(|| e.to_string()),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // WRITES
    // -------------------------------------------------------------------------

    pub async fn decrement(&self, product_id: &str, quantity: i32) -> AppResult<Product> {
        ensure_positive(quantity)?;
        let product = self.store.decrement_stock(product_id, quantity).await?;
        self.written(&product).await;
        Ok(product)
    }

    pub async fn increment(&self, product_id: &str, quantity: i32) -> AppResult<Product> {
        ensure_positive(quantity)?;
        let product = self.store.increment_stock(product_id, quantity).await?;
        self.written(&product).await;
        Ok(product)
    }

    /// Admin restock (positive) or write-off (negative). Unlike `update`'s
    /// delta, a write-off larger than the units on hand is rejected.
    pub async fn adjust(&self, product_id: &str, quantity: i32) -> AppResult<StockLevel> {
        self.product(product_id).await?;
        let product = match quantity {
            0 => return Err(AppError::Validation("quantity must not be zero".to_string())),
            q if q > 0 => self.increment(product_id, q).await?,
            q => self.decrement(product_id, -q).await?,
        };
        tracing::info!(product_id, quantity, stock = product.stock, "Inventory adjusted");
        self.get_stock(product_id).await
    }

    /// Admin write: absolute stock, a clamped delta, or the active flag.
    pub async fn update(&self, product_id: &str, update: &InventoryUpdate) -> AppResult<StockLevel> {
        if update.stock.map_or(false, |s| s < 0) {
            return Err(AppError::Validation("stock must not be negative".to_string()));
        }
        if update.stock.is_none() && update.delta.is_none() && update.is_active.is_none() {
            return Err(AppError::Validation(
                "one of stock, delta or is_active is required".to_string(),
            ));
        }
        // Seed first so an update against a fresh database has a row to hit
        self.product(product_id).await?;
        let product = self.store.update_product(product_id, update).await?;
        self.written(&product).await;
        tracing::info!(product_id, stock = product.stock, is_active = product.is_active, "Inventory updated");
        self.get_stock(product_id).await
    }

    /// Drop the cached row after a write made elsewhere (confirmation, refund).
    pub async fn invalidate(&self, product_id: &str) {
        self.cache.invalidate(product_id).await;
    }

    async fn written(&self, product: &Product) {
        self.cache.invalidate(&product.id).await;
        metrics::set_stock_level(&product.id, product.stock);
    }
}

fn ensure_positive(quantity: i32) -> AppResult<()> {
    if quantity <= 0 {
        return Err(AppError::Validation("quantity must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::memory::MemoryStore;
    use crate::models::sample_contact;
    use uuid::Uuid;

    fn ledger(store: Arc<MemoryStore>) -> StockLedger {
        let config = test_config();
        StockLedger::new(
            store,
            StockCache::disabled(),
            config.product,
            Duration::minutes(config.reservation_ttl_minutes),
        )
    }

    fn pending_order(product_id: &str, reserved_at: Option<DateTime<Utc>>) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            buyer_id: "user_1".into(),
            product_id: product_id.into(),
            quantity: 1,
            amount: 29900,
            currency: "usd".into(),
            status: OrderStatus::Pending,
            payment_session_id: None,
            coupon_code: None,
            discount_amount: None,
            amount_paid: None,
            reserved_at,
            shipping: sample_contact(),
            tracking_number: None,
            tracking_status: None,
            confirmation_email_sent: false,
            shipping_email_sent: false,
            stock_decremented: false,
            cancellation_reason: None,
            refund_id: None,
            refund_amount: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn configured_product_is_seeded_on_first_read() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let level = ledger.get_stock("clock-default").await.unwrap();
        assert_eq!(level.units_on_hand, 100);
        assert_eq!(level.available_units, 100);
        assert_eq!(level.name, "Retro Desktop Clock");
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let err = ledger.get_stock("lamp").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn live_reservations_reduce_availability_but_not_the_ledger() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        ledger
            .update("clock-default", &InventoryUpdate { stock: Some(2), ..Default::default() })
            .await
            .unwrap();

        let now = Utc::now();
        store.insert_order(&pending_order("clock-default", Some(now))).await.unwrap();
        // A hold older than the TTL no longer counts
        store
            .insert_order(&pending_order("clock-default", Some(now - Duration::minutes(45))))
            .await
            .unwrap();

        let level = ledger.get_stock_at("clock-default", now).await.unwrap();
        assert_eq!(level.units_on_hand, 2);
        assert_eq!(level.active_reservations, 1);
        assert_eq!(level.available_units, 1);
        assert!(ledger.try_check_availability("clock-default", 1).await.unwrap());
        assert!(!ledger.try_check_availability("clock-default", 2).await.unwrap());
    }

    #[tokio::test]
    async fn an_order_is_not_blocked_by_its_own_hold() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        ledger
            .update("clock-default", &InventoryUpdate { stock: Some(1), ..Default::default() })
            .await
            .unwrap();

        let now = Utc::now();
        let mine = pending_order("clock-default", Some(now));
        store.insert_order(&mine).await.unwrap();
        assert!(ledger.try_check_availability_for(&mine, now).await.unwrap());
        assert!(!ledger.try_check_availability("clock-default", 1).await.unwrap());

        // Someone else's live hold still counts
        store.insert_order(&pending_order("clock-default", Some(now))).await.unwrap();
        assert!(!ledger.try_check_availability_for(&mine, now).await.unwrap());
    }

    #[tokio::test]
    async fn decrement_never_goes_negative() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store);
        ledger
            .update("clock-default", &InventoryUpdate { stock: Some(1), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(ledger.decrement("clock-default", 1).await.unwrap().stock, 0);
        let err = ledger.decrement("clock-default", 1).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { available: 0, requested: 1 }));
        assert_eq!(ledger.increment("clock-default", 3).await.unwrap().stock, 3);
    }

    #[tokio::test]
    async fn adjust_restocks_and_refuses_oversized_write_offs() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        ledger
            .update("clock-default", &InventoryUpdate { stock: Some(2), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(ledger.adjust("clock-default", 3).await.unwrap().units_on_hand, 5);
        assert_eq!(ledger.adjust("clock-default", -4).await.unwrap().units_on_hand, 1);
        assert!(matches!(
            ledger.adjust("clock-default", -2).await,
            Err(AppError::InsufficientStock { available: 1, requested: 2 })
        ));
        assert!(matches!(ledger.adjust("clock-default", 0).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn delta_updates_clamp_at_zero() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let level = ledger
            .update("clock-default", &InventoryUpdate { delta: Some(-500), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(level.units_on_hand, 0);

        let err = ledger
            .update("clock-default", &InventoryUpdate { stock: Some(-1), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn availability_fails_open_when_the_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        store.set_offline(true);

        assert!(ledger.try_check_availability("clock-default", 1).await.is_err());
        assert!(ledger.check_availability("clock-default", 1).await);

        let response = ledger.stock_check(None, 1).await;
        assert!(response.in_stock);
        assert_eq!(response.product_id, "clock-default");
    }

    #[tokio::test]
    async fn stock_check_reports_sold_out() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        ledger
            .update("clock-default", &InventoryUpdate { stock: Some(0), ..Default::default() })
            .await
            .unwrap();
        let response = ledger.stock_check(Some("clock-default"), 1).await;
        assert!(!response.in_stock);
        assert_eq!(response.stock, 0);
        assert!(response.error.is_none());
    }
}
