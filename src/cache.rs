// =============================================================================
// STOCK CACHE
// =============================================================================
// Optional Redis read-through cache for product ledger rows.
//
// The cache is strictly best effort: a miss, a decode failure or a Redis error
// all fall through to the store, and every ledger write deletes the key. Stock
// decisions that must be exact (confirmation, refund) never read from here.
// =============================================================================

use redis::aio::ConnectionManager;

use crate::models::Product;

/// Cached rows expire after one minute even without an invalidation
const TTL_SECS: u64 = 60;

#[derive(Clone, Default)]
pub struct StockCache {
    redis: Option<ConnectionManager>,
}

impl StockCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self { redis }
    }

    /// Cache that never stores anything.
    pub fn disabled() -> Self {
        Self { redis: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.redis.is_some()
    }

    fn key(product_id: &str) -> String {
        format!("storefront:product:{}", product_id)
    }

    pub async fn get(&self, product_id: &str) -> Option<Product> {
        let mut conn = self.redis.clone()?;
        let cached: Option<String> = redis::cmd("GET")
            .arg(Self::key(product_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| tracing::warn!(error = %e, product_id, "Stock cache read failed"))
            .ok()
            .flatten();

        cached.and_then(|json| serde_json::from_str(&json).ok())
    }

    pub async fn put(&self, product: &Product) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let json = match serde_json::to_string(product) {
            Ok(json) => json,
            Err(_) => return,
        };
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(Self::key(&product.id))
            .arg(TTL_SECS)
            .arg(json)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, product_id = %product.id, "Stock cache write failed");
        }
    }

    pub async fn invalidate(&self, product_id: &str) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(Self::key(product_id))
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, product_id, "Stock cache invalidation failed");
        }
    }

    /// `None` when no cache is configured.
    pub async fn ping(&self) -> Option<bool> {
        let mut conn = self.redis.clone()?;
        Some(
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok(),
        )
    }
}
