// =============================================================================
// RESERVATION MANAGER
// =============================================================================
// Advisory, time-boxed stock holds for orders that are mid-checkout.
//
// A hold is just `reserved_at` on a pending order. It never touches the stock
// ledger and takes no lock; it only tells availability reporting and cleanup
// that someone is paying right now. Holds older than the TTL are cleared by a
// periodic sweep, which can also be triggered on demand.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Order, OrderStatus};
use crate::store::Store;

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stamp a not-yet-persisted pending order with a hold.
    pub fn hold(&self, order: &mut Order, now: DateTime<Utc>) -> AppResult<()> {
        if order.status != OrderStatus::Pending {
            return Err(AppError::invalid_state("Only pending orders can be reserved"));
        }
        order.reserved_at = Some(now);
        Ok(())
    }

    /// Set `reserved_at = now` on a stored pending order.
    pub async fn reserve(&self, order_id: Uuid) -> AppResult<DateTime<Utc>> {
        let now = Utc::now();
        if !self.store.set_reservation(order_id, Some(now)).await? {
            return Err(AppError::invalid_state("Only pending orders can be reserved"));
        }
        tracing::debug!(order_id = %order_id, "Reservation placed");
        Ok(now)
    }

    /// Clear the hold of a pending order. Returns false if nothing changed.
    pub async fn release(&self, order_id: Uuid) -> AppResult<bool> {
        self.store.set_reservation(order_id, None).await
    }

    pub fn is_active(&self, order: &Order, now: DateTime<Utc>) -> bool {
        order.status == OrderStatus::Pending
            && order.reserved_at.map_or(false, |at| now - at < self.ttl)
    }

    pub async fn sweep_expired(&self) -> AppResult<u64> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Clear every pending hold older than the TTL as of `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let released = self.store.sweep_reservations(now - self.ttl).await?;
        if released > 0 {
            metrics::record_reservations_released(released);
            tracing::info!(released, "Released expired reservations");
        }
        Ok(released)
    }

    /// Run the sweep forever on a fixed period.
    pub fn spawn_sweeper(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    tracing::error!(error = %e, "Reservation sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::sample_contact;

    fn order(reserved_at: Option<DateTime<Utc>>, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            buyer_id: "user_1".into(),
            product_id: "clock-default".into(),
            quantity: 1,
            amount: 9900,
            currency: "usd".into(),
            status,
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

    fn manager(store: Arc<MemoryStore>) -> ReservationManager {
        ReservationManager::new(store, Duration::minutes(30))
    }

    #[tokio::test]
    async fn expired_hold_is_released_once() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        let t = Utc::now();
        let pending = order(Some(t), OrderStatus::Pending);
        store.insert_order(&pending).await.unwrap();

        assert_eq!(manager.sweep_expired_at(t + Duration::minutes(29)).await.unwrap(), 0);
        assert_eq!(manager.sweep_expired_at(t + Duration::minutes(31)).await.unwrap(), 1);
        assert!(store.get_order(pending.id).await.unwrap().unwrap().reserved_at.is_none());
        assert_eq!(manager.sweep_expired_at(t + Duration::minutes(32)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_holds_alone() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        let now = Utc::now();
        let stale = order(Some(now - Duration::minutes(40)), OrderStatus::Pending);
        let fresh = order(Some(now - Duration::minutes(5)), OrderStatus::Pending);
        store.insert_order(&stale).await.unwrap();
        store.insert_order(&fresh).await.unwrap();

        assert_eq!(manager.sweep_expired_at(now).await.unwrap(), 1);
        let fresh = store.get_order(fresh.id).await.unwrap().unwrap();
        assert!(manager.is_active(&fresh, now));
    }

    #[tokio::test]
    async fn only_pending_orders_can_be_reserved() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        let paid = order(None, OrderStatus::Paid);
        store.insert_order(&paid).await.unwrap();

        let err = manager.reserve(paid.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        let mut draft = order(None, OrderStatus::Cancelled);
        assert!(manager.hold(&mut draft, Utc::now()).is_err());
        assert!(draft.reserved_at.is_none());
    }

    #[test]
    fn holds_expire_after_the_ttl() {
        let manager = ReservationManager::new(Arc::new(MemoryStore::new()), Duration::minutes(30));
        let t = Utc::now();
        let held = order(Some(t), OrderStatus::Pending);
        assert!(manager.is_active(&held, t + Duration::minutes(29)));
        assert!(!manager.is_active(&held, t + Duration::minutes(30)));
        assert!(!manager.is_active(&order(None, OrderStatus::Pending), t));
    }
}
