// =============================================================================
// STORE MODULE
// =============================================================================
// Persistence contract for the storefront.
//
// Two implementations exist:
// - db::Database      PostgreSQL, row locks and transactions
// - memory::MemoryStore  a single mutex over in-process maps
//
// Every method that changes order status is a single atomic unit: it re-reads
// the current status and applies the transition together with its ledger and
// coupon side effects, or applies nothing at all.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    AddressInput, ConfirmOutcome, Coupon, CouponUpdate, InventoryUpdate, Order, OrderFilter,
    Product, RefundRecord, SavedAddress, Subscriber, WaitlistEntry,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip used by readiness probes.
    async fn ping(&self) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // PRODUCTS / STOCK LEDGER
    // -------------------------------------------------------------------------
    async fn get_product(&self, id: &str) -> AppResult<Option<Product>>;

    /// Inserts the product unless a row with the same id exists; returns the
    /// row that is stored afterwards.
    async fn insert_product(&self, product: &Product) -> AppResult<Product>;

    /// Fails with `InsufficientStock` instead of going below zero.
    async fn decrement_stock(&self, id: &str, quantity: i32) -> AppResult<Product>;

    async fn increment_stock(&self, id: &str, quantity: i32) -> AppResult<Product>;

    async fn update_product(&self, id: &str, update: &InventoryUpdate) -> AppResult<Product>;

    /// Units held by pending orders whose reservation is newer than `since`.
    async fn count_active_reservations(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<i64>;

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------
    async fn insert_order(&self, order: &Order) -> AppResult<()>;

    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>>;

    async fn find_order_by_session(&self, session_id: &str) -> AppResult<Option<Order>>;

    /// Newest first.
    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<Vec<Order>>;

    /// Writes the session reference of a pending order. Returns false when
    /// the order is missing or no longer pending.
    async fn set_payment_session(&self, id: Uuid, session_id: Option<&str>) -> AppResult<bool>;

    /// Sets or clears the advisory hold of a pending order.
    async fn set_reservation(&self, id: Uuid, at: Option<DateTime<Utc>>) -> AppResult<bool>;

    /// Clears both the hold and the session reference of a pending order.
    async fn release_payment_hold(&self, id: Uuid) -> AppResult<bool>;

    /// pending → paid with the stock decrement and coupon redemption applied
    /// in the same transaction. `None` when the order does not exist.
    async fn confirm_payment(
        &self,
        id: Uuid,
        amount_paid: Option<i64>,
    ) -> AppResult<Option<ConfirmOutcome>>;

    /// pending → cancelled, clearing the hold.
    async fn cancel_pending(&self, id: Uuid, reason: &str) -> AppResult<bool>;

    /// paid → refunded, returning the units to the ledger.
    async fn record_refund(&self, id: Uuid, refund: &RefundRecord) -> AppResult<bool>;

    /// Removes a pending or cancelled order; any other status is left alone.
    async fn delete_order(&self, id: Uuid) -> AppResult<bool>;

    async fn mark_confirmation_sent(&self, id: Uuid) -> AppResult<()>;

    async fn set_tracking(
        &self,
        id: Uuid,
        tracking_number: &str,
        tracking_status: &str,
    ) -> AppResult<Option<Order>>;

    async fn mark_shipping_email_sent(&self, id: Uuid) -> AppResult<()>;

    /// Clears `reserved_at` on pending orders held since before `cutoff`.
    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    // -------------------------------------------------------------------------
    // COUPONS
    // -------------------------------------------------------------------------
    /// Lookup by canonical (uppercase) code.
    async fn find_coupon(&self, code: &str) -> AppResult<Option<Coupon>>;

    async fn get_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>>;

    async fn list_coupons(&self) -> AppResult<Vec<Coupon>>;

    /// Fails with a validation error when the code is taken.
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<Coupon>;

    async fn update_coupon(&self, id: Uuid, update: &CouponUpdate) -> AppResult<Option<Coupon>>;

    async fn delete_coupon(&self, id: Uuid) -> AppResult<bool>;

    // -------------------------------------------------------------------------
    // WAITLIST / NEWSLETTER
    // -------------------------------------------------------------------------
    async fn upsert_waitlist(&self, email: &str, buyer_id: Option<&str>)
        -> AppResult<WaitlistEntry>;

    async fn list_waitlist(&self) -> AppResult<Vec<WaitlistEntry>>;

    async fn find_subscriber(&self, email: &str) -> AppResult<Option<Subscriber>>;

    async fn insert_subscriber(&self, email: &str) -> AppResult<Subscriber>;

    async fn set_subscription(
        &self,
        email: &str,
        active: bool,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Subscriber>>;

    async fn list_subscribers(&self, active_only: bool) -> AppResult<Vec<Subscriber>>;

    // -------------------------------------------------------------------------
    // SAVED ADDRESSES
    // -------------------------------------------------------------------------
    /// Default first, then newest.
    async fn list_addresses(&self, buyer_id: &str) -> AppResult<Vec<SavedAddress>>;

    /// A default address clears the buyer's other defaults.
    async fn insert_address(&self, address: &SavedAddress) -> AppResult<SavedAddress>;

    async fn update_address(
        &self,
        buyer_id: &str,
        id: Uuid,
        input: &AddressInput,
    ) -> AppResult<Option<SavedAddress>>;

    async fn delete_address(&self, buyer_id: &str, id: Uuid) -> AppResult<bool>;
}
