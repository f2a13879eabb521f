// =============================================================================
// IN-MEMORY STORE
// =============================================================================
// Store implementation used for local development without PostgreSQL and by
// the workflow tests. One mutex guards every table, so each method observes
// and mutates a consistent snapshot just like a transaction would. The lock is
// never held across an await point.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AddressInput, ConfirmOutcome, Coupon, CouponUpdate, InventoryUpdate, Order, OrderFilter,
    OrderStatus, Product, RefundRecord, SavedAddress, Subscriber, WaitlistEntry,
};
use crate::store::Store;

#[derive(Default)]
struct Tables {
    products: HashMap<String, Product>,
    orders: HashMap<Uuid, Order>,
    coupons: HashMap<Uuid, Coupon>,
    waitlist: Vec<WaitlistEntry>,
    subscribers: HashMap<String, Subscriber>,
    addresses: HashMap<Uuid, SavedAddress>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// When set every call fails, simulating an unreachable database
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

fn product_not_found(id: &str) -> AppError {
    AppError::NotFound(format!("Product not found: {}", id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        self.check()
    }

    // -------------------------------------------------------------------------
    // PRODUCTS / STOCK LEDGER
    // -------------------------------------------------------------------------

    async fn get_product(&self, id: &str) -> AppResult<Option<Product>> {
        self.check()?;
        Ok(self.tables.lock().products.get(id).cloned())
    }

    async fn insert_product(&self, product: &Product) -> AppResult<Product> {
        self.check()?;
        let mut tables = self.tables.lock();
        let stored = tables
            .products
            .entry(product.id.clone())
            .or_insert_with(|| product.clone());
        Ok(stored.clone())
    }

    async fn decrement_stock(&self, id: &str, quantity: i32) -> AppResult<Product> {
        self.check()?;
        let mut tables = self.tables.lock();
        let product = tables
            .products
            .get_mut(id)
            .ok_or_else(|| product_not_found(id))?;
        if product.stock < quantity {
            return Err(AppError::InsufficientStock {
                available: i64::from(product.stock),
                requested: i64::from(quantity),
            });
        }
        product.stock -= quantity;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    async fn increment_stock(&self, id: &str, quantity: i32) -> AppResult<Product> {
        self.check()?;
        let mut tables = self.tables.lock();
        let product = tables
            .products
            .get_mut(id)
            .ok_or_else(|| product_not_found(id))?;
        product.stock += quantity;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    async fn update_product(&self, id: &str, update: &InventoryUpdate) -> AppResult<Product> {
        self.check()?;
        let mut tables = self.tables.lock();
        let product = tables
            .products
            .get_mut(id)
            .ok_or_else(|| product_not_found(id))?;
        product.stock = match (update.stock, update.delta) {
            (Some(stock), _) => stock,
            (None, Some(delta)) => (product.stock + delta).max(0),
            (None, None) => product.stock,
        };
        if let Some(active) = update.is_active {
            product.is_active = active;
        }
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    async fn count_active_reservations(
        &self,
        product_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .orders
            .values()
            .filter(|o| o.product_id == product_id && o.status == OrderStatus::Pending)
            .filter(|o| o.reserved_at.map_or(false, |at| at > since))
            .map(|o| i64::from(o.quantity))
            .sum())
    }

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        self.check()?;
        self.tables.lock().orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> AppResult<Option<Order>> {
        self.check()?;
        Ok(self.tables.lock().orders.get(&id).cloned())
    }

    async fn find_order_by_session(&self, session_id: &str) -> AppResult<Option<Order>> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .orders
            .values()
            .filter(|o| o.payment_session_id.as_deref() == Some(session_id))
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> AppResult<Vec<Order>> {
        self.check()?;
        let tables = self.tables.lock();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| filter.buyer_id.as_deref().map_or(true, |b| o.buyer_id == b))
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn set_payment_session(&self, id: Uuid, session_id: Option<&str>) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.payment_session_id = session_id.map(str::to_string);
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_reservation(&self, id: Uuid, at: Option<DateTime<Utc>>) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.reserved_at = at;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_payment_hold(&self, id: Uuid) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.reserved_at = None;
                order.payment_session_id = None;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn confirm_payment(
        &self,
        id: Uuid,
        amount_paid: Option<i64>,
    ) -> AppResult<Option<ConfirmOutcome>> {
        self.check()?;
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let order = match tables.orders.get_mut(&id) {
            Some(order) => order,
            None => return Ok(None),
        };

        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Paid => return Ok(Some(ConfirmOutcome::AlreadyPaid(order.clone()))),
            OrderStatus::Cancelled | OrderStatus::Refunded => {
                return Ok(Some(ConfirmOutcome::NotPending(order.clone())))
            }
        }

        let now = Utc::now();

        let stock_decremented = match tables.products.get_mut(&order.product_id) {
            Some(product) if product.stock >= order.quantity => {
                product.stock -= order.quantity;
                product.updated_at = now;
                true
            }
            _ => false,
        };

        let coupon_redeemed = order.coupon_code.as_deref().map(|code| {
            match tables.coupons.values_mut().find(|c| c.code == code) {
                Some(coupon) if coupon.usage_limit.map_or(true, |l| coupon.usage_count < l) => {
                    coupon.usage_count += 1;
                    coupon.updated_at = now;
                    true
                }
                _ => false,
            }
        });

        order.status = OrderStatus::Paid;
        order.reserved_at = None;
        order.stock_decremented = stock_decremented;
        if amount_paid.is_some() {
            order.amount_paid = amount_paid;
        }
        order.updated_at = now;

        Ok(Some(ConfirmOutcome::Confirmed {
            order: order.clone(),
            stock_decremented,
            coupon_redeemed,
        }))
    }

    async fn cancel_pending(&self, id: Uuid, reason: &str) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.orders.get_mut(&id) {
            Some(order) if order.status.can_transition_to(OrderStatus::Cancelled) => {
                order.status = OrderStatus::Cancelled;
                order.reserved_at = None;
                order.cancellation_reason = Some(reason.to_string());
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_refund(&self, id: Uuid, refund: &RefundRecord) -> AppResult<bool> {
        self.check()?;
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let order = match tables.orders.get_mut(&id) {
            Some(order) if order.status.can_transition_to(OrderStatus::Refunded) => order,
            _ => return Ok(false),
        };

        order.status = OrderStatus::Refunded;
        order.cancellation_reason = Some(refund.reason.clone());
        order.refund_id = Some(refund.refund_id.clone());
        order.refund_amount = Some(refund.amount);
        order.refunded_at = Some(refund.refunded_at);
        order.updated_at = Utc::now();

        if order.stock_decremented {
            if let Some(product) = tables.products.get_mut(&order.product_id) {
                product.stock += order.quantity;
                product.updated_at = Utc::now();
            }
        }
        Ok(true)
    }

    async fn delete_order(&self, id: Uuid) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        let deletable = tables
            .orders
            .get(&id)
            .map_or(false, |o| o.status.is_deletable());
        if deletable {
            tables.orders.remove(&id);
        }
        Ok(deletable)
    }

    async fn mark_confirmation_sent(&self, id: Uuid) -> AppResult<()> {
        self.check()?;
        if let Some(order) = self.tables.lock().orders.get_mut(&id) {
            order.confirmation_email_sent = true;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_tracking(
        &self,
        id: Uuid,
        tracking_number: &str,
        tracking_status: &str,
    ) -> AppResult<Option<Order>> {
        self.check()?;
        let mut tables = self.tables.lock();
        Ok(tables.orders.get_mut(&id).map(|order| {
            order.tracking_number = Some(tracking_number.to_string());
            order.tracking_status = Some(tracking_status.to_string());
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn mark_shipping_email_sent(&self, id: Uuid) -> AppResult<()> {
        self.check()?;
        if let Some(order) = self.tables.lock().orders.get_mut(&id) {
            order.shipping_email_sent = true;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn sweep_reservations(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut released = 0;
        for order in tables.orders.values_mut() {
            let expired = order.status == OrderStatus::Pending
                && order.reserved_at.map_or(false, |at| at < cutoff);
            if expired {
                order.reserved_at = None;
                order.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    // -------------------------------------------------------------------------
    // COUPONS
    // -------------------------------------------------------------------------

    async fn find_coupon(&self, code: &str) -> AppResult<Option<Coupon>> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables.coupons.values().find(|c| c.code == code).cloned())
    }

    async fn get_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        self.check()?;
        Ok(self.tables.lock().coupons.get(&id).cloned())
    }

    async fn list_coupons(&self) -> AppResult<Vec<Coupon>> {
        self.check()?;
        let tables = self.tables.lock();
        let mut coupons: Vec<Coupon> = tables.coupons.values().cloned().collect();
        coupons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(coupons)
    }

    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<Coupon> {
        self.check()?;
        let mut tables = self.tables.lock();
        if tables.coupons.values().any(|c| c.code == coupon.code) {
            return Err(AppError::Validation("Coupon code already exists".to_string()));
        }
        tables.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon.clone())
    }

    async fn update_coupon(&self, id: Uuid, update: &CouponUpdate) -> AppResult<Option<Coupon>> {
        self.check()?;
        let mut tables = self.tables.lock();
        let coupon = match tables.coupons.get_mut(&id) {
            Some(coupon) => coupon,
            None => return Ok(None),
        };
        if let Some(description) = &update.description {
            coupon.description = Some(description.clone());
        }
        if let Some(discount_type) = update.discount_type {
            coupon.discount_type = discount_type;
        }
        if let Some(value) = update.discount_value {
            coupon.discount_value = value;
        }
        if update.min_amount.is_some() {
            coupon.min_amount = update.min_amount;
        }
        if update.max_discount.is_some() {
            coupon.max_discount = update.max_discount;
        }
        if update.usage_limit.is_some() {
            coupon.usage_limit = update.usage_limit;
        }
        if let Some(count) = update.usage_count {
            coupon.usage_count = count;
        }
        if let Some(from) = update.valid_from {
            coupon.valid_from = from;
        }
        if let Some(until) = update.valid_until {
            coupon.valid_until = until;
        }
        if let Some(active) = update.is_active {
            coupon.is_active = active;
        }
        coupon.updated_at = Utc::now();
        Ok(Some(coupon.clone()))
    }

    async fn delete_coupon(&self, id: Uuid) -> AppResult<bool> {
        self.check()?;
        Ok(self.tables.lock().coupons.remove(&id).is_some())
    }

    // -------------------------------------------------------------------------
    // WAITLIST / NEWSLETTER
    // -------------------------------------------------------------------------

    async fn upsert_waitlist(
        &self,
        email: &str,
        buyer_id: Option<&str>,
    ) -> AppResult<WaitlistEntry> {
        self.check()?;
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.waitlist.iter_mut().find(|e| e.email == email) {
            if let Some(buyer_id) = buyer_id {
                entry.buyer_id = Some(buyer_id.to_string());
            }
            return Ok(entry.clone());
        }
        let entry = WaitlistEntry {
            id: Uuid::new_v4(),
            email: email.to_string(),
            buyer_id: buyer_id.map(str::to_string),
            created_at: Utc::now(),
        };
        tables.waitlist.push(entry.clone());
        Ok(entry)
    }

    async fn list_waitlist(&self) -> AppResult<Vec<WaitlistEntry>> {
        self.check()?;
        Ok(self.tables.lock().waitlist.clone())
    }

    async fn find_subscriber(&self, email: &str) -> AppResult<Option<Subscriber>> {
        self.check()?;
        Ok(self.tables.lock().subscribers.get(email).cloned())
    }

    async fn insert_subscriber(&self, email: &str) -> AppResult<Subscriber> {
        self.check()?;
        let mut tables = self.tables.lock();
        if tables.subscribers.contains_key(email) {
            return Err(AppError::Validation("Already subscribed".to_string()));
        }
        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            email: email.to_string(),
            is_active: true,
            subscribed_at: Utc::now(),
            unsubscribed_at: None,
        };
        tables
            .subscribers
            .insert(email.to_string(), subscriber.clone());
        Ok(subscriber)
    }

    async fn set_subscription(
        &self,
        email: &str,
        active: bool,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Subscriber>> {
        self.check()?;
        let mut tables = self.tables.lock();
        Ok(tables.subscribers.get_mut(email).map(|s| {
            s.is_active = active;
            if active {
                s.subscribed_at = at;
                s.unsubscribed_at = None;
            } else {
                s.unsubscribed_at = Some(at);
            }
            s.clone()
        }))
    }

    async fn list_subscribers(&self, active_only: bool) -> AppResult<Vec<Subscriber>> {
        self.check()?;
        let tables = self.tables.lock();
        let mut subscribers: Vec<Subscriber> = tables
            .subscribers
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        subscribers.sort_by(|a, b| b.subscribed_at.cmp(&a.subscribed_at));
        Ok(subscribers)
    }

    // -------------------------------------------------------------------------
    // SAVED ADDRESSES
    // -------------------------------------------------------------------------

    async fn list_addresses(&self, buyer_id: &str) -> AppResult<Vec<SavedAddress>> {
        self.check()?;
        let tables = self.tables.lock();
        let mut addresses: Vec<SavedAddress> = tables
            .addresses
            .values()
            .filter(|a| a.buyer_id == buyer_id)
            .cloned()
            .collect();
        addresses.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(addresses)
    }

    async fn insert_address(&self, address: &SavedAddress) -> AppResult<SavedAddress> {
        self.check()?;
        let mut tables = self.tables.lock();
        if address.is_default {
            for other in tables.addresses.values_mut() {
                if other.buyer_id == address.buyer_id {
                    other.is_default = false;
                }
            }
        }
        tables.addresses.insert(address.id, address.clone());
        Ok(address.clone())
    }

    async fn update_address(
        &self,
        buyer_id: &str,
        id: Uuid,
        input: &AddressInput,
    ) -> AppResult<Option<SavedAddress>> {
        self.check()?;
        let mut tables = self.tables.lock();
        let owned = tables
            .addresses
            .get(&id)
            .map_or(false, |a| a.buyer_id == buyer_id);
        if !owned {
            return Ok(None);
        }
        if input.is_default {
            for other in tables.addresses.values_mut() {
                if other.buyer_id == buyer_id && other.id != id {
                    other.is_default = false;
                }
            }
        }
        Ok(tables.addresses.get_mut(&id).map(|address| {
            address.label = input.label.clone();
            address.contact = input.contact.clone();
            address.is_default = input.is_default;
            address.clone()
        }))
    }

    async fn delete_address(&self, buyer_id: &str, id: Uuid) -> AppResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        let owned = tables
            .addresses
            .get(&id)
            .map_or(false, |a| a.buyer_id == buyer_id);
        if owned {
            tables.addresses.remove(&id);
        }
        Ok(owned)
    }
}
