// =============================================================================
// ORDER STATE MACHINE
// =============================================================================
// Drives an order through its lifecycle:
//
//   checkout ──▶ pending ──payment succeeded──▶ paid ──cancel + refund──▶ refunded
//                   │
//                   └──cancel──▶ cancelled
//
// LEARNING NOTES:
// - Every transition is a conditional write in the store that re-reads the
//   current status; the service never trusts a status it loaded earlier
// - pending → paid applies the stock decrement and coupon redemption in the
//   same transaction, so webhook redelivery is a no-op
// - Processor calls happen outside any store transaction and are never
//   retried here
// - Notification failures are logged and never undo a transition
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::config::Config;
use crate::coupon::{canonical_code, CouponService};
use crate::error::{AppError, AppResult};
use crate::ledger::StockLedger;
use crate::metrics;
use crate::models::{
    CancelResponse, CheckoutRequest, CheckoutResponse, ConfirmOutcome, Order, OrderFilter,
    OrderStatus, RefundRecord,
};
use crate::notify::Notifier;
use crate::payment::{CheckoutSessionRequest, PaymentGateway, RefundRequest};
use crate::reservation::ReservationManager;
use crate::store::Store;

const DEFAULT_CANCEL_REASON: &str = "Customer cancellation";

/// Tracking status recorded when an admin first attaches a tracking number
const TRACKING_INFO_RECEIVED: &str = "info_received";

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    ledger: StockLedger,
    reservations: ReservationManager,
    coupons: CouponService,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Notifier,
    config: Arc<Config>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: StockLedger,
        reservations: ReservationManager,
        coupons: CouponService,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Notifier,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            ledger,
            reservations,
            coupons,
            gateway,
            notifier,
            config,
        }
    }

    // =========================================================================
    // CHECKOUT
    // =========================================================================

    /// Create a pending, reserved order and a hosted payment session for it.
    pub async fn create_checkout(
        &self,
        buyer_id: &str,
        request: CheckoutRequest,
    ) -> AppResult<CheckoutResponse> {
        request.shipping.validate()?;
        if request.quantity <= 0 {
            return Err(AppError::Validation("quantity must be positive".to_string()));
        }

        let product = &self.config.product;
        if !self.ledger.check_availability(&product.id, request.quantity).await {
            return Err(AppError::Validation("Product is out of stock".to_string()));
        }

        let amount = product.price * i64::from(request.quantity);

        let coupon_code = request
            .coupon_code
            .as_deref()
            .map(canonical_code)
            .filter(|code| !code.is_empty());
        let discount_amount = match &coupon_code {
            Some(code) => {
                let validation = self.coupons.validate(code, amount).await?;
                if !validation.valid {
                    return Err(AppError::Validation(
                        validation.error.unwrap_or_else(|| "Invalid coupon code".to_string()),
                    ));
                }
                Some(validation.discount_amount)
            }
            None => None,
        };

        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4(),
            buyer_id: buyer_id.to_string(),
            product_id: product.id.clone(),
            quantity: request.quantity,
            amount,
            currency: product.currency.clone(),
            status: OrderStatus::Pending,
            payment_session_id: None,
            coupon_code,
            discount_amount,
            amount_paid: None,
            reserved_at: None,
            shipping: request.shipping,
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
        };
        self.reservations.hold(&mut order, now)?;
        self.store.insert_order(&order).await?;

        tracing::info!(
            order_id = %order.id,
            buyer_id,
            amount = order.amount,
            discount = order.discount_amount.unwrap_or(0),
            "Order created"
        );

        let session = match self.gateway.create_session(&self.session_request(&order)).await {
            Ok(session) => session,
            Err(e) => {
                // The order stays pending without a session; retry-payment can pick it up
                tracing::error!(order_id = %order.id, error = %e, "Checkout session creation failed");
                self.reservations.release(order.id).await?;
                return Err(e);
            }
        };
        self.store
            .set_payment_session(order.id, Some(&session.id))
            .await?;

        tracing::info!(order_id = %order.id, session_id = %session.id, "Checkout session created");
        Ok(CheckoutResponse {
            order_id: order.id,
            url: session.url,
        })
    }

    fn session_request(&self, order: &Order) -> CheckoutSessionRequest {
        CheckoutSessionRequest {
            order_id: order.id,
            buyer_id: order.buyer_id.clone(),
            amount: order.payable_amount(),
            currency: order.currency.clone(),
            product_name: self.config.product.name.clone(),
            quantity: order.quantity,
            customer_email: order.shipping.shipping_email.clone(),
            success_url: self.config.success_url(),
            cancel_url: self.config.cancel_url(),
            coupon_code: order.coupon_code.clone(),
        }
    }

    // =========================================================================
    // PAYMENT EVENTS
    // =========================================================================

    /// Apply a payment-succeeded event. Safe to call any number of times.
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        amount_paid: Option<i64>,
    ) -> AppResult<ConfirmOutcome> {
        let outcome = self
            .store
            .confirm_payment(order_id, amount_paid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", order_id)))?;

        match &outcome {
            ConfirmOutcome::Confirmed {
                order,
                stock_decremented,
                coupon_redeemed,
            } => {
                metrics::record_transition(OrderStatus::Pending, OrderStatus::Paid);
                tracing::info!(order_id = %order.id, amount_paid = ?order.amount_paid, "Order paid");
                if !stock_decremented {
                    tracing::warn!(
                        order_id = %order.id,
                        quantity = order.quantity,
                        "Paid order exceeds units on hand, ledger left unchanged"
                    );
                }
                if *coupon_redeemed == Some(false) {
                    tracing::warn!(
                        order_id = %order.id,
                        coupon = ?order.coupon_code,
                        "Coupon usage limit reached before redemption"
                    );
                }
                self.ledger.invalidate(&order.product_id).await;
                self.send_confirmation(order).await;
            }
            ConfirmOutcome::AlreadyPaid(order) => {
                tracing::info!(order_id = %order.id, "Order already paid, ignoring duplicate confirmation");
            }
            ConfirmOutcome::NotPending(order) => {
                tracing::warn!(
                    order_id = %order.id,
                    status = %order.status,
                    "Payment confirmation for a closed order ignored"
                );
            }
        }
        Ok(outcome)
    }

    /// Confirm the order behind a checkout session. `None` if no order
    /// references the session.
    pub async fn confirm_session(
        &self,
        session_id: &str,
        amount_paid: Option<i64>,
    ) -> AppResult<Option<ConfirmOutcome>> {
        match self.store.find_order_by_session(session_id).await? {
            Some(order) => self.confirm_payment(order.id, amount_paid).await.map(Some),
            None => {
                tracing::warn!(session_id, "No order references this checkout session");
                Ok(None)
            }
        }
    }

    /// Async payment failure: the order stays pending with no session or hold
    /// so that a retry starts fresh.
    pub async fn payment_failed(&self, session_id: &str) -> AppResult<Option<Uuid>> {
        let Some(order) = self.store.find_order_by_session(session_id).await? else {
            tracing::warn!(session_id, "Payment failure for unknown checkout session");
            return Ok(None);
        };
        if self.store.release_payment_hold(order.id).await? {
            tracing::info!(order_id = %order.id, session_id, "Payment failed, hold released");
        }
        Ok(Some(order.id))
    }

    async fn send_confirmation(&self, order: &Order) {
        if order.confirmation_email_sent {
            return;
        }
        if self.notifier.order_confirmation(order).await {
            if let Err(e) = self.store.mark_confirmation_sent(order.id).await {
                tracing::warn!(order_id = %order.id, error = %e, "Could not record confirmation email");
            }
        }
    }

    // =========================================================================
    // BUYER / ADMIN ACTIONS
    // =========================================================================

    /// Load an order; with a requester, orders owned by someone else are
    /// reported as not found.
    pub async fn get_order(&self, order_id: Uuid, requester: Option<&str>) -> AppResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .filter(|order| requester.map_or(true, |buyer| order.is_owned_by(buyer)))
            .ok_or_else(|| AppError::NotFound("Order not found".to_string()))
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> AppResult<Vec<Order>> {
        self.store.list_orders(filter).await
    }

    /// Cancel a pending order, or refund a paid one. `requester` is `None`
    /// for admin cancellations.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        requester: Option<&str>,
        reason: Option<String>,
    ) -> AppResult<CancelResponse> {
        let order = self.get_order(order_id, requester).await?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        match order.status {
            OrderStatus::Pending => {
                if !self.store.cancel_pending(order.id, &reason).await? {
                    return Err(self.stale_state(order.id).await);
                }
                metrics::record_transition(OrderStatus::Pending, OrderStatus::Cancelled);
                tracing::info!(order_id = %order.id, reason = %reason, "Order cancelled");
                Ok(CancelResponse {
                    order_id: order.id,
                    status: OrderStatus::Cancelled,
                    refund_id: None,
                })
            }
            OrderStatus::Paid => self.refund(order, reason).await,
            status => Err(AppError::invalid_state(format!(
                "Order is already {}",
                status
            ))),
        }
    }

    /// paid → refunded. On any processor failure the order stays paid.
    async fn refund(&self, order: Order, reason: String) -> AppResult<CancelResponse> {
        let session_id = order
            .payment_session_id
            .as_deref()
            .ok_or_else(|| AppError::invalid_state("Order has no payment to refund"))?;
        let session = self.gateway.retrieve_session(session_id).await?;
        let payment_intent = session.payment_intent.ok_or_else(|| {
            AppError::Upstream("Checkout session has no payment intent".to_string())
        })?;

        let amount = order.amount_paid.unwrap_or_else(|| order.payable_amount());
        let refund = self
            .gateway
            .refund(&RefundRequest {
                payment_intent,
                amount,
                order_id: order.id,
                reason: reason.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(order_id = %order.id, error = %e, "Refund failed, order remains paid");
                e
            })?;

        let record = RefundRecord {
            refund_id: refund.id.clone(),
            amount: refund.amount,
            reason,
            refunded_at: Utc::now(),
        };
        if !self.store.record_refund(order.id, &record).await? {
            tracing::error!(
                order_id = %order.id,
                refund_id = %refund.id,
                "Refund issued but the order was no longer paid"
            );
            return Err(self.stale_state(order.id).await);
        }

        metrics::record_transition(OrderStatus::Paid, OrderStatus::Refunded);
        self.ledger.invalidate(&order.product_id).await;
        tracing::info!(order_id = %order.id, refund_id = %refund.id, amount = refund.amount, "Order refunded");

        Ok(CancelResponse {
            order_id: order.id,
            status: OrderStatus::Refunded,
            refund_id: Some(refund.id),
        })
    }

    /// Remove a pending or cancelled order owned by the buyer.
    pub async fn delete_order(&self, order_id: Uuid, buyer_id: &str) -> AppResult<()> {
        let order = self.get_order(order_id, Some(buyer_id)).await?;
        if !order.status.is_deletable() || !self.store.delete_order(order.id).await? {
            return Err(AppError::invalid_state(
                "Only pending or cancelled orders can be deleted",
            ));
        }
        tracing::info!(order_id = %order.id, buyer_id, "Order deleted");
        Ok(())
    }

    /// Start a fresh payment session for a pending order.
    pub async fn retry_payment(&self, order_id: Uuid, buyer_id: &str) -> AppResult<CheckoutResponse> {
        let order = self.get_order(order_id, Some(buyer_id)).await?;
        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Paid => return Err(AppError::already_paid()),
            status => {
                return Err(AppError::invalid_state(format!(
                    "Order is {}, only pending orders can be paid",
                    status
                )))
            }
        }

        if !self.ledger.check_availability_for(&order).await {
            return Err(AppError::Validation("Product is out of stock".to_string()));
        }

        if let Some(session_id) = order.payment_session_id.as_deref() {
            match self.gateway.retrieve_session(session_id).await {
                Ok(session) if session.is_settled() => {
                    tracing::info!(order_id = %order.id, session_id, "Previous session already paid");
                    self.confirm_payment(order.id, session.amount_total).await?;
                    return Err(AppError::already_paid());
                }
                Ok(session) => {
                    tracing::debug!(order_id = %order.id, session_id, status = ?session.status, "Replacing checkout session");
                }
                Err(e) => {
                    tracing::warn!(order_id = %order.id, session_id, error = %e, "Previous session unreadable, replacing");
                }
            }
        }

        self.reservations.reserve(order.id).await?;
        let session = self.gateway.create_session(&self.session_request(&order)).await?;
        if !self.store.set_payment_session(order.id, Some(&session.id)).await? {
            return Err(self.stale_state(order.id).await);
        }

        tracing::info!(order_id = %order.id, session_id = %session.id, "Payment retry session created");
        Ok(CheckoutResponse {
            order_id: order.id,
            url: session.url,
        })
    }

    /// Attach a tracking number and send the shipping notice once.
    pub async fn update_tracking(&self, order_id: Uuid, tracking_number: &str) -> AppResult<Order> {
        let tracking_number = tracking_number.trim();
        if tracking_number.is_empty() {
            return Err(AppError::Validation("tracking_number is required".to_string()));
        }
        let order = self.get_order(order_id, None).await?;
        if order.status != OrderStatus::Paid {
            return Err(AppError::invalid_state("Only paid orders can be shipped"));
        }

        let mut order = self
            .store
            .set_tracking(order.id, tracking_number, TRACKING_INFO_RECEIVED)
            .await?
            .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;
        tracing::info!(order_id = %order.id, tracking_number, "Tracking number set");

        if !order.shipping_email_sent && self.notifier.shipping_notice(&order).await {
            self.store.mark_shipping_email_sent(order.id).await?;
            order.shipping_email_sent = true;
        }
        Ok(order)
    }

    /// Error for a conditional write that lost a race with another transition.
    async fn stale_state(&self, order_id: Uuid) -> AppError {
        match self.store.get_order(order_id).await {
            Ok(Some(order)) if order.status == OrderStatus::Paid => AppError::already_paid(),
            Ok(Some(order)) => {
                AppError::invalid_state(format!("Order is already {}", order.status))
            }
            Ok(None) => AppError::NotFound("Order not found".to_string()),
            Err(e) => e,
        }
    }
}

// =============================================================================
// TEST HARNESS
// =============================================================================
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use chrono::Duration;

    use super::*;
    use crate::cache::StockCache;
    use crate::memory::MemoryStore;
    use crate::models::sample_contact;
    use crate::notify::testing::RecordingMailer;
    use crate::payment::MockGateway;

    pub struct Harness {
        pub service: OrderService,
        pub store: Arc<MemoryStore>,
        pub gateway: Arc<MockGateway>,
        pub mailer: Arc<RecordingMailer>,
        pub ledger: StockLedger,
    }

    /// Services over fresh in-memory backends. Product price 9900, 5 units.
    pub fn harness() -> Harness {
        let vars: HashMap<String, String> = [("PRODUCT_PRICE", "9900"), ("DEFAULT_STOCK", "5")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Arc::new(Config::from_map(&vars).expect("test config"));

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new(&config.public_base_url));
        let mailer = Arc::new(RecordingMailer::default());
        let ttl = Duration::minutes(config.reservation_ttl_minutes);

        let ledger = StockLedger::new(store.clone(), StockCache::disabled(), config.product.clone(), ttl);
        let reservations = ReservationManager::new(store.clone(), ttl);
        let coupons = CouponService::new(store.clone());
        let notifier = Notifier::new(
            mailer.clone(),
            config.email_sender.clone(),
            config.product.name.clone(),
        );
        let service = OrderService::new(
            store.clone(),
            ledger.clone(),
            reservations,
            coupons,
            gateway.clone(),
            notifier,
            config,
        );

        Harness {
            service,
            store,
            gateway,
            mailer,
            ledger,
        }
    }

    pub fn checkout_request(coupon: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            shipping: sample_contact(),
            coupon_code: coupon.map(str::to_string),
            quantity: 1,
        }
    }

    impl Harness {
        pub async fn stock(&self) -> i32 {
            self.ledger.product("clock-default").await.expect("product").stock
        }

        pub async fn order(&self, id: Uuid) -> Order {
            self.store.get_order(id).await.expect("store").expect("order")
        }

        /// Checkout as `user_1` and return the stored order.
        pub async fn checkout(&self, coupon: Option<&str>) -> Order {
            let response = self
                .service
                .create_checkout("user_1", checkout_request(coupon))
                .await
                .expect("checkout");
            self.order(response.order_id).await
        }
    }
}
