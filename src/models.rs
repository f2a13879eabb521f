// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the storage backends, the order workflow and the
// HTTP layer.
//
// LEARNING NOTES:
// - Monetary values are i64 minor currency units (cents); never floats
// - Enums that live in PostgreSQL derive sqlx::Type and map to native enums
// - #[sqlx(flatten)] + #[serde(flatten)] let one struct span several columns
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// ORDER STATUS
// =============================================================================
// pending ──paid──▶ paid ──refund──▶ refunded
//    │
//    └──cancel──▶ cancelled
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }

    /// Paid and refunded orders are financial records and must persist.
    pub fn is_deletable(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SHIPPING CONTACT
// =============================================================================
// Every field is required at checkout. The same shape is stored on orders and
// on saved addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, Validate)]
pub struct ShippingContact {
    #[validate(length(min = 1, message = "name is required"))]
    pub shipping_name: String,

    #[validate(length(min = 1, message = "phone is required"))]
    pub shipping_phone: String,

    #[validate(email(message = "a valid email is required"))]
    pub shipping_email: String,

    #[validate(length(min = 1, message = "address is required"))]
    pub shipping_address: String,

    #[validate(length(min = 1, message = "city is required"))]
    pub shipping_city: String,

    #[validate(length(min = 1, message = "state is required"))]
    pub shipping_state: String,

    #[validate(length(min = 1, message = "zip is required"))]
    pub shipping_zip: String,

    #[validate(length(min = 1, message = "country is required"))]
    pub shipping_country: String,
}

// =============================================================================
// ORDER
// =============================================================================
/// One purchase attempt.
///
/// `amount` is the undiscounted total; the processor is asked to charge
/// `amount - discount_amount`. `reserved_at` is the advisory stock hold and is
/// only ever set while the order is pending.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,

    /// Stable subject id from the external auth provider
    pub buyer_id: String,

    pub product_id: String,
    pub quantity: i32,

    /// Undiscounted total in minor units
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,

    /// External checkout-session reference
    pub payment_session_id: Option<String>,

    pub coupon_code: Option<String>,
    pub discount_amount: Option<i64>,

    /// What the processor reported as captured
    pub amount_paid: Option<i64>,

    pub reserved_at: Option<DateTime<Utc>>,

    #[sqlx(flatten)]
    #[serde(flatten)]
    pub shipping: ShippingContact,

    pub tracking_number: Option<String>,
    pub tracking_status: Option<String>,

    pub confirmation_email_sent: bool,
    pub shipping_email_sent: bool,

    /// Whether confirmation took the units out of the ledger. A refund only
    /// returns them when this is set.
    pub stock_decremented: bool,

    pub cancellation_reason: Option<String>,
    pub refund_id: Option<String>,
    pub refund_amount: Option<i64>,
    pub refunded_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Amount the buyer is charged after the coupon discount.
    pub fn payable_amount(&self) -> i64 {
        (self.amount - self.discount_amount.unwrap_or(0)).max(0)
    }

    pub fn is_owned_by(&self, buyer_id: &str) -> bool {
        self.buyer_id == buyer_id
    }
}

// =============================================================================
// PRODUCT (STOCK LEDGER ENTRY)
// =============================================================================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub sku: String,

    /// Unit price in minor units
    pub price: i64,
    pub currency: String,

    /// Units on hand; never negative
    pub stock: i32,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger view of a product: units on hand less live advisory holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: String,
    pub name: String,
    pub units_on_hand: i32,
    pub active_reservations: i64,
    pub available_units: i64,
    pub price: i64,
    pub currency: String,
    pub is_active: bool,
}

impl StockLevel {
    pub fn from_product(product: &Product, active_reservations: i64) -> Self {
        Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            units_on_hand: product.stock,
            active_reservations,
            available_units: (i64::from(product.stock) - active_reservations).max(0),
            price: product.price,
            currency: product.currency.clone(),
            is_active: product.is_active,
        }
    }
}

/// Admin inventory write: absolute value wins over delta when both are sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub stock: Option<i32>,
    pub delta: Option<i32>,
    pub is_active: Option<bool>,
}

// =============================================================================
// COUPON
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "discount_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: Uuid,

    /// Canonical uppercase code
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,

    /// Percent (0-100) for percentage coupons, minor units for fixed ones
    pub discount_value: i64,
    pub min_amount: Option<i64>,

    /// Cap applied to percentage discounts
    pub max_discount: Option<i64>,
    pub usage_limit: Option<i32>,
    pub usage_count: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin coupon creation payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub min_amount: Option<i64>,
    pub max_discount: Option<i64>,
    pub usage_limit: Option<i32>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Admin coupon edit: every present field is written as-is
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CouponUpdate {
    pub description: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<i64>,
    pub min_amount: Option<i64>,
    pub max_discount: Option<i64>,
    pub usage_limit: Option<i32>,
    pub usage_count: Option<i32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

// =============================================================================
// WAITLIST / NEWSLETTER / SAVED ADDRESSES
// =============================================================================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub email: String,
    pub buyer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub subscribed_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SavedAddress {
    pub id: Uuid,
    pub buyer_id: String,
    pub label: Option<String>,

    #[sqlx(flatten)]
    #[serde(flatten)]
    pub contact: ShippingContact,

    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInput {
    pub label: Option<String>,

    #[serde(flatten)]
    pub contact: ShippingContact,

    #[serde(default)]
    pub is_default: bool,
}

// =============================================================================
// STORE WRITE DESCRIPTORS
// =============================================================================
// Inputs for the atomic state-machine writes performed by the store.

/// Filter for order listings; `None` means "any"
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub buyer_id: Option<String>,
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub refund_id: String,
    pub amount: i64,
    pub reason: String,
    pub refunded_at: DateTime<Utc>,
}

/// Result of applying a payment-succeeded event inside one transaction.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// pending → paid applied by this call
    Confirmed {
        order: Order,
        /// false when the ledger could not cover the quantity
        stock_decremented: bool,
        /// Some(false) when the coupon's usage limit was already exhausted
        coupon_redeemed: Option<bool>,
    },
    /// Redelivery: the order was already paid, nothing changed
    AlreadyPaid(Order),
    /// Order is cancelled or refunded; the transition is not permitted
    NotPending(Order),
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

/// Body of `POST /api/v1/checkout`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub shipping: ShippingContact,

    pub coupon_code: Option<String>,

    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRequest {
    pub tracking_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponValidationRequest {
    pub code: String,
    pub order_amount: i64,
}

/// Response of the fail-open stock check endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCheckResponse {
    pub in_stock: bool,
    pub stock: i64,
    pub product_id: String,
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

/// Body of `POST /api/v1/admin/inventory/adjust`: positive restocks,
/// negative writes units off and fails rather than going below zero
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    pub released: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    /// None when no cache is configured
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable reason code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Diagnostic detail, only populated outside production
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
pub(crate) fn sample_contact() -> ShippingContact {
    ShippingContact {
        shipping_name: "Ada Lovelace".into(),
        shipping_phone: "555-0100".into(),
        shipping_email: "ada@example.com".into(),
        shipping_address: "1 Infinite Loop".into(),
        shipping_city: "Cupertino".into(),
        shipping_state: "CA".into(),
        shipping_zip: "95014".into(),
        shipping_country: "US".into(),
    }
}
