// =============================================================================
// COUPON VALIDATOR
// =============================================================================
// Checks a coupon code against an order amount and computes the discount.
//
// LEARNING NOTES:
// - `evaluate` is a pure function of (coupon record, amount, now); the service
//   only adds the lookup and metrics around it
// - Validation never touches `usage_count`. Redemption happens exactly once,
//   inside the payment-confirmation transaction in the store
// - Admin CRUD writes fields directly and skips the validator
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Coupon, CouponUpdate, DiscountType, NewCoupon};
use crate::store::Store;

/// Outcome of a coupon validation as returned to the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponValidation {
    pub valid: bool,
    pub discount_amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a coupon cannot be applied. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unknown,
    Inactive,
    NotYetValid,
    Expired,
    Exhausted,
    BelowMinimum(i64),
}

impl Rejection {
    pub fn message(self) -> String {
        match self {
            Rejection::Unknown => "Invalid coupon code".to_string(),
            Rejection::Inactive => "This coupon is no longer active".to_string(),
            Rejection::NotYetValid => "This coupon is not yet valid".to_string(),
            Rejection::Expired => "This coupon has expired".to_string(),
            Rejection::Exhausted => "This coupon has reached its usage limit".to_string(),
            Rejection::BelowMinimum(min) => format!(
                "Minimum order amount is {}.{:02}",
                min / 100,
                min % 100
            ),
        }
    }

    /// Metric label
    fn label(self) -> &'static str {
        match self {
            Rejection::Unknown => "unknown",
            Rejection::Inactive => "inactive",
            Rejection::NotYetValid => "not_yet_valid",
            Rejection::Expired => "expired",
            Rejection::Exhausted => "exhausted",
            Rejection::BelowMinimum(_) => "below_minimum",
        }
    }
}

/// Codes are stored and compared in uppercase.
pub fn canonical_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount for `order_amount`, never more than the amount itself.
pub fn compute_discount(coupon: &Coupon, order_amount: i64) -> i64 {
    let discount = match coupon.discount_type {
        DiscountType::Fixed => coupon.discount_value,
        DiscountType::Percentage => {
            // round half up in integer minor units
            let raw = (order_amount * coupon.discount_value + 50) / 100;
            coupon.max_discount.map_or(raw, |cap| raw.min(cap))
        }
    };
    discount.clamp(0, order_amount.max(0))
}

/// Apply the validity checks in order; the first failure wins.
pub fn evaluate(
    coupon: Option<&Coupon>,
    order_amount: i64,
    now: DateTime<Utc>,
) -> Result<i64, Rejection> {
    let coupon = coupon.ok_or(Rejection::Unknown)?;
    if !coupon.is_active {
        return Err(Rejection::Inactive);
    }
    if now < coupon.valid_from {
        return Err(Rejection::NotYetValid);
    }
    if now > coupon.valid_until {
        return Err(Rejection::Expired);
    }
    if let Some(limit) = coupon.usage_limit {
        if coupon.usage_count >= limit {
            return Err(Rejection::Exhausted);
        }
    }
    if let Some(min) = coupon.min_amount {
        if order_amount < min {
            return Err(Rejection::BelowMinimum(min));
        }
    }
    Ok(compute_discount(coupon, order_amount))
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn Store>,
}

impl CouponService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn validate(&self, code: &str, order_amount: i64) -> AppResult<CouponValidation> {
        self.validate_at(code, order_amount, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        code: &str,
        order_amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<CouponValidation> {
        if order_amount < 0 {
            return Err(AppError::Validation("order_amount must not be negative".to_string()));
        }
        let code = canonical_code(code);
        if code.is_empty() {
            return Err(AppError::Validation("code is required".to_string()));
        }

        let coupon = self.store.find_coupon(&code).await?;
        let validation = match evaluate(coupon.as_ref(), order_amount, now) {
            Ok(discount_amount) => {
                metrics::record_coupon_validation("valid");
                CouponValidation {
                    valid: true,
                    discount_amount,
                    error: None,
                }
            }
            Err(rejection) => {
                metrics::record_coupon_validation(rejection.label());
                tracing::debug!(code = %code, reason = rejection.label(), "Coupon rejected");
                CouponValidation {
                    valid: false,
                    discount_amount: 0,
                    error: Some(rejection.message()),
                }
            }
        };
        Ok(validation)
    }

    // -------------------------------------------------------------------------
    // ADMIN CRUD
    // -------------------------------------------------------------------------

    pub async fn list(&self) -> AppResult<Vec<Coupon>> {
        self.store.list_coupons().await
    }

    pub async fn create(&self, input: NewCoupon) -> AppResult<Coupon> {
        let code = canonical_code(&input.code);
        if code.is_empty() {
            return Err(AppError::Validation("code is required".to_string()));
        }
        check_value(input.discount_type, input.discount_value)?;
        check_window(input.valid_from, input.valid_until)?;

        let now = Utc::now();
        let coupon = Coupon {
            id: Uuid::new_v4(),
            code,
            description: input.description,
            discount_type: input.discount_type,
            discount_value: input.discount_value,
            min_amount: input.min_amount,
            max_discount: input.max_discount,
            usage_limit: input.usage_limit,
            usage_count: 0,
            valid_from: input.valid_from,
            valid_until: input.valid_until,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let coupon = self.store.insert_coupon(&coupon).await?;
        tracing::info!(code = %coupon.code, coupon_id = %coupon.id, "Coupon created");
        Ok(coupon)
    }

    /// Partial update, validated against the stored coupon it merges into.
    pub async fn update(&self, id: Uuid, update: CouponUpdate) -> AppResult<Coupon> {
        let not_found = || AppError::NotFound(format!("Coupon not found: {}", id));
        let current = self.store.get_coupon(id).await?.ok_or_else(not_found)?;

        if update.discount_type.is_some() || update.discount_value.is_some() {
            check_value(
                update.discount_type.unwrap_or(current.discount_type),
                update.discount_value.unwrap_or(current.discount_value),
            )?;
        }
        check_window(
            update.valid_from.unwrap_or(current.valid_from),
            update.valid_until.unwrap_or(current.valid_until),
        )?;

        let coupon = self.store.update_coupon(id, &update).await?.ok_or_else(not_found)?;
        tracing::info!(code = %coupon.code, coupon_id = %id, "Coupon updated");
        Ok(coupon)
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        if !self.store.delete_coupon(id).await? {
            return Err(AppError::NotFound(format!("Coupon not found: {}", id)));
        }
        tracing::info!(coupon_id = %id, "Coupon deleted");
        Ok(())
    }
}

fn check_value(kind: DiscountType, value: i64) -> AppResult<()> {
    let ok = match kind {
        DiscountType::Percentage => (1..=100).contains(&value),
        DiscountType::Fixed => value > 0,
    };
    if !ok {
        return Err(AppError::Validation(
            "discount_value is out of range for the discount type".to_string(),
        ));
    }
    Ok(())
}

fn check_window(valid_from: DateTime<Utc>, valid_until: DateTime<Utc>) -> AppResult<()> {
    if valid_from > valid_until {
        return Err(AppError::Validation(
            "valid_from must not be after valid_until".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_coupon(code: &str, kind: DiscountType, value: i64) -> Coupon {
    let now = Utc::now();
    Coupon {
        id: Uuid::new_v4(),
        code: code.to_string(),
        description: None,
        discount_type: kind,
        discount_value: value,
        min_amount: None,
        max_discount: None,
        usage_limit: None,
        usage_count: 0,
        valid_from: now - chrono::Duration::days(1),
        valid_until: now + chrono::Duration::days(30),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Duration;

    #[test]
    fn exhausted_coupon_is_rejected_before_the_minimum() {
        let mut coupon = sample_coupon("SAVE10", DiscountType::Fixed, 1000);
        coupon.min_amount = Some(5000);
        coupon.usage_limit = Some(100);
        coupon.usage_count = 100;

        assert_eq!(evaluate(Some(&coupon), 9900, Utc::now()), Err(Rejection::Exhausted));
        assert_eq!(evaluate(Some(&coupon), 100, Utc::now()), Err(Rejection::Exhausted));
    }

    #[test]
    fn single_use_coupon_is_invalid_for_any_amount_once_used() {
        let mut coupon = sample_coupon("ONCE", DiscountType::Percentage, 50);
        coupon.usage_limit = Some(1);
        coupon.usage_count = 1;
        for amount in [0, 1, 9900, 10_000_000] {
            assert!(evaluate(Some(&coupon), amount, Utc::now()).is_err());
        }
    }

    #[test]
    fn checks_run_in_order() {
        let now = Utc::now();
        assert_eq!(evaluate(None, 100, now), Err(Rejection::Unknown));

        let mut coupon = sample_coupon("X", DiscountType::Fixed, 100);
        coupon.is_active = false;
        coupon.valid_until = now - Duration::days(1);
        assert_eq!(evaluate(Some(&coupon), 100, now), Err(Rejection::Inactive));

        coupon.is_active = true;
        assert_eq!(evaluate(Some(&coupon), 100, now), Err(Rejection::Expired));

        coupon.valid_from = now + Duration::hours(1);
        coupon.valid_until = now + Duration::days(1);
        assert_eq!(evaluate(Some(&coupon), 100, now), Err(Rejection::NotYetValid));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let mut coupon = sample_coupon("EDGE", DiscountType::Fixed, 100);
        let start = coupon.valid_from;
        coupon.valid_until = start + Duration::hours(1);
        assert!(evaluate(Some(&coupon), 500, start).is_ok());
        assert!(evaluate(Some(&coupon), 500, coupon.valid_until).is_ok());
    }

    #[test]
    fn discounts_are_capped() {
        let fixed = sample_coupon("F", DiscountType::Fixed, 5000);
        assert_eq!(compute_discount(&fixed, 9900), 5000);
        assert_eq!(compute_discount(&fixed, 3000), 3000);

        let mut pct = sample_coupon("P", DiscountType::Percentage, 15);
        // 9900 * 15% = 1485
        assert_eq!(compute_discount(&pct, 9900), 1485);
        // 333 * 15% = 49.95, rounds to 50
        assert_eq!(compute_discount(&pct, 333), 50);
        pct.max_discount = Some(1000);
        assert_eq!(compute_discount(&pct, 9900), 1000);
    }

    #[test]
    fn minimum_message_renders_major_units() {
        assert_eq!(
            Rejection::BelowMinimum(5000).message(),
            "Minimum order amount is 50.00"
        );
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_and_never_redeems() {
        let store = Arc::new(MemoryStore::new());
        let service = CouponService::new(store.clone());
        let mut coupon = sample_coupon("SAVE10", DiscountType::Percentage, 10);
        coupon.usage_limit = Some(1);
        store.insert_coupon(&coupon).await.unwrap();

        for _ in 0..3 {
            let result = service.validate("  save10 ", 9900).await.unwrap();
            assert!(result.valid);
            assert_eq!(result.discount_amount, 990);
        }
        let stored = store.find_coupon("SAVE10").await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 0);

        let unknown = service.validate("NOPE", 9900).await.unwrap();
        assert!(!unknown.valid);
        assert_eq!(unknown.error.as_deref(), Some("Invalid coupon code"));
    }

    #[tokio::test]
    async fn admin_crud_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let service = CouponService::new(store);
        let now = Utc::now();
        let input = NewCoupon {
            code: "spring".into(),
            description: Some("Spring sale".into()),
            discount_type: DiscountType::Percentage,
            discount_value: 20,
            min_amount: None,
            max_discount: Some(2000),
            usage_limit: Some(50),
            valid_from: now,
            valid_until: now + Duration::days(7),
        };
        let created = service.create(input.clone()).await.unwrap();
        assert_eq!(created.code, "SPRING");

        let dup = service.create(input.clone()).await.unwrap_err();
        assert!(matches!(dup, AppError::Validation(_)));

        let updated = service
            .update(created.id, CouponUpdate { is_active: Some(false), ..Default::default() })
            .await
            .unwrap();
        assert!(!updated.is_active);

        service.delete(created.id).await.unwrap();
        assert!(matches!(service.delete(created.id).await, Err(AppError::NotFound(_))));

        let backwards = NewCoupon {
            code: "BACK".into(),
            valid_from: now + Duration::days(2),
            valid_until: now,
            ..input
        };
        assert!(matches!(service.create(backwards).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn update_cannot_turn_the_window_backwards() {
        let store = Arc::new(MemoryStore::new());
        let service = CouponService::new(store.clone());
        let coupon = sample_coupon("WINTER", DiscountType::Fixed, 500);
        store.insert_coupon(&coupon).await.unwrap();

        let err = service
            .update(
                coupon.id,
                CouponUpdate {
                    valid_from: Some(coupon.valid_until + Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("valid_from")));

        let err = service
            .update(
                coupon.id,
                CouponUpdate { discount_type: Some(DiscountType::Percentage), ..Default::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let stored = store.find_coupon("WINTER").await.unwrap().unwrap();
        assert_eq!(stored.valid_from, coupon.valid_from);
        assert_eq!(stored.discount_type, DiscountType::Fixed);

        let missing = service.update(Uuid::new_v4(), CouponUpdate::default()).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
