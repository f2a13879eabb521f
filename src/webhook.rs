// =============================================================================
// PAYMENT WEBHOOK ADAPTER
// =============================================================================
// Authenticates processor callbacks and feeds them to the order state machine.
//
// Delivery is at-least-once and unordered, so:
// - verified events for an order that is already paid are acknowledged as
//   duplicates
// - unknown event kinds are acknowledged so the processor stops retrying
// - handler failures answer 5xx so the processor delivers again later
//
// Signature header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]`, where
// the HMAC-SHA256 is computed over "<t>.<raw body>" with the endpoint secret.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::{Config, Environment};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::ConfirmOutcome;
use crate::orders::OrderService;

type HmacSha256 = Hmac<Sha256>;

/// Body returned to the processor on success
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
}

/// Normalised processor event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    CheckoutSessionCompleted {
        session_id: String,
        amount_total: Option<i64>,
    },
    AsyncPaymentFailed {
        session_id: String,
    },
    PaymentIntentSucceeded {
        order_id: Option<Uuid>,
        session_id: Option<String>,
        amount: Option<i64>,
    },
    Other(String),
}

impl WebhookEvent {
    pub fn kind(&self) -> &str {
        match self {
            WebhookEvent::CheckoutSessionCompleted { .. } => "checkout.session.completed",
            WebhookEvent::AsyncPaymentFailed { .. } => "checkout.session.async_payment_failed",
            WebhookEvent::PaymentIntentSucceeded { .. } => "payment_intent.succeeded",
            WebhookEvent::Other(kind) => kind,
        }
    }
}

// -----------------------------------------------------------------------------
// SIGNATURE VERIFICATION
// -----------------------------------------------------------------------------

/// Check `header` against `payload` signed with `secret` at time `now`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> AppResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        AppError::InvalidSignature("Unable to extract timestamp from signature header".to_string())
    })?;
    if signatures.is_empty() {
        return Err(AppError::InvalidSignature(
            "No v1 signatures found in signature header".to_string(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Configuration(format!("Unusable webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    if !signatures
        .iter()
        .any(|signature| mac.clone().verify_slice(signature).is_ok())
    {
        return Err(AppError::InvalidSignature(
            "No signatures found matching the expected signature for payload".to_string(),
        ));
    }

    if (now - timestamp).abs() > tolerance_secs {
        return Err(AppError::InvalidSignature(
            "Timestamp outside the tolerance zone".to_string(),
        ));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// EVENT PARSING
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    amount_total: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    amount: Option<i64>,
    amount_received: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn malformed(e: serde_json::Error) -> AppError {
    AppError::Validation(format!("Malformed webhook payload: {}", e))
}

pub fn parse_event(payload: &[u8]) -> AppResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_slice(payload).map_err(malformed)?;

    let event = match raw.kind.as_str() {
        "checkout.session.completed" => {
            let session: SessionObject =
                serde_json::from_value(raw.data.object).map_err(malformed)?;
            WebhookEvent::CheckoutSessionCompleted {
                session_id: session.id,
                amount_total: session.amount_total,
            }
        }
        "checkout.session.async_payment_failed" => {
            let session: SessionObject =
                serde_json::from_value(raw.data.object).map_err(malformed)?;
            WebhookEvent::AsyncPaymentFailed {
                session_id: session.id,
            }
        }
        "payment_intent.succeeded" => {
            let intent: IntentObject =
                serde_json::from_value(raw.data.object).map_err(malformed)?;
            WebhookEvent::PaymentIntentSucceeded {
                order_id: intent
                    .metadata
                    .get("order_id")
                    .and_then(|id| Uuid::parse_str(id).ok()),
                session_id: intent.metadata.get("session_id").cloned(),
                amount: intent.amount_received.or(intent.amount),
            }
        }
        _ => WebhookEvent::Other(raw.kind),
    };
    Ok(event)
}

// -----------------------------------------------------------------------------
// ADAPTER
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct WebhookAdapter {
    orders: OrderService,
    secret: Option<String>,
    environment: Environment,
    tolerance_secs: i64,
}

impl WebhookAdapter {
    pub fn new(
        orders: OrderService,
        secret: Option<String>,
        environment: Environment,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            orders,
            secret,
            environment,
            tolerance_secs,
        }
    }

    pub fn from_config(orders: OrderService, config: &Config) -> Self {
        Self::new(
            orders,
            config.stripe_webhook_secret.clone(),
            config.environment,
            config.webhook_tolerance_secs,
        )
    }

    /// Authenticate, parse and dispatch one delivery.
    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> AppResult<WebhookAck> {
        let event = self.authenticate(payload, signature, Utc::now().timestamp())?;
        let kind = event.kind().to_string();

        match self.dispatch(event).await {
            Ok(outcome) => {
                metrics::record_webhook(&kind, outcome);
                Ok(WebhookAck { received: true })
            }
            Err(e) => {
                metrics::record_webhook(&kind, "error");
                tracing::error!(kind = %kind, error = %e, "Webhook processing failed");
                // Anything short of a server error would stop redelivery
                if e.status().is_server_error() {
                    Err(e)
                } else {
                    Err(AppError::Internal(format!("Webhook processing failed: {}", e)))
                }
            }
        }
    }

    fn authenticate(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> AppResult<WebhookEvent> {
        let signature = signature
            .ok_or_else(|| AppError::InvalidSignature("No signature provided".to_string()))?;

        match self.secret.as_deref() {
            Some(secret) => {
                verify_signature(payload, signature, secret, self.tolerance_secs, now).map_err(
                    |e| {
                        tracing::warn!(error = %e, "Webhook signature verification failed");
                        e
                    },
                )?;
            }
            None if self.environment.is_production() => {
                tracing::error!("Webhook secret is not configured");
                return Err(AppError::Configuration(
                    "Webhook secret not configured".to_string(),
                ));
            }
            None => {
                tracing::warn!("Webhook secret not configured, parsing without signature verification (unsafe, development only)");
            }
        }
        parse_event(payload)
    }

    async fn dispatch(&self, event: WebhookEvent) -> AppResult<&'static str> {
        match event {
            WebhookEvent::CheckoutSessionCompleted {
                session_id,
                amount_total,
            } => {
                let outcome = self.orders.confirm_session(&session_id, amount_total).await?;
                Ok(label(outcome.as_ref()))
            }
            WebhookEvent::AsyncPaymentFailed { session_id } => {
                Ok(match self.orders.payment_failed(&session_id).await? {
                    Some(_) => "released",
                    None => "ignored",
                })
            }
            WebhookEvent::PaymentIntentSucceeded {
                order_id,
                session_id,
                amount,
            } => {
                if let Some(order_id) = order_id {
                    return match self.orders.confirm_payment(order_id, amount).await {
                        Ok(outcome) => Ok(label(Some(&outcome))),
                        Err(AppError::NotFound(_)) => {
                            tracing::warn!(order_id = %order_id, "Payment intent references an unknown order");
                            Ok("ignored")
                        }
                        Err(e) => Err(e),
                    };
                }
                match session_id {
                    Some(session_id) => {
                        let outcome = self.orders.confirm_session(&session_id, amount).await?;
                        Ok(label(outcome.as_ref()))
                    }
                    None => {
                        tracing::debug!("Payment intent carries no order reference");
                        Ok("ignored")
                    }
                }
            }
            WebhookEvent::Other(kind) => {
                tracing::warn!(kind = %kind, "Unhandled webhook event type");
                Ok("unhandled")
            }
        }
    }
}

fn label(outcome: Option<&ConfirmOutcome>) -> &'static str {
    match outcome {
        Some(ConfirmOutcome::Confirmed { .. }) => "confirmed",
        Some(ConfirmOutcome::AlreadyPaid(_)) => "duplicate",
        Some(ConfirmOutcome::NotPending(_)) | None => "ignored",
    }
}

#[cfg(test)]
pub(crate) fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
pub(crate) fn session_completed(session_id: &str, amount_total: i64) -> Vec<u8> {
    serde_json::json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": { "id": session_id, "amount_total": amount_total } }
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::orders::testing::harness;

    const SECRET: &str = "whsec_test_secret";

    fn adapter(service: OrderService, secret: Option<&str>, environment: Environment) -> WebhookAdapter {
        WebhookAdapter::new(service, secret.map(str::to_string), environment, 300)
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = b"{\"type\":\"ping\"}";
        let now = Utc::now().timestamp();
        let header = sign(payload, SECRET, now);
        assert!(verify_signature(payload, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn tampered_or_stale_payloads_are_rejected() {
        let payload = b"{\"type\":\"ping\"}";
        let now = Utc::now().timestamp();
        let header = sign(payload, SECRET, now);

        let err = verify_signature(b"{\"type\":\"pong\"}", &header, SECRET, 300, now).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
        assert!(verify_signature(payload, &header, "whsec_other", 300, now).is_err());
        assert!(verify_signature(payload, &header, SECRET, 300, now + 301).is_err());
        assert!(verify_signature(payload, "v1=abcd", SECRET, 300, now).is_err());
        assert!(verify_signature(payload, &format!("t={}", now), SECRET, 300, now).is_err());
    }

    #[test]
    fn any_matching_v1_signature_is_enough() {
        let payload = b"{}";
        let now = Utc::now().timestamp();
        let good = sign(payload, SECRET, now);
        let header = format!("t={},v1=00ff,{}", now, good.split(',').nth(1).unwrap());
        assert!(verify_signature(payload, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn events_are_normalised() {
        let order_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_1",
                "amount": 9900,
                "amount_received": 9900,
                "metadata": { "order_id": order_id.to_string() }
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            WebhookEvent::PaymentIntentSucceeded {
                order_id: Some(order_id),
                session_id: None,
                amount: Some(9900),
            }
        );

        let other = parse_event(br#"{"type":"charge.refunded","data":{"object":{}}}"#).unwrap();
        assert_eq!(other, WebhookEvent::Other("charge.refunded".into()));
        assert!(matches!(parse_event(b"not json"), Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn signed_completion_pays_once_across_redeliveries() {
        let h = harness();
        let order = h.checkout(None).await;
        let adapter = adapter(h.service.clone(), Some(SECRET), Environment::Production);

        let payload = session_completed(order.payment_session_id.as_deref().unwrap(), 9900);
        let header = sign(&payload, SECRET, Utc::now().timestamp());

        for _ in 0..2 {
            let ack = adapter.handle(&payload, Some(&header)).await.unwrap();
            assert!(ack.received);
        }
        let paid = h.order(order.id).await;
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.amount_paid, Some(9900));
        assert_eq!(h.stock().await, 4);
    }

    #[tokio::test]
    async fn bad_or_missing_signatures_never_reach_the_orders() {
        let h = harness();
        let order = h.checkout(None).await;
        let adapter = adapter(h.service.clone(), Some(SECRET), Environment::Production);
        let payload = session_completed(order.payment_session_id.as_deref().unwrap(), 9900);

        let forged = sign(&payload, "whsec_attacker", Utc::now().timestamp());
        let err = adapter.handle(&payload, Some(&forged)).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let err = adapter.handle(&payload, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
        assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn missing_secret_fails_closed_in_production_only() {
        let h = harness();
        let order = h.checkout(None).await;
        let payload = session_completed(order.payment_session_id.as_deref().unwrap(), 9900);

        let prod = adapter(h.service.clone(), None, Environment::Production);
        let err = prod.handle(&payload, Some("t=1,v1=00")).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
        assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);

        let dev = adapter(h.service.clone(), None, Environment::Development);
        dev.handle(&payload, Some("unverified")).await.unwrap();
        assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn unknown_kinds_and_sessions_are_acknowledged() {
        let h = harness();
        let adapter = adapter(h.service.clone(), Some(SECRET), Environment::Production);
        let now = Utc::now().timestamp();

        let payload = br#"{"type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        let ack = adapter.handle(payload, Some(&sign(payload, SECRET, now))).await.unwrap();
        assert!(ack.received);

        let payload = session_completed("cs_unknown", 100);
        assert!(adapter.handle(&payload, Some(&sign(&payload, SECRET, now))).await.is_ok());
    }

    #[tokio::test]
    async fn async_failure_and_intent_events_dispatch() {
        let h = harness();
        let adapter = adapter(h.service.clone(), Some(SECRET), Environment::Production);
        let now = Utc::now().timestamp();

        let failed = h.checkout(None).await;
        let payload = serde_json::json!({
            "type": "checkout.session.async_payment_failed",
            "data": { "object": { "id": failed.payment_session_id.clone().unwrap() } }
        })
        .to_string();
        adapter
            .handle(payload.as_bytes(), Some(&sign(payload.as_bytes(), SECRET, now)))
            .await
            .unwrap();
        let failed = h.order(failed.id).await;
        assert!(failed.payment_session_id.is_none());
        assert!(failed.reserved_at.is_none());

        let paid = h.checkout(None).await;
        let payload = serde_json::json!({
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_2",
                "amount_received": 9900,
                "metadata": { "order_id": paid.id.to_string() }
            }}
        })
        .to_string();
        adapter
            .handle(payload.as_bytes(), Some(&sign(payload.as_bytes(), SECRET, now)))
            .await
            .unwrap();
        assert_eq!(h.order(paid.id).await.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn store_failures_ask_for_redelivery() {
        let h = harness();
        let order = h.checkout(None).await;
        let adapter = adapter(h.service.clone(), Some(SECRET), Environment::Production);
        let payload = session_completed(order.payment_session_id.as_deref().unwrap(), 9900);
        let header = sign(&payload, SECRET, Utc::now().timestamp());

        h.store.set_offline(true);
        let err = adapter.handle(&payload, Some(&header)).await.unwrap_err();
        assert!(err.status().is_server_error());

        h.store.set_offline(false);
        adapter.handle(&payload, Some(&header)).await.unwrap();
        assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    }
}
