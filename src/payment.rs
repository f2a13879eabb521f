// =============================================================================
// PAYMENT PROCESSOR CLIENT
// =============================================================================
// Contract for the hosted-checkout payment processor plus two
// implementations:
// - StripeGateway: form-encoded REST calls with reqwest
// - MockGateway:   in-process sessions for local development and tests
//
// Calls are never retried here. A failure surfaces as UpstreamError and the
// buyer or admin decides whether to try again.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;

// -----------------------------------------------------------------------------
// REQUEST / RESPONSE TYPES
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub order_id: Uuid,
    pub buyer_id: String,
    /// Amount to charge, already coupon-adjusted
    pub amount: i64,
    pub currency: String,
    pub product_name: String,
    pub quantity: i32,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Complete,
    Expired,
}

/// Remote view of a checkout session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    /// payment_status == "paid"
    pub paid: bool,
    pub amount_total: Option<i64>,
    pub payment_intent: Option<String>,
}

impl SessionSnapshot {
    pub fn is_settled(&self) -> bool {
        self.status == SessionStatus::Complete || self.paid
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_intent: String,
    pub amount: i64,
    pub order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
}

/// Hosted-checkout payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(&self, request: &CheckoutSessionRequest)
        -> AppResult<CheckoutSession>;

    async fn retrieve_session(&self, session_id: &str) -> AppResult<SessionSnapshot>;

    async fn refund(&self, request: &RefundRequest) -> AppResult<Refund>;
}

// =============================================================================
// STRIPE
// =============================================================================

#[derive(Clone)]
pub struct StripeGateway {
    http_client: Client,
    secret_key: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
    status: Option<SessionStatus>,
    payment_status: Option<String>,
    amount_total: Option<i64>,
    payment_intent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
}

impl StripeGateway {
    pub fn new(secret_key: String, api_base: String) -> Self {
        Self {
            http_client: Client::new(),
            secret_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn session_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
        let order_id = request.order_id.to_string();
        let name = if request.quantity > 1 {
            format!("{} x {}", request.product_name, request.quantity)
        } else {
            request.product_name.clone()
        };

        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("payment_method_types[0]".to_string(), "card".to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            (
                "line_items[0][price_data][currency]".to_string(),
                request.currency.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                request.amount.to_string(),
            ),
            ("line_items[0][price_data][product_data][name]".to_string(), name),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("customer_email".to_string(), request.customer_email.clone()),
            ("client_reference_id".to_string(), order_id.clone()),
            ("metadata[order_id]".to_string(), order_id.clone()),
            ("metadata[buyer_id]".to_string(), request.buyer_id.clone()),
            (
                "payment_intent_data[metadata][order_id]".to_string(),
                order_id,
            ),
        ];
        if let Some(code) = &request.coupon_code {
            form.push(("metadata[coupon_code]".to_string(), code.clone()));
        }
        form
    }

    /// Turns a non-2xx processor response into an UpstreamError.
    async fn read<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> AppResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(operation, status = %status, body = %body, "Payment processor call failed");
            return Err(AppError::Upstream(format!(
                "{} returned {}: {}",
                operation, status, body
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AppError::Upstream(format!("{} returned an unexpected shape: {}", operation, e)))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> AppResult<CheckoutSession> {
        let start = Instant::now();
        let result: AppResult<CheckoutSession> = async {
            let response = self
                .http_client
                .post(format!("{}/v1/checkout/sessions", self.api_base))
                .basic_auth(&self.secret_key, None::<&str>)
                .form(&Self::session_form(request))
                .send()
                .await?;
            let session: StripeSession = Self::read("create_session", response).await?;
            let url = session.url.ok_or_else(|| {
                AppError::Upstream("create_session returned no redirect url".to_string())
            })?;
            Ok(CheckoutSession {
                id: session.id,
                url,
            })
        }
        .await;
        metrics::record_payment_call("create_session", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn retrieve_session(&self, session_id: &str) -> AppResult<SessionSnapshot> {
        let start = Instant::now();
        let result: AppResult<SessionSnapshot> = async {
            let response = self
                .http_client
                .get(format!("{}/v1/checkout/sessions/{}", self.api_base, session_id))
                .basic_auth(&self.secret_key, None::<&str>)
                .send()
                .await?;
            let session: StripeSession = Self::read("retrieve_session", response).await?;
            let status = session.status.ok_or_else(|| {
                AppError::Upstream("retrieve_session returned no status".to_string())
            })?;
            Ok(SessionSnapshot {
                id: session.id,
                status,
                paid: session.payment_status.as_deref() == Some("paid"),
                amount_total: session.amount_total,
                payment_intent: session.payment_intent,
            })
        }
        .await;
        metrics::record_payment_call("retrieve_session", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn refund(&self, request: &RefundRequest) -> AppResult<Refund> {
        let start = Instant::now();
        let reason = if request.reason.to_lowercase().contains("fraud") {
            "fraudulent"
        } else {
            "requested_by_customer"
        };
        let form = [
            ("payment_intent", request.payment_intent.clone()),
            ("amount", request.amount.to_string()),
            ("reason", reason.to_string()),
            ("metadata[order_id]", request.order_id.to_string()),
            ("metadata[reason]", request.reason.clone()),
        ];
        let result: AppResult<Refund> = async {
            let response = self
                .http_client
                .post(format!("{}/v1/refunds", self.api_base))
                .basic_auth(&self.secret_key, None::<&str>)
                .form(&form)
                .send()
                .await?;
            let refund: StripeRefund = Self::read("refund", response).await?;
            Ok(Refund {
                id: refund.id,
                amount: refund.amount,
            })
        }
        .await;
        metrics::record_payment_call("refund", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }
}

// =============================================================================
// MOCK
// =============================================================================

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, SessionSnapshot>,
    created: Vec<CheckoutSessionRequest>,
    refunds: Vec<RefundRequest>,
    fail_refunds: bool,
    fail_sessions: bool,
}

/// Processor stand-in: sessions stay `open` until scripted otherwise.
pub struct MockGateway {
    base_url: String,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(MockState::default()),
        }
    }
}

#[cfg(test)]
impl MockGateway {
    pub fn set_session(&self, session_id: &str, status: SessionStatus, paid: bool) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.status = status;
            session.paid = paid;
        }
    }

    pub fn forget_session(&self, session_id: &str) {
        self.state.lock().sessions.remove(session_id);
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.state.lock().fail_refunds = fail;
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.state.lock().fail_sessions = fail;
    }

    pub fn created(&self) -> Vec<CheckoutSessionRequest> {
        self.state.lock().created.clone()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.state.lock().refunds.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> AppResult<CheckoutSession> {
        let mut state = self.state.lock();
        if state.fail_sessions {
            return Err(AppError::Upstream("mock processor unavailable".to_string()));
        }
        let id = format!("cs_mock_{}", Uuid::new_v4().simple());
        state.sessions.insert(
            id.clone(),
            SessionSnapshot {
                id: id.clone(),
                status: SessionStatus::Open,
                paid: false,
                amount_total: Some(request.amount),
                payment_intent: Some(format!("pi_mock_{}", request.order_id.simple())),
            },
        );
        state.created.push(request.clone());
        tracing::debug!(session_id = %id, order_id = %request.order_id, "Mock checkout session created");
        Ok(CheckoutSession {
            url: format!("{}/mock-checkout/{}", self.base_url, id),
            id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> AppResult<SessionSnapshot> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::Upstream(format!("No such checkout session: {}", session_id)))
    }

    async fn refund(&self, request: &RefundRequest) -> AppResult<Refund> {
        let mut state = self.state.lock();
        if state.fail_refunds {
            return Err(AppError::Upstream("charge already refunded".to_string()));
        }
        state.refunds.push(request.clone());
        Ok(Refund {
            id: format!("re_mock_{}", Uuid::new_v4().simple()),
            amount: request.amount,
        })
    }
}
