// =============================================================================
// HANDLERS MODULE
// =============================================================================
// Thin HTTP layer over the storefront services.
//
// LEARNING NOTES:
// - Handlers only extract, delegate and wrap; every rule lives in a service
// - Identity comes from extractors: `Buyer` (x-user-id header) and
//   `AdminSession` (admin cookie). A handler that names one cannot run
//   without it
// - Errors are `AppError` and render themselves (see error.rs)
//
// AXUM EXTRACTORS USED HERE:
// - State<T>: shared application state
// - Path<T>: path parameters (/orders/:id → id)
// - Query<T>: query parameters (?status=paid)
// - Json<T>: JSON request body
// - Bytes + HeaderMap: raw webhook body and signature header
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use uuid::Uuid;

use crate::audience::{NotifyResponse, SubscriptionResponse};
use crate::auth::{AdminSession, Buyer, MaybeBuyer};
use crate::coupon::CouponValidation;
use crate::error::AppResult;
use crate::models::*;
use crate::store::Store;
use crate::webhook::WebhookAck;
use crate::AppState;

/// Header carrying the processor's webhook signature
const SIGNATURE_HEADER: &str = "stripe-signature";

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "storefront-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: the store must answer; the cache only if one is configured.
///
/// GET /ready
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = state.store.ping().await.is_ok();
    let redis = state.cache.ping().await;

    let ready = database && redis != Some(false);
    let response = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        checks: ReadinessChecks { database, redis },
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics in text exposition format
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// INVENTORY
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct StockCheckParams {
    pub product_id: Option<String>,

    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

/// Buyer-facing availability. Always 200; reports in stock on failure.
///
/// GET /api/v1/inventory/check?product_id=clock-default&quantity=1
pub async fn check_stock(
    State(state): State<Arc<AppState>>,
    params: Option<Query<StockCheckParams>>,
) -> Json<StockCheckResponse> {
    let (product_id, quantity) = match &params {
        Some(Query(p)) => (p.product_id.as_deref(), p.quantity),
        None => (None, 1),
    };
    Json(state.ledger.stock_check(product_id, quantity).await)
}

/// GET /api/v1/inventory
pub async fn get_stock(State(state): State<Arc<AppState>>) -> AppResult<Json<StockLevel>> {
    let level = state.ledger.get_stock(state.ledger.default_product_id()).await?;
    Ok(Json(level))
}

// =============================================================================
// CHECKOUT & BUYER ORDERS
// =============================================================================

/// POST /api/v1/checkout
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<CheckoutResponse>)> {
    let response = state.orders.create_checkout(buyer.id(), request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/orders
pub async fn list_my_orders(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
) -> AppResult<Json<Vec<Order>>> {
    let filter = OrderFilter {
        buyer_id: Some(buyer.0),
        status: None,
    };
    Ok(Json(state.orders.list_orders(&filter).await?))
}

/// GET /api/v1/orders/:id
pub async fn get_my_order(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.orders.get_order(order_id, Some(buyer.id())).await?))
}

/// POST /api/v1/orders/:id/cancel
pub async fn cancel_my_order(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(order_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> AppResult<Json<CancelResponse>> {
    let reason = body.and_then(|Json(b)| b.reason);
    let response = state
        .orders
        .cancel_order(order_id, Some(buyer.id()), reason)
        .await?;
    Ok(Json(response))
}

/// DELETE /api/v1/orders/:id
pub async fn delete_my_order(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(order_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.orders.delete_order(order_id, buyer.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/orders/:id/retry-payment
pub async fn retry_payment(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<CheckoutResponse>> {
    Ok(Json(state.orders.retry_payment(order_id, buyer.id()).await?))
}

// =============================================================================
// PAYMENT WEBHOOK
// =============================================================================

/// POST /api/v1/webhooks/stripe
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    Ok(Json(state.webhooks.handle(&body, signature).await?))
}

// =============================================================================
// COUPONS
// =============================================================================

/// POST /api/v1/coupons/validate
pub async fn validate_coupon(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CouponValidationRequest>,
) -> AppResult<Json<CouponValidation>> {
    let result = state
        .coupons
        .validate(&request.code, request.order_amount)
        .await?;
    Ok(Json(result))
}

// =============================================================================
// WAITLIST & NEWSLETTER
// =============================================================================

/// POST /api/v1/waitlist
pub async fn join_waitlist(
    State(state): State<Arc<AppState>>,
    MaybeBuyer(buyer): MaybeBuyer,
    Json(request): Json<EmailRequest>,
) -> AppResult<(StatusCode, Json<WaitlistEntry>)> {
    let entry = state
        .audience
        .join_waitlist(&request.email, buyer.as_ref().map(Buyer::id))
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// POST /api/v1/newsletter/subscribe
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmailRequest>,
) -> AppResult<Json<SubscriptionResponse>> {
    Ok(Json(state.audience.subscribe(&request.email).await?))
}

/// POST /api/v1/newsletter/unsubscribe
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmailRequest>,
) -> AppResult<Json<Subscriber>> {
    Ok(Json(state.audience.unsubscribe(&request.email).await?))
}

// =============================================================================
// SAVED ADDRESSES
// =============================================================================

/// GET /api/v1/addresses
pub async fn list_addresses(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
) -> AppResult<Json<Vec<SavedAddress>>> {
    Ok(Json(state.addresses.list(buyer.id()).await?))
}

/// POST /api/v1/addresses
pub async fn create_address(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Json(input): Json<AddressInput>,
) -> AppResult<(StatusCode, Json<SavedAddress>)> {
    let address = state.addresses.create(buyer.id(), input).await?;
    Ok((StatusCode::CREATED, Json(address)))
}

/// PUT /api/v1/addresses/:id
pub async fn update_address(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(address_id): Path<Uuid>,
    Json(input): Json<AddressInput>,
) -> AppResult<Json<SavedAddress>> {
    Ok(Json(state.addresses.update(buyer.id(), address_id, input).await?))
}

/// DELETE /api/v1/addresses/:id
pub async fn delete_address(
    State(state): State<Arc<AppState>>,
    buyer: Buyer,
    Path(address_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.addresses.delete(buyer.id(), address_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// ADMIN SESSION
// =============================================================================

/// POST /api/v1/admin/login
pub async fn admin_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<AdminLoginRequest>,
) -> AppResult<(CookieJar, Json<serde_json::Value>)> {
    let jar = state.admin.login(jar, &request)?;
    Ok((jar, Json(serde_json::json!({ "success": true }))))
}

/// POST /api/v1/admin/logout
pub async fn admin_logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    (state.admin.logout(jar), StatusCode::NO_CONTENT)
}

// =============================================================================
// ADMIN BACK OFFICE
// =============================================================================

/// GET /api/v1/admin/orders?status=paid&buyer_id=...
pub async fn admin_list_orders(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Query(filter): Query<OrderFilter>,
) -> AppResult<Json<Vec<Order>>> {
    Ok(Json(state.orders.list_orders(&filter).await?))
}

/// GET /api/v1/admin/orders/:id
pub async fn admin_get_order(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.orders.get_order(order_id, None).await?))
}

/// POST /api/v1/admin/orders/:id/cancel
pub async fn admin_cancel_order(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(order_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> AppResult<Json<CancelResponse>> {
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.orders.cancel_order(order_id, None, reason).await?))
}

/// POST /api/v1/admin/orders/:id/tracking
pub async fn admin_update_tracking(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(order_id): Path<Uuid>,
    Json(request): Json<TrackingRequest>,
) -> AppResult<Json<Order>> {
    let order = state
        .orders
        .update_tracking(order_id, &request.tracking_number)
        .await?;
    Ok(Json(order))
}

/// GET /api/v1/admin/inventory
pub async fn admin_get_inventory(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
) -> AppResult<Json<StockLevel>> {
    let level = state.ledger.get_stock(state.ledger.default_product_id()).await?;
    Ok(Json(level))
}

/// PUT /api/v1/admin/inventory
pub async fn admin_update_inventory(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Json(update): Json<InventoryUpdate>,
) -> AppResult<Json<StockLevel>> {
    let product_id = state.ledger.default_product_id().to_string();
    Ok(Json(state.ledger.update(&product_id, &update).await?))
}

/// POST /api/v1/admin/inventory/adjust
pub async fn admin_adjust_inventory(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Json(adjustment): Json<StockAdjustment>,
) -> AppResult<Json<StockLevel>> {
    let product_id = state.ledger.default_product_id().to_string();
    Ok(Json(state.ledger.adjust(&product_id, adjustment.quantity).await?))
}

/// GET /api/v1/admin/coupons
pub async fn admin_list_coupons(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
) -> AppResult<Json<Vec<Coupon>>> {
    Ok(Json(state.coupons.list().await?))
}

/// POST /api/v1/admin/coupons
pub async fn admin_create_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Json(input): Json<NewCoupon>,
) -> AppResult<(StatusCode, Json<Coupon>)> {
    let coupon = state.coupons.create(input).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

/// PUT /api/v1/admin/coupons/:id
pub async fn admin_update_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(coupon_id): Path<Uuid>,
    Json(update): Json<CouponUpdate>,
) -> AppResult<Json<Coupon>> {
    Ok(Json(state.coupons.update(coupon_id, update).await?))
}

/// DELETE /api/v1/admin/coupons/:id
pub async fn admin_delete_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Path(coupon_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.coupons.delete(coupon_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/admin/waitlist
pub async fn admin_list_waitlist(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
) -> AppResult<Json<Vec<WaitlistEntry>>> {
    Ok(Json(state.audience.list_waitlist().await?))
}

/// POST /api/v1/admin/waitlist/notify
pub async fn admin_notify_waitlist(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
) -> AppResult<Json<NotifyResponse>> {
    let notified = state.audience.notify_waitlist().await?;
    Ok(Json(NotifyResponse { notified }))
}

#[derive(Debug, Deserialize)]
pub struct SubscriberParams {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /api/v1/admin/newsletter?include_inactive=true
pub async fn admin_list_subscribers(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
    Query(params): Query<SubscriberParams>,
) -> AppResult<Json<Vec<Subscriber>>> {
    let subscribers = state
        .audience
        .list_subscribers(!params.include_inactive)
        .await?;
    Ok(Json(subscribers))
}

/// Release every expired advisory hold now.
///
/// POST /api/v1/admin/reservations/sweep
pub async fn admin_sweep_reservations(
    State(state): State<Arc<AppState>>,
    _admin: AdminSession,
) -> AppResult<Json<SweepResponse>> {
    let released = state.reservations.sweep_expired().await?;
    Ok(Json(SweepResponse { released }))
}

// =============================================================================
// ROUTER TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_token, ADMIN_SESSION_COOKIE, BUYER_HEADER};
    use crate::memory::MemoryStore;
    use crate::notify::testing::RecordingMailer;
    use crate::payment::MockGateway;
    use crate::webhook::{session_completed, sign};
    use crate::{app, config::Config};

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
        Router,
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_router_test";

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
    }

    fn test_app() -> TestApp {
        test_app_with(&[])
    }

    fn test_app_with(overrides: &[(&str, &str)]) -> TestApp {
        let vars: HashMap<String, String> = [
            ("PRODUCT_PRICE", "9900"),
            ("DEFAULT_STOCK", "5"),
            ("STRIPE_WEBHOOK_SECRET", SECRET),
            ("ADMIN_USERNAME", "admin"),
            ("ADMIN_PASSWORD", "hunter2"),
        ]
        .iter()
        .chain(overrides)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = Arc::new(Config::from_map(&vars).unwrap());
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(
            config.clone(),
            store.clone(),
            crate::cache::StockCache::disabled(),
            Arc::new(MockGateway::new(&config.public_base_url)),
            Arc::new(RecordingMailer::default()),
            PrometheusBuilder::new().build_recorder().handle(),
        );
        TestApp {
            router: app(Arc::new(state)),
            store,
        }
    }

    fn admin_cookie() -> String {
        format!("{}={}", ADMIN_SESSION_COOKIE, generate_token())
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(BUYER_HEADER, "user_1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn checkout_body() -> serde_json::Value {
        serde_json::json!({
            "shipping_name": "Ada Lovelace",
            "shipping_phone": "555-0100",
            "shipping_email": "ada@example.com",
            "shipping_address": "1 Infinite Loop",
            "shipping_city": "Cupertino",
            "shipping_state": "CA",
            "shipping_zip": "95014",
            "shipping_country": "US"
        })
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        app.store.set_offline(true);
        let response = app
            .router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stock_check_answers_200_even_when_the_store_is_down() {
        let app = test_app();
        app.store.set_offline(true);
        let response = app
            .router
            .oneshot(
                Request::get("/api/v1/inventory/check?quantity=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["in_stock"], true);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn production_hides_underlying_error_text() {
        let production = [
            ("APP_ENV", "production"),
            ("DATABASE_URL", "postgres://localhost/shop"),
            ("STRIPE_SECRET_KEY", "sk_test_router"),
        ];
        let development: [(&str, &str); 0] = [];
        for (overrides, detailed) in [(&development[..], true), (&production[..], false)] {
            let app = test_app_with(overrides);
            app.store.set_offline(true);

            let response = app
                .router
                .clone()
                .oneshot(
                    Request::get("/api/v1/orders")
                        .header(BUYER_HEADER, "user_1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = read_json(response).await;
            assert_eq!(body["error"], "INTERNAL_ERROR");
            assert_eq!(body["message"], "An internal error occurred");
            assert_eq!(body.get("details").is_some(), detailed);

            let response = app
                .router
                .oneshot(Request::get("/api/v1/inventory/check").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let body = read_json(response).await;
            assert_eq!(body["in_stock"], true);
            assert_eq!(body["error"].is_string(), detailed);
        }
    }

    #[tokio::test]
    async fn checkout_then_signed_webhook_pays_the_order() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(json_request("POST", "/api/v1/checkout", checkout_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        let order_id: Uuid = body["order_id"].as_str().unwrap().parse().unwrap();

        let order = app.store.get_order(order_id).await.unwrap().unwrap();
        let payload = session_completed(order.payment_session_id.as_deref().unwrap(), 9900);
        let signature = sign(&payload, SECRET, chrono::Utc::now().timestamp());
        let webhook = || {
            Request::post("/api/v1/webhooks/stripe")
                .header("stripe-signature", signature.clone())
                .body(Body::from(payload.clone()))
                .unwrap()
        };

        for _ in 0..2 {
            let response = app.router.clone().oneshot(webhook()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(read_json(response).await["received"], true);
        }
        let order = app.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(app.store.get_product("clock-default").await.unwrap().unwrap().stock, 4);

        let response = app
            .router
            .oneshot(json_request(
                "POST",
                &format!("/api/v1/orders/{}/retry-payment", order_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(response).await["error"], "ALREADY_PAID");
    }

    #[tokio::test]
    async fn unsigned_webhook_is_a_bad_request() {
        let app = test_app();
        let response = app
            .router
            .oneshot(
                Request::post("/api/v1/webhooks/stripe")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["error"], "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn buyer_routes_require_identity() {
        let app = test_app();
        let response = app
            .router
            .oneshot(
                Request::post("/api/v1/checkout")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(checkout_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_require_a_session_cookie() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/api/v1/admin/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .router
            .clone()
            .oneshot(
                Request::post("/api/v1/admin/reservations/sweep")
                    .header(header::COOKIE, admin_cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["released"], 0);

        let response = app
            .router
            .oneshot(
                Request::get("/api/v1/admin/orders?status=paid")
                    .header(header::COOKIE, admin_cookie())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_login_sets_the_session_cookie() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/admin/login",
                serde_json::json!({ "username": "admin", "password": "hunter2" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("admin_session="));
        assert!(cookie.contains("HttpOnly"));

        let response = app
            .router
            .oneshot(json_request(
                "POST",
                "/api/v1/admin/login",
                serde_json::json!({ "username": "admin", "password": "nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn coupon_validation_endpoint() {
        let app = test_app();
        let response = app
            .router
            .oneshot(json_request(
                "POST",
                "/api/v1/coupons/validate",
                serde_json::json!({ "code": "missing", "order_amount": 9900 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["valid"], false);
        assert_eq!(body["error"], "Invalid coupon code");
    }
}
