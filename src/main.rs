// =============================================================================
// STOREFRONT SERVICE - Main Entry Point
// =============================================================================
// This is the main entry point for the single-product storefront backend.
//
// WHAT THIS SERVICE DOES:
// - Creates orders and payment sessions at checkout
// - Reconciles payments from signed processor webhooks
// - Keeps the stock ledger, advisory reservations and coupon usage
// - Serves the admin back office (orders, inventory, coupons, audiences)
// - Exposes Prometheus metrics for observability
//
// LEARNING GOALS:
// - Wire services behind trait objects so backends can be swapped
// - Run a background task (reservation sweeper) next to the HTTP server
// - Test the whole router in-process with `tower::ServiceExt::oneshot`
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod addresses;   // Saved shipping addresses
mod audience;    // Waitlist and newsletter
mod auth;        // Buyer/admin identity extractors
mod cache;       // Optional Redis stock cache
mod config;      // Configuration loading
mod coupon;      // Coupon validation and admin CRUD
mod db;          // PostgreSQL store
mod error;       // Error types
mod handlers;    // HTTP request handlers
mod ledger;      // Stock ledger
mod memory;      // In-process store
mod metrics;     // Prometheus metrics
mod models;      // Data structures
mod notify;      // Transactional email
mod orders;      // Order state machine
mod payment;     // Payment processor client
mod reservation; // Advisory stock holds
mod store;       // Persistence trait
mod webhook;     // Processor webhook adapter

// -----------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::addresses::AddressBook;
use crate::audience::AudienceService;
use crate::auth::AdminAuth;
use crate::cache::StockCache;
use crate::config::Config;
use crate::coupon::CouponService;
use crate::db::Database;
use crate::ledger::StockLedger;
use crate::memory::MemoryStore;
use crate::metrics::setup_metrics;
use crate::notify::{LogMailer, Mailer, Notifier};
use crate::orders::OrderService;
use crate::payment::{MockGateway, PaymentGateway, StripeGateway};
use crate::reservation::ReservationManager;
use crate::store::Store;
use crate::webhook::WebhookAdapter;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Every service shares the same store handle; cloning a service clones Arcs.
//
// LEARNING NOTE:
// Handlers receive `State<Arc<AppState>>`. Services hold `Arc<dyn Store>`, so
// tests build the same state over `MemoryStore` and the mock processor.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: StockCache,
    pub ledger: StockLedger,
    pub reservations: ReservationManager,
    pub coupons: CouponService,
    pub orders: OrderService,
    pub webhooks: WebhookAdapter,
    pub audience: AudienceService,
    pub addresses: AddressBook,
    pub admin: AdminAuth,

    // Expose underlying error text in responses (non-production only)
    pub diagnostics: bool,

    // Used to render metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        cache: StockCache,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
        metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        let ttl = chrono::Duration::minutes(config.reservation_ttl_minutes);
        let diagnostics = !config.environment.is_production();
        let notifier = Notifier::new(
            mailer,
            config.email_sender.clone(),
            config.product.name.clone(),
        );

        let ledger = StockLedger::new(store.clone(), cache.clone(), config.product.clone(), ttl)
            .with_diagnostics(diagnostics);
        let reservations = ReservationManager::new(store.clone(), ttl);
        let coupons = CouponService::new(store.clone());
        let orders = OrderService::new(
            store.clone(),
            ledger.clone(),
            reservations.clone(),
            coupons.clone(),
            gateway,
            notifier.clone(),
            config.clone(),
        );
        let webhooks = WebhookAdapter::from_config(orders.clone(), &config);
        let audience = AudienceService::new(store.clone(), ledger.clone(), notifier);
        let addresses = AddressBook::new(store.clone());
        let admin = AdminAuth::from_config(&config);

        Self {
            store,
            cache,
            ledger,
            reservations,
            coupons,
            orders,
            webhooks,
            audience,
            addresses,
            admin,
            diagnostics,
            metrics_handle,
        }
    }
}

// -----------------------------------------------------------------------------
// ROUTES
// -----------------------------------------------------------------------------
// LEARNING NOTE:
// Admin routes sit under the same router; the `AdminSession` extractor in
// each handler is what guards them.
pub fn app(state: Arc<AppState>) -> Router {
    let diagnostics = state.diagnostics;

    Router::new()
        // ----- Health, Readiness & Metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Storefront API -----
        .route("/api/v1/inventory", get(handlers::get_stock))
        .route("/api/v1/inventory/check", get(handlers::check_stock))
        .route("/api/v1/checkout", post(handlers::create_checkout))
        .route("/api/v1/orders", get(handlers::list_my_orders))
        .route(
            "/api/v1/orders/:id",
            get(handlers::get_my_order).delete(handlers::delete_my_order),
        )
        .route("/api/v1/orders/:id/cancel", post(handlers::cancel_my_order))
        .route("/api/v1/orders/:id/retry-payment", post(handlers::retry_payment))
        .route("/api/v1/webhooks/stripe", post(handlers::payment_webhook))
        .route("/api/v1/coupons/validate", post(handlers::validate_coupon))
        .route("/api/v1/waitlist", post(handlers::join_waitlist))
        .route("/api/v1/newsletter/subscribe", post(handlers::subscribe))
        .route("/api/v1/newsletter/unsubscribe", post(handlers::unsubscribe))
        .route(
            "/api/v1/addresses",
            get(handlers::list_addresses).post(handlers::create_address),
        )
        .route(
            "/api/v1/addresses/:id",
            put(handlers::update_address).delete(handlers::delete_address),
        )

        // ----- Admin API -----
        .route("/api/v1/admin/login", post(handlers::admin_login))
        .route("/api/v1/admin/logout", post(handlers::admin_logout))
        .route("/api/v1/admin/orders", get(handlers::admin_list_orders))
        .route("/api/v1/admin/orders/:id", get(handlers::admin_get_order))
        .route("/api/v1/admin/orders/:id/cancel", post(handlers::admin_cancel_order))
        .route(
            "/api/v1/admin/orders/:id/tracking",
            post(handlers::admin_update_tracking),
        )
        .route(
            "/api/v1/admin/inventory",
            get(handlers::admin_get_inventory).put(handlers::admin_update_inventory),
        )
        .route(
            "/api/v1/admin/inventory/adjust",
            post(handlers::admin_adjust_inventory),
        )
        .route(
            "/api/v1/admin/coupons",
            get(handlers::admin_list_coupons).post(handlers::admin_create_coupon),
        )
        .route(
            "/api/v1/admin/coupons/:id",
            put(handlers::admin_update_coupon).delete(handlers::admin_delete_coupon),
        )
        .route("/api/v1/admin/waitlist", get(handlers::admin_list_waitlist))
        .route("/api/v1/admin/waitlist/notify", post(handlers::admin_notify_waitlist))
        .route("/api/v1/admin/newsletter", get(handlers::admin_list_subscribers))
        .route(
            "/api/v1/admin/reservations/sweep",
            post(handlers::admin_sweep_reservations),
        )

        // ----- Middleware Layers -----
        .layer(middleware::from_fn_with_state(diagnostics, error::attach_details))
        .layer(middleware::from_fn(metrics::track_http))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // Example: RUST_LOG=info,storefront_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,storefront_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Storefront Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Arc::new(Config::from_env()?);
    info!(
        port = config.port,
        environment = ?config.environment,
        product_id = %config.product.id,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Select the store
    // -------------------------------------------------------------------------
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            info!("Connected to PostgreSQL");
            db.run_migrations().await?;
            info!("Database migrations completed");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store (data is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis (optional)
    // -------------------------------------------------------------------------
    let cache = match &config.redis_url {
        Some(url) => match connect_redis(url).await {
            Ok(conn) => {
                info!("Connected to Redis");
                StockCache::new(Some(conn))
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, stock cache disabled");
                StockCache::disabled()
            }
        },
        None => StockCache::disabled(),
    };
    info!(enabled = cache.is_enabled(), "Stock cache configured");

    // -------------------------------------------------------------------------
    // STEP 7: Payment processor and mail transport
    // -------------------------------------------------------------------------
    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_secret_key {
        Some(key) => Arc::new(StripeGateway::new(key.clone(), config.stripe_api_base.clone())),
        None => {
            warn!("STRIPE_SECRET_KEY not set, using the mock payment processor");
            Arc::new(MockGateway::new(&config.public_base_url))
        }
    };
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);

    // -------------------------------------------------------------------------
    // STEP 8: Create application state and start the sweeper
    // -------------------------------------------------------------------------
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        cache,
        gateway,
        mailer,
        metrics_handle,
    ));

    let sweep_every = StdDuration::from_secs(config.sweep_interval_secs.max(1));
    Arc::new(state.reservations.clone()).spawn_sweeper(sweep_every);
    info!(interval_secs = sweep_every.as_secs(), "Reservation sweeper started");

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Storefront Service is listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(redis::aio::ConnectionManager::new(client).await?)
}
