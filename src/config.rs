// =============================================================================
// CONFIGURATION MODULE
// =============================================================================
// Loads configuration from environment variables once at startup. The
// resulting Config is shared behind Arc and handed to every component that
// needs it; nothing reads the environment after this point.
// =============================================================================

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;

/// Deployment environment; gates unsafe development conveniences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" | "test" | "local" => Ok(Environment::Development),
            other => bail!("Unknown APP_ENV '{}'", other),
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Product sold by the storefront, used to seed the ledger row.
#[derive(Debug, Clone)]
pub struct ProductConfig {
    pub id: String,
    pub name: String,
    pub sku: String,
    /// Unit price in minor units
    pub price: i64,
    pub currency: String,
    pub default_stock: i32,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 8002)
    pub port: u16,

    pub environment: Environment,

    /// PostgreSQL connection URL; None selects the in-memory store
    pub database_url: Option<String>,

    /// Redis connection URL for the stock cache
    pub redis_url: Option<String>,

    /// Processor API key; None selects the mock processor
    pub stripe_secret_key: Option<String>,

    /// Webhook signing secret
    pub stripe_webhook_secret: Option<String>,

    pub stripe_api_base: String,

    /// Base URL for success/cancel redirects
    pub public_base_url: String,

    pub product: ProductConfig,

    pub reservation_ttl_minutes: i64,
    pub sweep_interval_secs: u64,

    pub admin_username: Option<String>,
    pub admin_password: Option<String>,

    pub email_sender: String,

    /// Allowed skew between a signed webhook timestamp and now
    pub webhook_tolerance_secs: i64,
}

impl Config {
    /// Creates a Config by reading the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a Config from an explicit key/value map.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let or_default = |key: &str, default: &str| non_empty(key).unwrap_or_else(|| default.to_string());

        let environment = Environment::parse(&or_default("APP_ENV", "development"))?;

        let config = Self {
            port: or_default("PORT", "8002")
                .parse()
                .context("Failed to parse PORT as a number")?,
            environment,
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            stripe_secret_key: non_empty("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET"),
            stripe_api_base: or_default("STRIPE_API_BASE", "https://api.stripe.com"),
            public_base_url: or_default("PUBLIC_BASE_URL", "http://localhost:3000"),
            product: ProductConfig {
                id: or_default("PRODUCT_ID", "clock-default"),
                name: or_default("PRODUCT_NAME", "Retro Desktop Clock"),
                sku: or_default("PRODUCT_SKU", "CLOCK-001"),
                price: or_default("PRODUCT_PRICE", "29900")
                    .parse()
                    .context("Failed to parse PRODUCT_PRICE as minor units")?,
                currency: or_default("PRODUCT_CURRENCY", "usd").to_ascii_lowercase(),
                default_stock: or_default("DEFAULT_STOCK", "100")
                    .parse()
                    .context("Failed to parse DEFAULT_STOCK")?,
            },
            reservation_ttl_minutes: or_default("RESERVATION_TTL_MINUTES", "30")
                .parse()
                .context("Failed to parse RESERVATION_TTL_MINUTES")?,
            sweep_interval_secs: or_default("SWEEP_INTERVAL_SECS", "300")
                .parse()
                .context("Failed to parse SWEEP_INTERVAL_SECS")?,
            admin_username: non_empty("ADMIN_USERNAME"),
            admin_password: non_empty("ADMIN_PASSWORD"),
            email_sender: or_default("EMAIL_SENDER", "orders@example.com"),
            webhook_tolerance_secs: or_default("WEBHOOK_TOLERANCE_SECS", "300")
                .parse()
                .context("Failed to parse WEBHOOK_TOLERANCE_SECS")?,
        };

        config.check()?;
        Ok(config)
    }

    /// Production refuses to start on the development fallbacks.
    fn check(&self) -> Result<()> {
        if self.product.price < 0 {
            bail!("PRODUCT_PRICE must not be negative");
        }
        if self.reservation_ttl_minutes <= 0 {
            bail!("RESERVATION_TTL_MINUTES must be positive");
        }
        if self.environment.is_production() {
            if self.database_url.is_none() {
                bail!("DATABASE_URL environment variable is required in production");
            }
            if self.stripe_secret_key.is_none() {
                bail!("STRIPE_SECRET_KEY environment variable is required in production");
            }
        }
        Ok(())
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/account", self.public_base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_map(&HashMap::new()).expect("defaults are valid")
}
