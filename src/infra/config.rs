use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;
use url::Url;

use crate::domain::entities::plan::{PlanCatalog, PriceLookupKey};

pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Public web app origin; checkout and portal redirects land here.
    pub app_origin: Url,
    pub cors_origin: HeaderValue,
    pub jwt_secret: SecretString,
    pub jwt_audience: String,
    pub stripe_secret_key: SecretString,
    pub stripe_webhook_secret: SecretString,
    pub stripe_api_timeout: Duration,
    pub webhook_tolerance_secs: i64,
    /// Stripe price ids configured per plan, for prices without lookup keys.
    pub stripe_price_ids: Vec<(String, PriceLookupKey)>,
    pub log_file: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr =
            get_env_default("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3001)));
        let database_url: String = get_env("DATABASE_URL");
        let database_max_connections: u32 = get_env_default("DATABASE_MAX_CONNECTIONS", 5);
        let app_origin: Url = get_env("APP_ORIGIN");
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .expect("CORS_ORIGIN must be a valid header value");

        let jwt_secret = SecretString::from(get_env::<String>("JWT_SECRET"));
        let jwt_audience: String = get_env_default("JWT_AUDIENCE", "authenticated".to_string());

        let stripe_secret_key = SecretString::from(get_env::<String>("STRIPE_SECRET_KEY"));
        let stripe_webhook_secret = SecretString::from(get_env::<String>("STRIPE_WEBHOOK_SECRET"));
        let stripe_api_timeout_secs: u64 = get_env_default("STRIPE_API_TIMEOUT_SECS", 10);
        let webhook_tolerance_secs: i64 = get_env_default("STRIPE_WEBHOOK_TOLERANCE_SECS", 300);

        let stripe_price_ids = [
            ("STRIPE_PRICE_STARTER_MONTHLY", PriceLookupKey::StarterMonthly),
            ("STRIPE_PRICE_STARTER_ANNUAL", PriceLookupKey::StarterAnnual),
            ("STRIPE_PRICE_PRO_MONTHLY", PriceLookupKey::ProMonthly),
            ("STRIPE_PRICE_PRO_ANNUAL", PriceLookupKey::ProAnnual),
        ]
        .into_iter()
        .filter_map(|(var, key)| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|price_id| (price_id, key))
        })
        .collect();

        let log_file: String = get_env_default("LOG_FILE", "app.log".to_string());

        Self {
            bind_addr,
            database_url,
            database_max_connections,
            app_origin,
            cors_origin,
            jwt_secret,
            jwt_audience,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_api_timeout: Duration::from_secs(stripe_api_timeout_secs),
            webhook_tolerance_secs,
            stripe_price_ids,
            log_file,
        }
    }

    pub fn plan_catalog(&self) -> PlanCatalog {
        self.stripe_price_ids
            .iter()
            .fold(PlanCatalog::new(), |catalog, (price_id, key)| {
                catalog.with_price_id(price_id.clone(), *key)
            })
    }
}
