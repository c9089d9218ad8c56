//! Test app state builder for HTTP-level testing.
//!
//! `TestAppStateBuilder` wires the real use cases to in-memory repositories
//! and the fake billing provider, and keeps handles to them so tests can
//! seed and inspect state around a request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use secrecy::SecretString;
use url::Url;

use crate::{
    adapters::http::app_state::AppState,
    application::{
        jwt::{self, CurrentUser},
        use_cases::{
            billing_reconciler::BillingReconciler,
            subscription::{SubscriptionProfile, SubscriptionUseCases},
            usage::{UsagePeriodProfile, UsageUseCases},
        },
    },
    domain::entities::plan::PlanCatalog,
    infra::config::AppConfig,
    test_utils::{
        FakeBillingProvider, InMemoryBillingEventRepo, InMemorySubscriptionRepo,
        InMemoryUsageRepo,
    },
};

pub const TEST_JWT_SECRET: &str = "test-jwt-secret-with-enough-entropy";
pub const TEST_JWT_AUDIENCE: &str = "authenticated";
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_APP_ORIGIN: &str = "https://app.example.com";

pub fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        app_origin: Url::parse(TEST_APP_ORIGIN).unwrap(),
        cors_origin: HeaderValue::from_static(TEST_APP_ORIGIN),
        jwt_secret: SecretString::from(TEST_JWT_SECRET),
        jwt_audience: TEST_JWT_AUDIENCE.to_string(),
        stripe_secret_key: SecretString::from("sk_test_unused"),
        stripe_webhook_secret: SecretString::from(TEST_WEBHOOK_SECRET),
        stripe_api_timeout: Duration::from_secs(1),
        webhook_tolerance_secs: 300,
        stripe_price_ids: Vec::new(),
        log_file: "test.log".to_string(),
    }
}

/// `Authorization` header value for `user`.
pub fn bearer_for(user: &CurrentUser) -> String {
    let token = jwt::issue(
        user.id,
        user.email.as_deref(),
        TEST_JWT_AUDIENCE,
        &SecretString::from(TEST_JWT_SECRET),
        time::Duration::minutes(15),
    )
    .unwrap();
    format!("Bearer {}", token)
}

pub struct TestApp {
    pub state: AppState,
    pub subscriptions: Arc<InMemorySubscriptionRepo>,
    pub usage: Arc<InMemoryUsageRepo>,
    pub events: Arc<InMemoryBillingEventRepo>,
    pub billing: Arc<FakeBillingProvider>,
}

#[derive(Default)]
pub struct TestAppStateBuilder {
    subscriptions: Vec<SubscriptionProfile>,
    periods: Vec<UsagePeriodProfile>,
    billing: Option<Arc<FakeBillingProvider>>,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(mut self, subscription: SubscriptionProfile) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn with_usage_period(mut self, period: UsagePeriodProfile) -> Self {
        self.periods.push(period);
        self
    }

    pub fn with_billing(mut self, billing: Arc<FakeBillingProvider>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn build(self) -> TestApp {
        let config = test_config();
        let subscriptions = Arc::new(InMemorySubscriptionRepo::with_subscriptions(
            self.subscriptions,
        ));
        let usage = Arc::new(InMemoryUsageRepo::with_periods(self.periods));
        let events = Arc::new(InMemoryBillingEventRepo::default());
        let billing = self.billing.unwrap_or_default();

        let reconciler = Arc::new(BillingReconciler::new(
            subscriptions.clone(),
            usage.clone(),
            events.clone(),
            billing.clone(),
            PlanCatalog::new(),
        ));
        let subscription_use_cases = SubscriptionUseCases::new(
            subscriptions.clone(),
            usage.clone(),
            billing.clone(),
            reconciler.clone(),
            PlanCatalog::new(),
            config.app_origin.clone(),
        );

        let state = AppState {
            config: Arc::new(config),
            subscription_use_cases: Arc::new(subscription_use_cases),
            usage_use_cases: Arc::new(UsageUseCases::new(usage.clone())),
            reconciler,
        };

        TestApp {
            state,
            subscriptions,
            usage,
            events,
            billing,
        }
    }
}
