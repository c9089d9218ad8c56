use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::{http::app_state::AppState, persistence::PostgresPersistence},
    application::ports::billing_provider::BillingProvider,
    infra::{config::AppConfig, postgres_persistence, stripe_client::StripeClient},
    use_cases::{
        billing_reconciler::{BillingEventRepoTrait, BillingReconciler},
        subscription::{SubscriptionRepoTrait, SubscriptionUseCases},
        usage::{UsageRepoTrait, UsageUseCases},
    },
};

pub async fn init_app_state(config: AppConfig) -> anyhow::Result<AppState> {
    let postgres_arc: Arc<PostgresPersistence> = Arc::new(
        postgres_persistence(&config.database_url, config.database_max_connections).await?,
    );
    let subscription_repo = postgres_arc.clone() as Arc<dyn SubscriptionRepoTrait>;
    let usage_repo = postgres_arc.clone() as Arc<dyn UsageRepoTrait>;
    let event_repo = postgres_arc.clone() as Arc<dyn BillingEventRepoTrait>;

    let billing = Arc::new(StripeClient::new(
        config.stripe_secret_key.clone(),
        config.stripe_api_timeout,
    )?) as Arc<dyn BillingProvider>;

    let catalog = config.plan_catalog();

    let reconciler = Arc::new(BillingReconciler::new(
        subscription_repo.clone(),
        usage_repo.clone(),
        event_repo,
        billing.clone(),
        catalog.clone(),
    ));

    let subscription_use_cases = SubscriptionUseCases::new(
        subscription_repo,
        usage_repo.clone(),
        billing,
        reconciler.clone(),
        catalog,
        config.app_origin.clone(),
    );
    let usage_use_cases = UsageUseCases::new(usage_repo);

    Ok(AppState {
        config: Arc::new(config),
        subscription_use_cases: Arc::new(subscription_use_cases),
        usage_use_cases: Arc::new(usage_use_cases),
        reconciler,
    })
}

pub fn init_tracing(log_file: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "scribe_billing=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer().with_target(false).with_level(true).pretty();

    // File (structured JSON logs); skipped when the file can't be created.
    let json_layer = match File::create(log_file) {
        Ok(file) => Some(
            fmt::layer()
                .json()
                .with_writer(file)
                .with_current_span(true)
                .with_span_list(true),
        ),
        Err(e) => {
            eprintln!("cannot create log file {}: {}", log_file, e);
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
