use std::sync::Arc;

use crate::{
    infra::config::AppConfig,
    use_cases::{
        billing_reconciler::BillingReconciler, subscription::SubscriptionUseCases,
        usage::UsageUseCases,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub subscription_use_cases: Arc<SubscriptionUseCases>,
    pub usage_use_cases: Arc<UsageUseCases>,
    pub reconciler: Arc<BillingReconciler>,
}
