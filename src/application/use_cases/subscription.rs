use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::application::jwt::CurrentUser;
use crate::application::ports::billing_provider::{
    BillingProvider, CheckoutSession, CheckoutSessionRequest,
};
use crate::application::use_cases::access::decide_access;
use crate::application::use_cases::billing_reconciler::BillingReconciler;
use crate::application::use_cases::usage::{UsagePeriodProfile, UsageRepoTrait};
use crate::application::validators::is_valid_email;
use crate::domain::entities::access::{AccessResult, DenialReason, format_reset_date, percent_used};
use crate::domain::entities::plan::{
    BillingInterval, CatalogEntry, PlanCatalog, PlanDetails, PlanName, PriceLookupKey,
};
use crate::domain::entities::subscription_status::SubscriptionStatus;

pub const BILLING_SETTINGS_PATH: &str = "/settings/billing";

// ============================================================================
// Profile Types
// ============================================================================

/// Local mirror of a user's Stripe subscription. One per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub status: SubscriptionStatus,
    pub plan_name: PlanName,
    pub billing_interval: BillingInterval,
    pub minutes_limit: i32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertSubscriptionInput {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub status: SubscriptionStatus,
    pub plan: PlanDetails,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait SubscriptionRepoTrait: Send + Sync {
    async fn get_by_user_id(&self, user_id: Uuid) -> AppResult<Option<SubscriptionProfile>>;

    async fn get_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>>;

    async fn get_by_stripe_customer_id(
        &self,
        stripe_customer_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>>;

    /// Insert or overwrite the user's record.
    async fn upsert(&self, input: &UpsertSubscriptionInput) -> AppResult<SubscriptionProfile>;

    /// Canceled records are left untouched; `None` if nothing was updated.
    async fn set_status_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> AppResult<Option<SubscriptionProfile>>;

    async fn mark_canceled(
        &self,
        stripe_subscription_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> AppResult<Option<SubscriptionProfile>>;
}

// ============================================================================
// View Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub status: SubscriptionStatus,
    pub plan_name: PlanName,
    pub billing_interval: BillingInterval,
    pub minutes_limit: i32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl From<&SubscriptionProfile> for SubscriptionSummary {
    fn from(s: &SubscriptionProfile) -> Self {
        SubscriptionSummary {
            status: s.status,
            plan_name: s.plan_name,
            billing_interval: s.billing_interval,
            minutes_limit: s.minutes_limit,
            current_period_start: s.current_period_start,
            current_period_end: s.current_period_end,
            cancel_at_period_end: s.cancel_at_period_end,
            canceled_at: s.canceled_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub minutes_used: i64,
    pub minutes_limit: i64,
    pub minutes_remaining: i64,
    pub percent_used: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl From<&UsagePeriodProfile> for UsageStats {
    fn from(p: &UsagePeriodProfile) -> Self {
        let used = i64::from(p.minutes_used);
        let limit = i64::from(p.minutes_limit);
        UsageStats {
            minutes_used: used,
            minutes_limit: limit,
            minutes_remaining: p.minutes_remaining(),
            percent_used: percent_used(used, limit),
            period_start: p.period_start,
            period_end: p.period_end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    /// `none` when the user never subscribed, otherwise the record's status.
    pub status: String,
    pub subscription: Option<SubscriptionSummary>,
    pub usage: Option<UsageStats>,
    pub access: AccessResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightResult {
    pub can_transcribe: bool,
    pub reason: &'static str,
    pub minutes_remaining: i64,
    pub resets_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutInput {
    pub price_lookup_key: String,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionUseCases {
    subscription_repo: Arc<dyn SubscriptionRepoTrait>,
    usage_repo: Arc<dyn UsageRepoTrait>,
    billing: Arc<dyn BillingProvider>,
    reconciler: Arc<BillingReconciler>,
    catalog: PlanCatalog,
    app_origin: Url,
}

impl SubscriptionUseCases {
    pub fn new(
        subscription_repo: Arc<dyn SubscriptionRepoTrait>,
        usage_repo: Arc<dyn UsageRepoTrait>,
        billing: Arc<dyn BillingProvider>,
        reconciler: Arc<BillingReconciler>,
        catalog: PlanCatalog,
        app_origin: Url,
    ) -> Self {
        Self {
            subscription_repo,
            usage_repo,
            billing,
            reconciler,
            catalog,
            app_origin,
        }
    }

    pub fn plans(&self) -> Vec<CatalogEntry> {
        self.catalog.entries()
    }

    async fn load_state(
        &self,
        user_id: Uuid,
    ) -> AppResult<(Option<SubscriptionProfile>, Option<UsagePeriodProfile>)> {
        let Some(subscription) = self.subscription_repo.get_by_user_id(user_id).await? else {
            return Ok((None, None));
        };
        let period = self
            .usage_repo
            .get_current_period(user_id, Utc::now())
            .await?;
        Ok((Some(subscription), period))
    }

    #[instrument(skip(self))]
    pub async fn get_status(&self, user_id: Uuid) -> AppResult<SubscriptionStatusView> {
        let (subscription, period) = self.load_state(user_id).await?;
        let access = decide_access(subscription.as_ref(), period.as_ref());

        Ok(SubscriptionStatusView {
            status: subscription
                .as_ref()
                .map(|s| s.status.as_str().to_string())
                .unwrap_or_else(|| "none".to_string()),
            subscription: subscription.as_ref().map(SubscriptionSummary::from),
            usage: period.as_ref().map(UsageStats::from),
            access,
        })
    }

    /// Pre-flight check before a transcription job starts.
    ///
    /// The estimate never denies access on its own: in-flight overage is billed,
    /// so it only changes the message.
    #[instrument(skip(self))]
    pub async fn preflight(
        &self,
        user_id: Uuid,
        estimated_minutes: Option<i64>,
    ) -> AppResult<PreflightResult> {
        if estimated_minutes.is_some_and(|m| m < 0) {
            return Err(AppError::InvalidInput("estimatedMinutes must be >= 0".into()));
        }

        let (subscription, period) = self.load_state(user_id).await?;
        let access = decide_access(subscription.as_ref(), period.as_ref());

        let minutes_remaining = period.as_ref().map_or(0, UsagePeriodProfile::minutes_remaining);
        let resets_at = period.as_ref().map(|p| p.period_end);

        let message = match access.reason {
            None => match estimated_minutes {
                Some(estimate) if estimate > minutes_remaining => format!(
                    "This transcription may use more than your remaining {} minutes.",
                    minutes_remaining
                ),
                _ => format!("You have {} minutes remaining.", minutes_remaining),
            },
            Some(DenialReason::LimitReached) => format!(
                "You've reached your limit. Resets on {}.",
                format_reset_date(resets_at)
            ),
            Some(_) => access.message.clone(),
        };

        Ok(PreflightResult {
            can_transcribe: access.allowed,
            reason: access.reason.map_or("ok", |r| r.as_str()),
            minutes_remaining,
            resets_at,
            message,
        })
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn create_checkout(
        &self,
        user: &CurrentUser,
        input: CheckoutInput,
    ) -> AppResult<CheckoutSession> {
        let lookup_key: PriceLookupKey = input
            .price_lookup_key
            .parse()
            .map_err(|_| AppError::InvalidInput("Invalid price lookup key".into()))?;

        if let Some(existing) = self.subscription_repo.get_by_user_id(user.id).await? {
            if existing.status.blocks_checkout() {
                tracing::info!(
                    user_id = %user.id,
                    status = %existing.status,
                    "Checkout refused, subscription already live"
                );
                return Err(AppError::SubscriptionConflict);
            }
        }

        let success_url = match input.success_url {
            Some(url) => self.same_origin_url(&url)?,
            None => format!(
                "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
                self.origin()
            ),
        };
        let cancel_url = match input.cancel_url {
            Some(url) => self.same_origin_url(&url)?,
            None => format!("{}/checkout/cancel", self.origin()),
        };

        let price = self
            .billing
            .find_price_by_lookup_key(lookup_key.as_ref())
            .await?
            .ok_or_else(|| {
                tracing::error!(lookup_key = %lookup_key, "No active Stripe price for lookup key");
                AppError::NotFound
            })?;

        let email = user.email.as_deref().filter(|e| is_valid_email(e));
        let customer_id = self.billing.find_or_create_customer(user.id, email).await?;

        let session = self
            .billing
            .create_checkout_session(CheckoutSessionRequest {
                customer_id,
                price_id: price.id,
                user_id: user.id,
                success_url,
                cancel_url,
            })
            .await?;

        tracing::info!(user_id = %user.id, session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn create_portal(&self, user_id: Uuid, return_url: Option<String>) -> AppResult<String> {
        let subscription = self
            .subscription_repo
            .get_by_user_id(user_id)
            .await?
            .ok_or(AppError::NoBillingAccount)?;

        let return_url = match return_url {
            Some(url) => {
                let url = self.same_origin_url(&url)?;
                let trimmed = url.trim_end_matches('/');
                if trimmed.ends_with(BILLING_SETTINGS_PATH) {
                    trimmed.to_string()
                } else {
                    format!("{}{}", trimmed, BILLING_SETTINGS_PATH)
                }
            }
            None => format!("{}{}", self.origin(), BILLING_SETTINGS_PATH),
        };

        self.billing
            .create_portal_session(&subscription.stripe_customer_id, &return_url)
            .await
    }

    /// Schedules cancellation at the end of the current period.
    #[instrument(skip(self))]
    pub async fn cancel_at_period_end(&self, user_id: Uuid) -> AppResult<SubscriptionProfile> {
        let subscription = self
            .subscription_repo
            .get_by_user_id(user_id)
            .await?
            .ok_or(AppError::NoBillingAccount)?;

        if !subscription.status.blocks_checkout() {
            return Err(AppError::InvalidInput("No active subscription to cancel".into()));
        }
        if subscription.cancel_at_period_end {
            return Ok(subscription);
        }

        let updated = self
            .billing
            .set_cancel_at_period_end(&subscription.stripe_subscription_id, true)
            .await?;
        self.reconciler
            .apply_subscription_snapshot(user_id, &updated)
            .await
    }

    /// Withdraws a scheduled cancellation.
    #[instrument(skip(self))]
    pub async fn resume(&self, user_id: Uuid) -> AppResult<SubscriptionProfile> {
        let subscription = self
            .subscription_repo
            .get_by_user_id(user_id)
            .await?
            .ok_or(AppError::NoBillingAccount)?;

        if !subscription.cancel_at_period_end
            || subscription.status == SubscriptionStatus::Canceled
        {
            return Err(AppError::InvalidInput(
                "Subscription is not scheduled for cancellation".into(),
            ));
        }

        let updated = self
            .billing
            .set_cancel_at_period_end(&subscription.stripe_subscription_id, false)
            .await?;
        self.reconciler
            .apply_subscription_snapshot(user_id, &updated)
            .await
    }

    fn origin(&self) -> String {
        self.app_origin.as_str().trim_end_matches('/').to_string()
    }

    /// Client-supplied redirect targets must stay on our own origin.
    fn same_origin_url(&self, raw: &str) -> AppResult<String> {
        let url = Url::parse(raw).map_err(|_| AppError::InvalidInput("Invalid URL".into()))?;
        if url.origin() != self.app_origin.origin() {
            return Err(AppError::InvalidInput(
                "Redirect URL must use the application origin".into(),
            ));
        }
        Ok(raw.to_string())
    }
}
