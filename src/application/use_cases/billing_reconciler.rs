//! Applies Stripe lifecycle events to subscription records and the usage ledger.
//!
//! Quota resets are driven by `invoice.paid`; there is no scheduler. Every
//! period insert is keyed on `(user_id, period_start)` so redelivered events
//! are harmless, and handled event ids are recorded so a redelivery is
//! acknowledged without being re-applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::application::ports::billing_provider::{
    BillingEvent, BillingEventEnvelope, BillingInvoice, BillingProvider, BillingSubscription,
    CompletedCheckout,
};
use crate::application::use_cases::subscription::{
    SubscriptionProfile, SubscriptionRepoTrait, UpsertSubscriptionInput,
};
use crate::application::use_cases::usage::{NewUsagePeriod, UsagePeriodProfile, UsageRepoTrait};
use crate::domain::entities::plan::{PlanCatalog, PlanDetails};
use crate::domain::entities::subscription_status::SubscriptionStatus;

#[async_trait]
pub trait BillingEventRepoTrait: Send + Sync {
    async fn is_processed(&self, event_id: &str) -> AppResult<bool>;

    async fn mark_processed(&self, event_id: &str, event_type: &str) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Already handled on an earlier delivery.
    Duplicate,
    /// Nothing to do, or dropped after logging.
    Ignored,
}

// ============================================================================
// Per-customer serialization
// ============================================================================

/// Async locks keyed by Stripe customer id. Entries are removed when the last
/// holder or waiter lets go.
#[derive(Default)]
struct CustomerLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct CustomerGuard<'a> {
    locks: &'a CustomerLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CustomerLocks {
    async fn acquire(&self, key: &str) -> CustomerGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        CustomerGuard {
            locks: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for CustomerGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry plus ours means nobody else is holding or waiting.
        if let Some(entry) = map.get(&self.key) {
            if Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2 {
                map.remove(&self.key);
            }
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct BillingReconciler {
    subscription_repo: Arc<dyn SubscriptionRepoTrait>,
    usage_repo: Arc<dyn UsageRepoTrait>,
    event_repo: Arc<dyn BillingEventRepoTrait>,
    billing: Arc<dyn BillingProvider>,
    catalog: PlanCatalog,
    locks: CustomerLocks,
}

impl BillingReconciler {
    pub fn new(
        subscription_repo: Arc<dyn SubscriptionRepoTrait>,
        usage_repo: Arc<dyn UsageRepoTrait>,
        event_repo: Arc<dyn BillingEventRepoTrait>,
        billing: Arc<dyn BillingProvider>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            subscription_repo,
            usage_repo,
            event_repo,
            billing,
            catalog,
            locks: CustomerLocks::default(),
        }
    }

    /// Applies one verified webhook event. The event id is recorded only after
    /// the handler succeeded, so a failed write leads to redelivery.
    #[instrument(skip(self, envelope), fields(event_id = %envelope.id, event_type = %envelope.event_type))]
    pub async fn handle_event(&self, envelope: BillingEventEnvelope) -> AppResult<EventOutcome> {
        let _guard = match envelope.event.customer_id() {
            Some(customer_id) => Some(self.locks.acquire(customer_id).await),
            None => None,
        };

        if self.event_repo.is_processed(&envelope.id).await? {
            tracing::debug!(event_id = %envelope.id, "Duplicate webhook delivery, skipping");
            return Ok(EventOutcome::Duplicate);
        }

        let outcome = match &envelope.event {
            BillingEvent::CheckoutCompleted(session) => self.on_checkout_completed(session).await?,
            BillingEvent::SubscriptionCreated(sub) | BillingEvent::SubscriptionUpdated(sub) => {
                self.on_subscription_change(sub).await?
            }
            BillingEvent::SubscriptionDeleted(sub) => self.on_subscription_deleted(sub).await?,
            BillingEvent::InvoicePaid(invoice) => self.on_invoice_paid(invoice).await?,
            BillingEvent::InvoicePaymentFailed(invoice) => self.on_payment_failed(invoice).await?,
            BillingEvent::Malformed(reason) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    reason = %reason,
                    retryable = false,
                    "Webhook event object could not be decoded"
                );
                EventOutcome::Ignored
            }
            BillingEvent::Unhandled => {
                tracing::debug!(event_type = %envelope.event_type, "Unhandled webhook event type");
                EventOutcome::Ignored
            }
        };

        self.event_repo
            .mark_processed(&envelope.id, &envelope.event_type)
            .await?;
        Ok(outcome)
    }

    async fn on_checkout_completed(&self, session: &CompletedCheckout) -> AppResult<EventOutcome> {
        let Some(user_id) = session.user_id else {
            tracing::error!(
                session_id = %session.session_id,
                retryable = false,
                "Checkout session has no user id in metadata"
            );
            return Ok(EventOutcome::Ignored);
        };
        let Some(subscription_id) = session.subscription_id.as_deref() else {
            tracing::error!(
                session_id = %session.session_id,
                user_id = %user_id,
                "Checkout session completed without a subscription"
            );
            return Ok(EventOutcome::Ignored);
        };

        let subscription = self.billing.retrieve_subscription(subscription_id).await?;
        let customer_id = session
            .customer_id
            .clone()
            .unwrap_or_else(|| subscription.customer_id.clone());

        self.upsert_subscription(user_id, &customer_id, &subscription)
            .await?;
        Ok(EventOutcome::Applied)
    }

    async fn on_subscription_change(&self, event_sub: &BillingSubscription) -> AppResult<EventOutcome> {
        // Re-read so an older delivery can't overwrite newer state.
        let subscription = self.billing.retrieve_subscription(&event_sub.id).await?;

        let user_id = match subscription.user_id.or(event_sub.user_id) {
            Some(user_id) => user_id,
            None => match self
                .subscription_repo
                .get_by_stripe_customer_id(&subscription.customer_id)
                .await?
            {
                Some(existing) => existing.user_id,
                None => {
                    tracing::error!(
                        stripe_subscription_id = %subscription.id,
                        stripe_customer_id = %subscription.customer_id,
                        retryable = false,
                        "Cannot resolve user for subscription event, dropping"
                    );
                    return Ok(EventOutcome::Ignored);
                }
            },
        };

        let incoming_status = SubscriptionStatus::from_stripe(&subscription.status);
        if let Some(existing) = self.subscription_repo.get_by_user_id(user_id).await? {
            if existing.stripe_subscription_id != subscription.id
                && existing.status.blocks_checkout()
                && !incoming_status.blocks_checkout()
            {
                tracing::warn!(
                    user_id = %user_id,
                    current_subscription_id = %existing.stripe_subscription_id,
                    stale_subscription_id = %subscription.id,
                    "Ignoring update for a superseded subscription"
                );
                return Ok(EventOutcome::Ignored);
            }
        }

        self.upsert_subscription(user_id, &subscription.customer_id, &subscription)
            .await?;
        Ok(EventOutcome::Applied)
    }

    async fn on_subscription_deleted(&self, subscription: &BillingSubscription) -> AppResult<EventOutcome> {
        let canceled_at = subscription.canceled_at.unwrap_or_else(Utc::now);
        match self
            .subscription_repo
            .mark_canceled(&subscription.id, canceled_at)
            .await?
        {
            Some(record) => {
                tracing::info!(
                    user_id = %record.user_id,
                    stripe_subscription_id = %subscription.id,
                    "Subscription canceled"
                );
                Ok(EventOutcome::Applied)
            }
            None => {
                tracing::warn!(
                    stripe_subscription_id = %subscription.id,
                    "Deleted subscription has no local record"
                );
                Ok(EventOutcome::Ignored)
            }
        }
    }

    async fn on_invoice_paid(&self, invoice: &BillingInvoice) -> AppResult<EventOutcome> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice not related to a subscription");
            return Ok(EventOutcome::Ignored);
        };

        let record = match self
            .subscription_repo
            .get_by_stripe_subscription_id(subscription_id)
            .await?
        {
            Some(record) => record,
            None => self.adopt_orphan_subscription(invoice, subscription_id).await?,
        };

        if record.status == SubscriptionStatus::Canceled {
            tracing::warn!(
                user_id = %record.user_id,
                stripe_subscription_id = %subscription_id,
                "Invoice paid for a canceled subscription, not reactivating"
            );
            return Ok(EventOutcome::Ignored);
        }

        let record = if record.status.is_active() {
            record
        } else {
            self.subscription_repo
                .set_status_by_stripe_subscription_id(subscription_id, SubscriptionStatus::Active)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Subscription {} vanished while applying invoice",
                        subscription_id
                    ))
                })?
        };

        let (period_start, period_end) = invoice.billing_period();
        self.ensure_usage_period(&record, period_start, period_end)
            .await?;
        Ok(EventOutcome::Applied)
    }

    /// `invoice.paid` can beat `checkout.session.completed`. If the subscription
    /// carries our user id we create the record now; otherwise fail so Stripe
    /// retries after the checkout event lands.
    async fn adopt_orphan_subscription(
        &self,
        invoice: &BillingInvoice,
        subscription_id: &str,
    ) -> AppResult<SubscriptionProfile> {
        let subscription = self.billing.retrieve_subscription(subscription_id).await?;
        let Some(user_id) = subscription.user_id else {
            tracing::warn!(
                invoice_id = %invoice.id,
                stripe_subscription_id = %subscription_id,
                retryable = true,
                "Invoice paid before subscription is known, requesting redelivery"
            );
            return Err(AppError::Internal(format!(
                "No subscription record for {} yet",
                subscription_id
            )));
        };

        tracing::info!(
            user_id = %user_id,
            stripe_subscription_id = %subscription_id,
            "Creating subscription record from orphan invoice"
        );
        self.upsert_subscription(user_id, &invoice.customer_id, &subscription)
            .await
    }

    async fn on_payment_failed(&self, invoice: &BillingInvoice) -> AppResult<EventOutcome> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            return Ok(EventOutcome::Ignored);
        };

        match self
            .subscription_repo
            .set_status_by_stripe_subscription_id(subscription_id, SubscriptionStatus::PastDue)
            .await?
        {
            Some(record) => {
                tracing::warn!(
                    user_id = %record.user_id,
                    stripe_subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    "Payment failed, subscription is past due"
                );
                Ok(EventOutcome::Applied)
            }
            None => {
                tracing::warn!(
                    stripe_subscription_id = %subscription_id,
                    "Payment failed for unknown or canceled subscription"
                );
                Ok(EventOutcome::Ignored)
            }
        }
    }

    /// Writes a fresh snapshot taken outside the webhook path (cancel/resume),
    /// under the same per-customer lock.
    pub async fn apply_subscription_snapshot(
        &self,
        user_id: Uuid,
        subscription: &BillingSubscription,
    ) -> AppResult<SubscriptionProfile> {
        let _guard = self.locks.acquire(&subscription.customer_id).await;
        self.upsert_subscription(user_id, &subscription.customer_id, subscription)
            .await
    }

    /// Overwrites the user's record from a provider subscription and opens the
    /// current usage period when the subscription is active.
    #[instrument(skip(self, subscription), fields(stripe_subscription_id = %subscription.id))]
    pub async fn upsert_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
        subscription: &BillingSubscription,
    ) -> AppResult<SubscriptionProfile> {
        let plan = self.resolve_plan(subscription);
        let status = SubscriptionStatus::from_stripe(&subscription.status);

        let record = self
            .subscription_repo
            .upsert(&UpsertSubscriptionInput {
                user_id,
                stripe_customer_id: customer_id.to_string(),
                stripe_subscription_id: subscription.id.clone(),
                stripe_price_id: subscription
                    .price
                    .as_ref()
                    .map(|p| p.id.clone())
                    .unwrap_or_default(),
                status,
                plan,
                current_period_start: subscription.current_period_start,
                current_period_end: subscription.current_period_end,
                cancel_at_period_end: subscription.cancel_at_period_end,
                canceled_at: subscription.canceled_at,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            status = %status,
            plan = %plan.plan,
            interval = %plan.interval,
            "Subscription record upserted"
        );

        if status.is_active() {
            self.ensure_usage_period(
                &record,
                subscription.current_period_start,
                subscription.current_period_end,
            )
            .await?;
        }

        Ok(record)
    }

    fn resolve_plan(&self, subscription: &BillingSubscription) -> PlanDetails {
        let Some(price) = subscription.price.as_ref() else {
            tracing::warn!(
                stripe_subscription_id = %subscription.id,
                "Subscription has no price, using fallback plan"
            );
            return PlanDetails::fallback(None);
        };

        let resolved = price
            .lookup_key
            .as_deref()
            .and_then(|key| self.catalog.resolve_plan(key))
            .or_else(|| self.catalog.resolve_plan(&price.id));

        resolved.unwrap_or_else(|| {
            tracing::warn!(
                stripe_subscription_id = %subscription.id,
                price_id = %price.id,
                lookup_key = ?price.lookup_key,
                "Unknown price, using fallback plan; plan catalog may be out of sync"
            );
            PlanDetails::fallback(price.interval)
        })
    }

    /// Opens the period starting at `period_start` unless it already exists.
    /// The quota is the subscription's limit at the time the period opens.
    pub async fn ensure_usage_period(
        &self,
        subscription: &SubscriptionProfile,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<UsagePeriodProfile> {
        if period_end <= period_start {
            tracing::error!(
                user_id = %subscription.user_id,
                %period_start,
                %period_end,
                "Refusing to open an empty usage period"
            );
            return Err(AppError::InvalidInput("Usage period end must follow its start".into()));
        }

        let (period, created) = self
            .usage_repo
            .create_period_if_absent(&NewUsagePeriod {
                user_id: subscription.user_id,
                subscription_id: subscription.id,
                period_start,
                period_end,
                minutes_limit: subscription.minutes_limit,
            })
            .await?;

        if created {
            tracing::info!(
                user_id = %subscription.user_id,
                period_id = %period.id,
                %period_start,
                %period_end,
                minutes_limit = period.minutes_limit,
                "Opened usage period"
            );
        }
        Ok(period)
    }
}
