//! In-memory mock implementations for billing ports and repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::billing_provider::{
            BillingPrice, BillingProvider, BillingSubscription, CheckoutSession,
            CheckoutSessionRequest,
        },
        use_cases::{
            billing_reconciler::BillingEventRepoTrait,
            subscription::{SubscriptionProfile, SubscriptionRepoTrait, UpsertSubscriptionInput},
            usage::{NewUsagePeriod, UsageCharge, UsageLogProfile, UsagePeriodProfile, UsageRepoTrait},
        },
    },
    domain::entities::{plan::PriceLookupKey, subscription_status::SubscriptionStatus},
};

// ============================================================================
// InMemorySubscriptionRepo
// ============================================================================

/// Keyed by user id, mirroring the one-record-per-user constraint.
#[derive(Default)]
pub struct InMemorySubscriptionRepo {
    pub subscriptions: Mutex<HashMap<Uuid, SubscriptionProfile>>,
}

impl InMemorySubscriptionRepo {
    pub fn with_subscriptions(subscriptions: Vec<SubscriptionProfile>) -> Self {
        Self {
            subscriptions: Mutex::new(subscriptions.into_iter().map(|s| (s.user_id, s)).collect()),
        }
    }

    pub fn get(&self, user_id: Uuid) -> Option<SubscriptionProfile> {
        self.subscriptions.lock().unwrap().get(&user_id).cloned()
    }
}

#[async_trait]
impl SubscriptionRepoTrait for InMemorySubscriptionRepo {
    async fn get_by_user_id(&self, user_id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self.get(user_id))
    }

    async fn get_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .cloned())
    }

    async fn get_by_stripe_customer_id(
        &self,
        stripe_customer_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.stripe_customer_id == stripe_customer_id)
            .cloned())
    }

    async fn upsert(&self, input: &UpsertSubscriptionInput) -> AppResult<SubscriptionProfile> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let id = subscriptions
            .get(&input.user_id)
            .map(|s| s.id)
            .unwrap_or_else(Uuid::new_v4);

        let profile = SubscriptionProfile {
            id,
            user_id: input.user_id,
            stripe_customer_id: input.stripe_customer_id.clone(),
            stripe_subscription_id: input.stripe_subscription_id.clone(),
            stripe_price_id: input.stripe_price_id.clone(),
            status: input.status,
            plan_name: input.plan.plan,
            billing_interval: input.plan.interval,
            minutes_limit: input.plan.minutes_limit,
            current_period_start: input.current_period_start,
            current_period_end: input.current_period_end,
            cancel_at_period_end: input.cancel_at_period_end,
            canceled_at: input.canceled_at,
            updated_at: Utc::now(),
        };
        subscriptions.insert(input.user_id, profile.clone());
        Ok(profile)
    }

    async fn set_status_by_stripe_subscription_id(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> AppResult<Option<SubscriptionProfile>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(record) = subscriptions.values_mut().find(|s| {
            s.stripe_subscription_id == stripe_subscription_id
                && s.status != SubscriptionStatus::Canceled
        }) else {
            return Ok(None);
        };
        record.status = status;
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn mark_canceled(
        &self,
        stripe_subscription_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> AppResult<Option<SubscriptionProfile>> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let Some(record) = subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
        else {
            return Ok(None);
        };
        record.status = SubscriptionStatus::Canceled;
        record.canceled_at = record.canceled_at.or(Some(canceled_at));
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }
}

// ============================================================================
// InMemoryUsageRepo
// ============================================================================

#[derive(Default)]
struct UsageLedger {
    periods: Vec<UsagePeriodProfile>,
    logs: Vec<UsageLogProfile>,
}

/// Periods and logs share one lock so a charge and its log land together.
#[derive(Default)]
pub struct InMemoryUsageRepo {
    ledger: Mutex<UsageLedger>,
    fail_writes: AtomicBool,
}

impl InMemoryUsageRepo {
    pub fn with_periods(periods: Vec<UsagePeriodProfile>) -> Self {
        Self {
            ledger: Mutex::new(UsageLedger {
                periods,
                logs: Vec::new(),
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every write return a database error until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn periods_for(&self, user_id: Uuid) -> Vec<UsagePeriodProfile> {
        let mut periods: Vec<_> = self
            .ledger
            .lock()
            .unwrap()
            .periods
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        periods.sort_by_key(|p| p.period_start);
        periods
    }

    /// The period containing now.
    pub fn period_for(&self, user_id: Uuid) -> Option<UsagePeriodProfile> {
        let now = Utc::now();
        self.periods_for(user_id)
            .into_iter()
            .find(|p| p.contains(now))
    }

    pub fn logs_for(&self, user_id: Uuid) -> Vec<UsageLogProfile> {
        self.ledger
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect()
    }

    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Database("simulated write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageRepoTrait for InMemoryUsageRepo {
    async fn get_current_period(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriodProfile>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .periods
            .iter()
            .filter(|p| p.user_id == user_id && p.contains(at))
            .max_by_key(|p| p.period_start)
            .cloned())
    }

    async fn create_period_if_absent(
        &self,
        period: &NewUsagePeriod,
    ) -> AppResult<(UsagePeriodProfile, bool)> {
        self.check_writable()?;
        let mut ledger = self.ledger.lock().unwrap();

        if let Some(existing) = ledger
            .periods
            .iter()
            .find(|p| p.user_id == period.user_id && p.period_start == period.period_start)
        {
            return Ok((existing.clone(), false));
        }

        let profile = UsagePeriodProfile {
            id: Uuid::new_v4(),
            user_id: period.user_id,
            subscription_id: period.subscription_id,
            period_start: period.period_start,
            period_end: period.period_end,
            minutes_used: 0,
            minutes_limit: period.minutes_limit,
            created_at: Utc::now(),
        };
        ledger.periods.push(profile.clone());
        Ok((profile, true))
    }

    async fn charge_current_period(
        &self,
        charge: &UsageCharge,
    ) -> AppResult<Option<UsagePeriodProfile>> {
        self.check_writable()?;
        let mut ledger = self.ledger.lock().unwrap();

        let Some(period) = ledger
            .periods
            .iter_mut()
            .filter(|p| p.user_id == charge.user_id && p.contains(charge.at))
            .max_by_key(|p| p.period_start)
        else {
            return Ok(None);
        };
        period.minutes_used += charge.minutes;
        let updated = period.clone();

        ledger.logs.push(UsageLogProfile {
            id: Uuid::new_v4(),
            user_id: charge.user_id,
            usage_period_id: updated.id,
            transcript_id: charge.transcript_id,
            source_type: charge.source_type,
            source_identifier: charge.source_identifier.clone(),
            minutes_charged: charge.minutes,
            created_at: charge.at,
        });
        Ok(Some(updated))
    }

    async fn list_logs(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<UsageLogProfile>> {
        let mut logs = self.logs_for(user_id);
        logs.reverse();
        logs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(logs)
    }
}

// ============================================================================
// InMemoryBillingEventRepo
// ============================================================================

#[derive(Default)]
pub struct InMemoryBillingEventRepo {
    pub processed: Mutex<HashSet<String>>,
}

impl InMemoryBillingEventRepo {
    pub fn contains(&self, event_id: &str) -> bool {
        self.processed.lock().unwrap().contains(event_id)
    }
}

#[async_trait]
impl BillingEventRepoTrait for InMemoryBillingEventRepo {
    async fn is_processed(&self, event_id: &str) -> AppResult<bool> {
        Ok(self.contains(event_id))
    }

    async fn mark_processed(&self, event_id: &str, _event_type: &str) -> AppResult<()> {
        self.processed.lock().unwrap().insert(event_id.to_string());
        Ok(())
    }
}

// ============================================================================
// FakeBillingProvider
// ============================================================================

/// Stands in for Stripe. Prices exist for every catalog lookup key with id
/// `price_<lookup_key>`; subscriptions must be seeded with `add_subscription`.
#[derive(Default)]
pub struct FakeBillingProvider {
    subscriptions: Mutex<HashMap<String, BillingSubscription>>,
    customers: Mutex<HashMap<Uuid, String>>,
    checkout_requests: Mutex<Vec<CheckoutSessionRequest>>,
    portal_return_urls: Mutex<Vec<String>>,
    retrieve_calls: AtomicUsize,
}

impl FakeBillingProvider {
    pub fn add_subscription(&self, subscription: BillingSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<BillingSubscription> {
        self.subscriptions.lock().unwrap().get(id).cloned()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.checkout_requests.lock().unwrap().clone()
    }

    pub fn customer_for(&self, user_id: Uuid) -> Option<String> {
        self.customers.lock().unwrap().get(&user_id).cloned()
    }

    pub fn customers_created(&self) -> usize {
        self.customers.lock().unwrap().len()
    }

    pub fn portal_return_urls(&self) -> Vec<String> {
        self.portal_return_urls.lock().unwrap().clone()
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingProvider for FakeBillingProvider {
    async fn retrieve_subscription(&self, subscription_id: &str) -> AppResult<BillingSubscription> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.subscription(subscription_id)
            .ok_or_else(|| AppError::Upstream(format!("No such subscription: {}", subscription_id)))
    }

    async fn find_price_by_lookup_key(&self, lookup_key: &str) -> AppResult<Option<BillingPrice>> {
        Ok(lookup_key
            .parse::<PriceLookupKey>()
            .ok()
            .map(|key| BillingPrice {
                id: format!("price_{}", lookup_key),
                lookup_key: Some(lookup_key.to_string()),
                interval: Some(key.interval()),
            }))
    }

    async fn find_or_create_customer(
        &self,
        user_id: Uuid,
        _email: Option<&str>,
    ) -> AppResult<String> {
        let mut customers = self.customers.lock().unwrap();
        let next = customers.len() + 1;
        Ok(customers
            .entry(user_id)
            .or_insert_with(|| format!("cus_fake_{}", next))
            .clone())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> AppResult<CheckoutSession> {
        let mut requests = self.checkout_requests.lock().unwrap();
        let id = format!("cs_test_{}", requests.len() + 1);
        requests.push(request);
        Ok(CheckoutSession {
            url: format!("https://checkout.stripe.test/{}", id),
            id,
        })
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> AppResult<String> {
        self.portal_return_urls
            .lock()
            .unwrap()
            .push(return_url.to_string());
        Ok(format!("https://billing.stripe.test/{}", customer_id))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> AppResult<BillingSubscription> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| AppError::Upstream(format!("No such subscription: {}", subscription_id)))?;
        subscription.cancel_at_period_end = cancel_at_period_end;
        Ok(subscription.clone())
    }
}
