//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::{
    application::{
        jwt::CurrentUser,
        ports::billing_provider::{BillingInvoice, BillingPrice, BillingSubscription},
        use_cases::{subscription::SubscriptionProfile, usage::UsagePeriodProfile},
    },
    domain::entities::{
        plan::{BillingInterval, PlanName, STARTER_MINUTES},
        subscription_status::SubscriptionStatus,
    },
};

/// Create an active starter subscription whose period contains now.
pub fn create_test_subscription(
    overrides: impl FnOnce(&mut SubscriptionProfile),
) -> SubscriptionProfile {
    let now = Utc::now();
    let mut subscription = SubscriptionProfile {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        stripe_customer_id: "cus_test".to_string(),
        stripe_subscription_id: "sub_test".to_string(),
        stripe_price_id: "price_starter_monthly".to_string(),
        status: SubscriptionStatus::Active,
        plan_name: PlanName::Starter,
        billing_interval: BillingInterval::Month,
        minutes_limit: STARTER_MINUTES,
        current_period_start: now - Duration::days(1),
        current_period_end: now + Duration::days(29),
        cancel_at_period_end: false,
        canceled_at: None,
        updated_at: now,
    };
    overrides(&mut subscription);
    subscription
}

/// Create an empty usage period spanning now.
pub fn create_test_usage_period(
    overrides: impl FnOnce(&mut UsagePeriodProfile),
) -> UsagePeriodProfile {
    let now = Utc::now();
    let mut period = UsagePeriodProfile {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        subscription_id: Uuid::new_v4(),
        period_start: now - Duration::days(1),
        period_end: now + Duration::days(29),
        minutes_used: 0,
        minutes_limit: STARTER_MINUTES,
        created_at: now,
    };
    overrides(&mut period);
    period
}

/// Create a provider-side subscription on the monthly starter price.
pub fn create_test_billing_subscription(
    overrides: impl FnOnce(&mut BillingSubscription),
) -> BillingSubscription {
    let now = Utc::now();
    let mut subscription = BillingSubscription {
        id: "sub_test".to_string(),
        customer_id: "cus_test".to_string(),
        status: "active".to_string(),
        price: Some(BillingPrice {
            id: "price_starter_monthly".to_string(),
            lookup_key: Some("starter_monthly".to_string()),
            interval: Some(BillingInterval::Month),
        }),
        current_period_start: now - Duration::days(1),
        current_period_end: now + Duration::days(29),
        cancel_at_period_end: false,
        canceled_at: None,
        user_id: None,
    };
    overrides(&mut subscription);
    subscription
}

pub fn create_test_invoice(overrides: impl FnOnce(&mut BillingInvoice)) -> BillingInvoice {
    let now = Utc::now();
    let mut invoice = BillingInvoice {
        id: format!("in_{}", Uuid::new_v4().simple()),
        customer_id: "cus_test".to_string(),
        subscription_id: None,
        period_start: Some(now - Duration::days(1)),
        period_end: Some(now + Duration::days(29)),
        created: now,
    };
    overrides(&mut invoice);
    invoice
}

pub fn test_user() -> CurrentUser {
    CurrentUser {
        id: Uuid::new_v4(),
        email: Some("listener@example.com".to_string()),
    }
}

/// Builds a `Stripe-Signature` header for `body` signed at `timestamp`.
pub fn sign_stripe_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
