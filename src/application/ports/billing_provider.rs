//! Port to the external billing system.
//!
//! Everything the use cases need from Stripe goes through `BillingProvider`;
//! webhook payloads are decoded into `BillingEvent` before they reach the
//! reconciler so no use case touches provider JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::domain::entities::plan::BillingInterval;

/// Metadata key carrying our user id on customers, sessions and subscriptions.
pub const USER_ID_METADATA_KEY: &str = "supabase_user_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingPrice {
    pub id: String,
    pub lookup_key: Option<String>,
    pub interval: Option<BillingInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSubscription {
    pub id: String,
    pub customer_id: String,
    /// Raw provider status, mapped with `SubscriptionStatus::from_stripe`.
    pub status: String,
    pub price: Option<BillingPrice>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    /// User id from metadata, if the subscription was created by our checkout.
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckout {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingInvoice {
    pub id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl BillingInvoice {
    /// Billing window covered by the invoice, defaulting to 30 days from its start.
    /// A subscription's first invoice reports an empty window (start == end ==
    /// creation), which is treated as absent.
    pub fn billing_period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.period_start.unwrap_or(self.created);
        let end = self
            .period_end
            .filter(|end| *end > start)
            .unwrap_or(start + chrono::Duration::days(30));
        (start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted(CompletedCheckout),
    SubscriptionCreated(BillingSubscription),
    SubscriptionUpdated(BillingSubscription),
    SubscriptionDeleted(BillingSubscription),
    InvoicePaid(BillingInvoice),
    InvoicePaymentFailed(BillingInvoice),
    /// Known event type whose object could not be decoded.
    Malformed(String),
    Unhandled,
}

impl BillingEvent {
    /// Customer the event belongs to; events are serialized per customer.
    pub fn customer_id(&self) -> Option<&str> {
        match self {
            BillingEvent::CheckoutCompleted(session) => session.customer_id.as_deref(),
            BillingEvent::SubscriptionCreated(sub)
            | BillingEvent::SubscriptionUpdated(sub)
            | BillingEvent::SubscriptionDeleted(sub) => Some(&sub.customer_id),
            BillingEvent::InvoicePaid(invoice) | BillingEvent::InvoicePaymentFailed(invoice) => {
                Some(&invoice.customer_id)
            }
            BillingEvent::Malformed(_) | BillingEvent::Unhandled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingEventEnvelope {
    pub id: String,
    pub event_type: String,
    pub event: BillingEvent,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub user_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str) -> AppResult<BillingSubscription>;

    async fn find_price_by_lookup_key(&self, lookup_key: &str) -> AppResult<Option<BillingPrice>>;

    /// Returns the customer tagged with `user_id`, creating it on first use.
    async fn find_or_create_customer(&self, user_id: Uuid, email: Option<&str>)
    -> AppResult<String>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> AppResult<CheckoutSession>;

    /// Returns the hosted portal URL.
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
    -> AppResult<String>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> AppResult<BillingSubscription>;
}
