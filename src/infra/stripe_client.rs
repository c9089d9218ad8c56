//! Stripe REST client and webhook decoding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::application::ports::billing_provider::{
    BillingEvent, BillingEventEnvelope, BillingInvoice, BillingPrice, BillingProvider,
    BillingSubscription, CheckoutSession, CheckoutSessionRequest, CompletedCheckout,
    USER_ID_METADATA_KEY,
};
use crate::domain::entities::plan::BillingInterval;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// TCP + TLS handshake budget; the overall request timeout is configured.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: SecretString,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: SecretString, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            secret_key,
            api_base: STRIPE_API_BASE.to_string(),
        })
    }

    fn auth_header(&self) -> String {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:", self.secret_key.expose_secret()));
        format!("Basic {}", encoded)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> AppResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await
            .map_err(request_error)?;
        self.handle_response(response).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> AppResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .header("Authorization", self.auth_header())
            .form(params)
            .send()
            .await
            .map_err(request_error)?;
        self.handle_response(response).await
    }

    async fn create_customer(&self, user_id: Uuid, email: Option<&str>) -> AppResult<StripeCustomer> {
        let mut params = vec![(
            format!("metadata[{}]", USER_ID_METADATA_KEY),
            user_id.to_string(),
        )];
        if let Some(email) = email {
            params.push(("email".to_string(), email.to_string()));
        }
        self.post("/customers", &params).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> AppResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to read Stripe response: {}", e)))?;

        if !status.is_success() {
            tracing::error!(status = %status, body = %body, "Stripe API error");

            if let Ok(error) = serde_json::from_str::<StripeErrorResponse>(&body) {
                return Err(AppError::Upstream(format!(
                    "Stripe error: {}",
                    error.error.message.unwrap_or(error.error.error_type)
                )));
            }
            return Err(AppError::Upstream(format!("Stripe API error: {}", status)));
        }

        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(body = %body, error = %e, "Failed to parse Stripe response");
            AppError::Upstream(format!("Failed to parse Stripe response: {}", e))
        })
    }
}

fn request_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        tracing::error!(error = %e, "Stripe request timed out");
        AppError::Upstream("Stripe request timed out".into())
    } else {
        AppError::Upstream(format!("Stripe request failed: {}", e))
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_subscription(&self, subscription_id: &str) -> AppResult<BillingSubscription> {
        let subscription: StripeSubscription = self
            .get(
                &format!("/subscriptions/{}", subscription_id),
                &[("expand[]", "items.data.price".to_string())],
            )
            .await?;
        subscription.into_billing().map_err(AppError::Upstream)
    }

    async fn find_price_by_lookup_key(&self, lookup_key: &str) -> AppResult<Option<BillingPrice>> {
        let prices: StripeList<StripePrice> = self
            .get(
                "/prices",
                &[
                    ("lookup_keys[]", lookup_key.to_string()),
                    ("active", "true".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(prices.data.into_iter().next().map(StripePrice::into_billing))
    }

    async fn find_or_create_customer(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> AppResult<String> {
        let existing: StripeList<StripeCustomer> = self
            .get(
                "/customers/search",
                &[
                    (
                        "query",
                        format!("metadata['{}']:'{}'", USER_ID_METADATA_KEY, user_id),
                    ),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        if let Some(customer) = existing.data.into_iter().next() {
            return Ok(customer.id);
        }

        let customer = self.create_customer(user_id, email).await?;
        tracing::info!(user_id = %user_id, stripe_customer_id = %customer.id, "Created Stripe customer");
        Ok(customer.id)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> AppResult<CheckoutSession> {
        let user_id = request.user_id.to_string();
        let params: Vec<(String, String)> = vec![
            ("customer".into(), request.customer_id),
            ("mode".into(), "subscription".into()),
            ("line_items[0][price]".into(), request.price_id),
            ("line_items[0][quantity]".into(), "1".into()),
            ("success_url".into(), request.success_url),
            ("cancel_url".into(), request.cancel_url),
            ("client_reference_id".into(), user_id.clone()),
            (format!("metadata[{}]", USER_ID_METADATA_KEY), user_id.clone()),
            (
                format!("subscription_data[metadata][{}]", USER_ID_METADATA_KEY),
                user_id,
            ),
            ("billing_address_collection".into(), "required".into()),
            ("allow_promotion_codes".into(), "true".into()),
        ];

        let session: StripeCheckoutSession = self.post("/checkout/sessions", &params).await?;
        let url = session
            .url
            .ok_or_else(|| AppError::Upstream("Checkout session has no URL".into()))?;
        Ok(CheckoutSession {
            id: session.id,
            url,
        })
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> AppResult<String> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        let session: StripePortalSession = self.post("/billing_portal/sessions", &params).await?;
        Ok(session.url)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> AppResult<BillingSubscription> {
        let params = vec![
            (
                "cancel_at_period_end".to_string(),
                cancel_at_period_end.to_string(),
            ),
            ("expand[]".to_string(), "items.data.price".to_string()),
        ];
        let subscription: StripeSubscription = self
            .post(&format!("/subscriptions/{}", subscription_id), &params)
            .await?;
        subscription.into_billing().map_err(AppError::Upstream)
    }
}

// ============================================================================
// Webhooks
// ============================================================================

/// Verifies a `Stripe-Signature` header (`t=...,v1=...`) over the raw body.
pub fn verify_webhook_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &SecretString,
    tolerance_secs: i64,
) -> AppResult<()> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| AppError::InvalidSignature("Missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(AppError::InvalidSignature("Missing signature".into()));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(webhook_secret.expose_secret().as_bytes())
        .map_err(|_| AppError::Internal("HMAC error".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if !signatures
        .iter()
        .any(|sig| constant_time_compare(sig, &expected))
    {
        return Err(AppError::InvalidSignature("Signature mismatch".into()));
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AppError::InvalidSignature("Invalid timestamp".into()))?;
    if (Utc::now().timestamp() - ts).abs() > tolerance_secs {
        return Err(AppError::InvalidSignature("Timestamp outside tolerance".into()));
    }

    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Decodes a verified webhook body. An unreadable envelope is `InvalidInput`;
/// a known event whose object fails to decode becomes `BillingEvent::Malformed`.
pub fn parse_webhook_event(payload: &str) -> AppResult<BillingEventEnvelope> {
    let event: StripeWebhookEvent = serde_json::from_str(payload)
        .map_err(|e| AppError::InvalidInput(format!("Invalid webhook payload: {}", e)))?;

    let object = event.data.object;
    let decoded = match event.event_type.as_str() {
        "checkout.session.completed" => {
            decode::<StripeCheckoutSession>(object).map(|s| BillingEvent::CheckoutCompleted(s.into_completed()))
        }
        "customer.subscription.created" => {
            decode_subscription(object).map(BillingEvent::SubscriptionCreated)
        }
        "customer.subscription.updated" => {
            decode_subscription(object).map(BillingEvent::SubscriptionUpdated)
        }
        "customer.subscription.deleted" => {
            decode_subscription(object).map(BillingEvent::SubscriptionDeleted)
        }
        "invoice.paid" => decode_invoice(object).map(BillingEvent::InvoicePaid),
        "invoice.payment_failed" => decode_invoice(object).map(BillingEvent::InvoicePaymentFailed),
        _ => Ok(BillingEvent::Unhandled),
    };

    Ok(BillingEventEnvelope {
        id: event.id,
        event_type: event.event_type,
        event: decoded.unwrap_or_else(BillingEvent::Malformed),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(object: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(object).map_err(|e| e.to_string())
}

fn decode_subscription(object: serde_json::Value) -> Result<BillingSubscription, String> {
    decode::<StripeSubscription>(object)?.into_billing()
}

fn decode_invoice(object: serde_json::Value) -> Result<BillingInvoice, String> {
    decode::<StripeInvoice>(object)?.into_billing()
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(USER_ID_METADATA_KEY)
        .and_then(|v| Uuid::parse_str(v).ok())
}

// ============================================================================
// Stripe Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    id: String,
    lookup_key: Option<String>,
    recurring: Option<StripePriceRecurring>,
}

#[derive(Debug, Deserialize)]
struct StripePriceRecurring {
    interval: String,
}

impl StripePrice {
    fn into_billing(self) -> BillingPrice {
        BillingPrice {
            interval: self
                .recurring
                .as_ref()
                .and_then(|r| BillingInterval::from_stripe(&r.interval)),
            id: self.id,
            lookup_key: self.lookup_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    customer: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    items: StripeList<StripeSubscriptionItem>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionItem {
    price: StripePrice,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

impl StripeSubscription {
    /// Newer API versions report the period on the item instead of the subscription.
    fn into_billing(self) -> Result<BillingSubscription, String> {
        let first_item = self.items.data.into_iter().next();
        let start = self
            .current_period_start
            .or_else(|| first_item.as_ref().and_then(|i| i.current_period_start))
            .and_then(timestamp)
            .ok_or_else(|| format!("subscription {} has no period start", self.id))?;
        let end = self
            .current_period_end
            .or_else(|| first_item.as_ref().and_then(|i| i.current_period_end))
            .and_then(timestamp)
            .ok_or_else(|| format!("subscription {} has no period end", self.id))?;

        Ok(BillingSubscription {
            user_id: user_id_from_metadata(&self.metadata),
            price: first_item.map(|i| i.price.into_billing()),
            id: self.id,
            customer_id: self.customer,
            status: self.status,
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at.and_then(timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl StripeCheckoutSession {
    fn into_completed(self) -> CompletedCheckout {
        let user_id = user_id_from_metadata(&self.metadata).or_else(|| {
            self.client_reference_id
                .as_deref()
                .and_then(|v| Uuid::parse_str(v).ok())
        });
        CompletedCheckout {
            session_id: self.id,
            customer_id: self.customer,
            subscription_id: self.subscription,
            user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripePortalSession {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    id: String,
    customer: String,
    subscription: Option<String>,
    parent: Option<StripeInvoiceParent>,
    period_start: Option<i64>,
    period_end: Option<i64>,
    created: i64,
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceParent {
    subscription_details: Option<StripeInvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceSubscriptionDetails {
    subscription: Option<String>,
}

impl StripeInvoice {
    fn into_billing(self) -> Result<BillingInvoice, String> {
        let created =
            timestamp(self.created).ok_or_else(|| format!("invoice {} has bad created", self.id))?;
        let subscription_id = self.subscription.or_else(|| {
            self.parent
                .and_then(|p| p.subscription_details)
                .and_then(|d| d.subscription)
        });
        Ok(BillingInvoice {
            id: self.id,
            customer_id: self.customer,
            subscription_id,
            period_start: self.period_start.filter(|&s| s > 0).and_then(timestamp),
            period_end: self.period_end.filter(|&s| s > 0).and_then(timestamp),
            created,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(rename = "type")]
    error_type: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeWebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeWebhookEventData,
}

#[derive(Debug, Deserialize)]
struct StripeWebhookEventData {
    object: serde_json::Value,
}
