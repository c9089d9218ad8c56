use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    adapters::http::{app_state::AppState, auth::current_user},
    app_error::{AppError, AppResult},
    application::use_cases::{
        billing_reconciler::EventOutcome,
        subscription::{CheckoutInput, SubscriptionSummary},
    },
    infra::stripe_client::{parse_webhook_event, verify_webhook_signature},
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create-checkout", post(create_checkout))
        .route("/create-portal", post(create_portal))
        .route("/cancel", post(cancel_subscription))
        .route("/resume", post(resume_subscription))
        .route("/webhook", post(webhook))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest {
    price_lookup_key: String,
    success_url: Option<String>,
    cancel_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutResponse {
    url: String,
    session_id: String,
}

async fn create_checkout(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> AppResult<Json<CheckoutResponse>> {
    let user = current_user(&headers, &jar, &app_state)?;
    let Json(payload) =
        payload.map_err(|e| AppError::InvalidInput(format!("Invalid request body: {}", e)))?;

    let session = app_state
        .subscription_use_cases
        .create_checkout(
            &user,
            CheckoutInput {
                price_lookup_key: payload.price_lookup_key,
                success_url: payload.success_url,
                cancel_url: payload.cancel_url,
            },
        )
        .await?;

    Ok(Json(CheckoutResponse {
        url: session.url,
        session_id: session.id,
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PortalRequest {
    return_url: Option<String>,
}

async fn create_portal(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let user = current_user(&headers, &jar, &app_state)?;
    // The body is optional.
    let payload: PortalRequest = if body.is_empty() {
        PortalRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::InvalidInput(format!("Invalid request body: {}", e)))?
    };

    let url = app_state
        .subscription_use_cases
        .create_portal(user.id, payload.return_url)
        .await?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Serialize)]
struct SubscriptionResponse {
    subscription: SubscriptionSummary,
}

async fn cancel_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<Json<SubscriptionResponse>> {
    let user = current_user(&headers, &jar, &app_state)?;
    let record = app_state
        .subscription_use_cases
        .cancel_at_period_end(user.id)
        .await?;
    info!(user_id = %user.id, "Subscription set to cancel at period end");
    Ok(Json(SubscriptionResponse {
        subscription: SubscriptionSummary::from(&record),
    }))
}

async fn resume_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<Json<SubscriptionResponse>> {
    let user = current_user(&headers, &jar, &app_state)?;
    let record = app_state.subscription_use_cases.resume(user.id).await?;
    info!(user_id = %user.id, "Pending cancellation withdrawn");
    Ok(Json(SubscriptionResponse {
        subscription: SubscriptionSummary::from(&record),
    }))
}

// ============================================================================
// Webhook
// ============================================================================

/// Whether Stripe should redeliver after this error.
///
/// Transient failures answer 5xx so Stripe retries. Anything that would fail
/// the same way again is logged and acknowledged.
fn is_retryable_error(error: &AppError) -> bool {
    match error {
        AppError::Database(_) => true,
        AppError::Internal(_) => true,
        AppError::Upstream(_) => true,

        AppError::NotFound => false,
        AppError::InvalidInput(_) => false,
        AppError::InvalidSignature(_) => false,
        AppError::InvalidCredentials => false,
        AppError::NoBillingAccount => false,
        AppError::SubscriptionConflict => false,
    }
}

async fn webhook(State(app_state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let Some(signature) = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        warn!("Webhook request without Stripe-Signature header");
        return AppError::InvalidSignature("Missing signature header".into()).into_response();
    };

    if let Err(e) = verify_webhook_signature(
        &body,
        signature,
        &app_state.config.stripe_webhook_secret,
        app_state.config.webhook_tolerance_secs,
    ) {
        warn!(error = %e, "Webhook signature verification failed");
        return e.into_response();
    }

    let envelope = match parse_webhook_event(&body) {
        Ok(envelope) => envelope,
        Err(e) => return e.into_response(),
    };
    let event_id = envelope.id.clone();
    let event_type = envelope.event_type.clone();

    match app_state.reconciler.handle_event(envelope).await {
        Ok(outcome) => {
            if outcome == EventOutcome::Applied {
                info!(event_id, event_type, "Webhook event applied");
            }
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(e) if is_retryable_error(&e) => {
            error!(
                error = %e,
                event_id,
                event_type,
                retryable = true,
                "Webhook handler failed, requesting redelivery"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Webhook handler failed" })),
            )
                .into_response()
        }
        Err(e) => {
            error!(
                error = %e,
                event_id,
                event_type,
                retryable = false,
                "Webhook handler failed permanently, acknowledging"
            );
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
    }
}
