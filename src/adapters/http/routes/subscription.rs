use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    adapters::http::{app_state::AppState, auth::current_user},
    app_error::{AppError, AppResult},
    application::use_cases::{
        subscription::SubscriptionStatusView,
        usage::{RecordUsageInput, UsageLogProfile},
    },
    domain::entities::{
        access::{WarningLevel, percent_used},
        source_type::SourceType,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/usage", get(preflight).post(record_usage))
        .route("/usage/logs", get(list_usage_logs))
}

async fn get_status(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<Json<SubscriptionStatusView>> {
    let user = current_user(&headers, &jar, &app_state)?;
    let view = app_state.subscription_use_cases.get_status(user.id).await?;
    Ok(Json(view))
}

// ============================================================================
// Pre-flight
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreflightQuery {
    estimated_minutes: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreflightResponse {
    can_transcribe: bool,
    reason: &'static str,
    minutes_remaining: i64,
    resets_at: Option<DateTime<Utc>>,
    message: String,
}

async fn preflight(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<PreflightQuery>,
) -> AppResult<Json<PreflightResponse>> {
    let user = current_user(&headers, &jar, &app_state)?;

    let estimated_minutes = query
        .estimated_minutes
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f64>()
                .ok()
                .filter(|m| m.is_finite())
                .map(|m| m.ceil() as i64)
                .ok_or_else(|| AppError::InvalidInput("estimatedMinutes must be a number".into()))
        })
        .transpose()?;

    let result = app_state
        .subscription_use_cases
        .preflight(user.id, estimated_minutes)
        .await?;

    Ok(Json(PreflightResponse {
        can_transcribe: result.can_transcribe,
        reason: result.reason,
        minutes_remaining: result.minutes_remaining,
        resets_at: result.resets_at,
        message: result.message,
    }))
}

// ============================================================================
// Usage recording
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordUsageRequest {
    minutes: f64,
    #[serde(default)]
    source_type: SourceType,
    source_identifier: Option<String>,
    transcript_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageSnapshot {
    minutes_used: i64,
    minutes_limit: i64,
    minutes_remaining: i64,
    percent_used: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageWarningBody {
    level: WarningLevel,
    percent_used: i64,
    minutes_remaining: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordUsageResponse {
    success: bool,
    usage: UsageSnapshot,
    limit_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<UsageWarningBody>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordUsageFailure {
    success: bool,
    error: &'static str,
    message: &'static str,
    current_usage: i64,
    limit: i64,
}

async fn record_usage(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    payload: Result<Json<RecordUsageRequest>, JsonRejection>,
) -> AppResult<Response> {
    let user = current_user(&headers, &jar, &app_state)?;
    let Json(payload) =
        payload.map_err(|e| AppError::InvalidInput(format!("Invalid request body: {}", e)))?;

    let outcome = app_state
        .usage_use_cases
        .record_usage(RecordUsageInput {
            user_id: user.id,
            minutes: payload.minutes,
            source_type: payload.source_type,
            source_identifier: payload.source_identifier,
            transcript_id: payload.transcript_id,
        })
        .await?;

    if !outcome.success {
        let body = RecordUsageFailure {
            success: false,
            error: "recording_failed",
            message: "Usage could not be recorded",
            current_usage: outcome.new_minutes_used,
            limit: outcome.minutes_limit,
        };
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response());
    }

    let minutes_remaining = (outcome.minutes_limit - outcome.new_minutes_used).max(0);
    let percent = percent_used(outcome.new_minutes_used, outcome.minutes_limit);
    let warning = WarningLevel::for_percent(percent).map(|level| UsageWarningBody {
        level,
        percent_used: percent,
        minutes_remaining,
    });

    Ok(Json(RecordUsageResponse {
        success: true,
        usage: UsageSnapshot {
            minutes_used: outcome.new_minutes_used,
            minutes_limit: outcome.minutes_limit,
            minutes_remaining,
            percent_used: percent,
        },
        limit_exceeded: outcome.limit_exceeded,
        warning,
    })
    .into_response())
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: Vec<UsageLogProfile>,
}

async fn list_usage_logs(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<LogsResponse>> {
    let user = current_user(&headers, &jar, &app_state)?;
    let logs = app_state
        .usage_use_cases
        .list_logs(user.id, query.limit)
        .await?;
    Ok(Json(LogsResponse { logs }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use crate::{
        adapters::http::routes::test_support::server,
        domain::entities::subscription_status::SubscriptionStatus,
        test_utils::{
            TestAppStateBuilder, bearer_for, create_test_subscription, create_test_usage_period,
            test_user,
        },
    };

    #[tokio::test]
    async fn status_requires_authentication() {
        let server = server(TestAppStateBuilder::new().build().state);

        let response = server.get("/api/subscription/status").await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["code"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn status_rejects_token_for_other_audience() {
        let user = test_user();
        let token = crate::application::jwt::issue(
            user.id,
            None,
            "anon",
            &secrecy::SecretString::from(crate::test_utils::TEST_JWT_SECRET),
            time::Duration::minutes(5),
        )
        .unwrap();
        let server = server(TestAppStateBuilder::new().build().state);

        let response = server
            .get("/api/subscription/status")
            .add_header("Authorization", format!("Bearer {}", token))
            .await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_for_user_without_subscription() {
        let user = test_user();
        let server = server(TestAppStateBuilder::new().build().state);

        let response = server
            .get("/api/subscription/status")
            .add_header("Authorization", bearer_for(&user))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["status"], "none");
        assert_eq!(body["access"]["allowed"], false);
        assert_eq!(body["access"]["reason"], "no_subscription");
        assert_eq!(body["access"]["action_url"], "/pricing");
    }

    #[tokio::test]
    async fn status_accepts_session_cookie() {
        let user = test_user();
        let token = bearer_for(&user).trim_start_matches("Bearer ").to_string();
        let server = server(
            TestAppStateBuilder::new()
                .with_subscription(create_test_subscription(|s| s.user_id = user.id))
                .with_usage_period(create_test_usage_period(|p| {
                    p.user_id = user.id;
                    p.minutes_used = 540;
                }))
                .build()
                .state,
        );

        let response = server
            .get("/api/subscription/status")
            .add_header("Cookie", format!("access_token={}", token))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["status"], "active");
        assert_eq!(body["usage"]["minutes_used"], 540);
        assert_eq!(body["usage"]["percent_used"], 90);
        assert_eq!(body["access"]["warning"]["level"], "critical");
    }

    #[tokio::test]
    async fn preflight_uses_camel_case() {
        let user = test_user();
        let server = server(
            TestAppStateBuilder::new()
                .with_subscription(create_test_subscription(|s| s.user_id = user.id))
                .with_usage_period(create_test_usage_period(|p| {
                    p.user_id = user.id;
                    p.minutes_used = 100;
                }))
                .build()
                .state,
        );

        let response = server
            .get("/api/subscription/usage")
            .add_query_param("estimatedMinutes", "12.5")
            .add_header("Authorization", bearer_for(&user))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["canTranscribe"], true);
        assert_eq!(body["reason"], "ok");
        assert_eq!(body["minutesRemaining"], 500);
        assert!(body["resetsAt"].is_string());
    }

    #[tokio::test]
    async fn preflight_rejects_non_numeric_estimate() {
        let user = test_user();
        let server = server(TestAppStateBuilder::new().build().state);

        let response = server
            .get("/api/subscription/usage")
            .add_query_param("estimatedMinutes", "lots")
            .add_header("Authorization", bearer_for(&user))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn preflight_reports_payment_failure() {
        let user = test_user();
        let server = server(
            TestAppStateBuilder::new()
                .with_subscription(create_test_subscription(|s| {
                    s.user_id = user.id;
                    s.status = SubscriptionStatus::PastDue;
                }))
                .build()
                .state,
        );

        let response = server
            .get("/api/subscription/usage")
            .add_header("Authorization", bearer_for(&user))
            .await;

        let body: Value = response.json();
        assert_eq!(body["canTranscribe"], false);
        assert_eq!(body["reason"], "payment_failed");
    }

    #[tokio::test]
    async fn record_usage_returns_usage_and_warning() {
        let user = test_user();
        let app = TestAppStateBuilder::new()
            .with_subscription(create_test_subscription(|s| s.user_id = user.id))
            .with_usage_period(create_test_usage_period(|p| {
                p.user_id = user.id;
                p.minutes_used = 470;
            }))
            .build();
        let server = server(app.state.clone());

        let response = server
            .post("/api/subscription/usage")
            .add_header("Authorization", bearer_for(&user))
            .json(&json!({
                "minutes": 9.2,
                "sourceType": "youtube",
                "sourceIdentifier": "dQw4w9WgXcQ"
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["usage"]["minutesUsed"], 480);
        assert_eq!(body["usage"]["minutesRemaining"], 120);
        assert_eq!(body["usage"]["percentUsed"], 80);
        assert_eq!(body["limitExceeded"], false);
        assert_eq!(body["warning"]["level"], "approaching");
        assert_eq!(app.usage.logs_for(user.id).len(), 1);
    }

    #[tokio::test]
    async fn record_usage_over_limit_is_committed() {
        let user = test_user();
        let server = server(
            TestAppStateBuilder::new()
                .with_subscription(create_test_subscription(|s| s.user_id = user.id))
                .with_usage_period(create_test_usage_period(|p| {
                    p.user_id = user.id;
                    p.minutes_used = 590;
                }))
                .build()
                .state,
        );

        let response = server
            .post("/api/subscription/usage")
            .add_header("Authorization", bearer_for(&user))
            .json(&json!({ "minutes": 15 }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["limitExceeded"], true);
        assert_eq!(body["usage"]["minutesUsed"], 605);
        assert_eq!(body["usage"]["minutesRemaining"], 0);

        let next = server
            .get("/api/subscription/usage")
            .add_header("Authorization", bearer_for(&user))
            .await;
        let next: Value = next.json();
        assert_eq!(next["canTranscribe"], false);
        assert_eq!(next["reason"], "limit_reached");
    }

    #[tokio::test]
    async fn record_usage_without_period_is_recording_failed() {
        let user = test_user();
        let server = server(TestAppStateBuilder::new().build().state);

        let response = server
            .post("/api/subscription/usage")
            .add_header("Authorization", bearer_for(&user))
            .json(&json!({ "minutes": 3 }))
            .await;

        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "recording_failed");
        assert_eq!(body["currentUsage"], 0);
        assert_eq!(body["limit"], 0);
    }

    #[tokio::test]
    async fn record_usage_rejects_bad_bodies() {
        let user = test_user();
        let server = server(
            TestAppStateBuilder::new()
                .with_usage_period(create_test_usage_period(|p| p.user_id = user.id))
                .build()
                .state,
        );

        for body in [
            json!({ "minutes": -2 }),
            json!({ "minutes": "ten" }),
            json!({ "minutes": 1, "sourceType": "podcast" }),
        ] {
            let response = server
                .post("/api/subscription/usage")
                .add_header("Authorization", bearer_for(&user))
                .json(&body)
                .await;
            assert_eq!(response.status_code(), StatusCode::BAD_REQUEST, "body: {}", body);
        }
    }

    #[tokio::test]
    async fn usage_logs_are_newest_first() {
        let user = test_user();
        let server = server(
            TestAppStateBuilder::new()
                .with_usage_period(create_test_usage_period(|p| p.user_id = user.id))
                .build()
                .state,
        );

        for minutes in [1, 2, 3] {
            server
                .post("/api/subscription/usage")
                .add_header("Authorization", bearer_for(&user))
                .json(&json!({ "minutes": minutes }))
                .await
                .assert_status_ok();
        }

        let response = server
            .get("/api/subscription/usage/logs")
            .add_query_param("limit", 2)
            .add_header("Authorization", bearer_for(&user))
            .await;

        let body: Value = response.json();
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["minutes_charged"], 3);
        assert_eq!(logs[1]["minutes_charged"], 2);
    }
}
