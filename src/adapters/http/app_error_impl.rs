use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::app_error::{AppError, ErrorCode};
use crate::application::use_cases::subscription::BILLING_SETTINGS_PATH;

pub const PRICING_PATH: &str = "/pricing";

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_url: Option<&'static str>,
}

fn error_resp(
    status: StatusCode,
    code: ErrorCode,
    message: Option<String>,
    redirect_url: Option<&'static str>,
) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.as_str(),
            message,
            redirect_url,
        }),
    )
        .into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(_) | AppError::Upstream(_) | AppError::Internal(_) => {
                tracing::error!(error = ?self, "Request failed");
            }
            _ => tracing::debug!(error = ?self, "Request rejected"),
        }

        match self {
            AppError::Database(_) => error_resp(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::DatabaseError,
                None,
                None,
            ),
            AppError::InvalidCredentials => error_resp(
                StatusCode::UNAUTHORIZED,
                ErrorCode::InvalidCredentials,
                Some("Authentication required".into()),
                None,
            ),
            AppError::InvalidInput(msg) => {
                error_resp(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput, Some(msg), None)
            }
            AppError::InvalidSignature(_) => error_resp(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidSignature,
                Some("Invalid signature".into()),
                None,
            ),
            AppError::NotFound => error_resp(StatusCode::NOT_FOUND, ErrorCode::NotFound, None, None),
            AppError::NoBillingAccount => error_resp(
                StatusCode::NOT_FOUND,
                ErrorCode::NoBillingAccount,
                Some("No billing account found".into()),
                Some(PRICING_PATH),
            ),
            AppError::SubscriptionConflict => error_resp(
                StatusCode::CONFLICT,
                ErrorCode::SubscriptionConflict,
                Some("You already have an active subscription".into()),
                Some(BILLING_SETTINGS_PATH),
            ),
            AppError::Upstream(_) => error_resp(
                StatusCode::BAD_GATEWAY,
                ErrorCode::UpstreamError,
                Some("Billing provider unavailable, please try again".into()),
                None,
            ),
            AppError::Internal(_) => error_resp(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                None,
                None,
            ),
        }
    }
}
