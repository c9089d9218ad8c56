use axum::http::{HeaderMap, header::AUTHORIZATION};
use axum_extra::extract::CookieJar;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    application::jwt::{self, CurrentUser},
};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Resolves the caller from a bearer token, falling back to the session cookie.
pub fn current_user(
    headers: &HeaderMap,
    jar: &CookieJar,
    app_state: &AppState,
) -> AppResult<CurrentUser> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let token = match bearer {
        Some(token) => token.to_string(),
        None => jar
            .get(ACCESS_TOKEN_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or(AppError::InvalidCredentials)?,
    };

    jwt::current_user(
        &token,
        &app_state.config.jwt_audience,
        &app_state.config.jwt_secret,
    )
}
