//! Access decision values.
//!
//! A denial is a normal result, not an error: callers render the message and
//! the remediation link and move on.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const WARNING_APPROACHING_PERCENT: i64 = 80;
pub const WARNING_CRITICAL_PERCENT: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoSubscription,
    PaymentFailed,
    Canceled,
    Inactive,
    NoUsagePeriod,
    LimitReached,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NoSubscription => "no_subscription",
            DenialReason::PaymentFailed => "payment_failed",
            DenialReason::Canceled => "canceled",
            DenialReason::Inactive => "inactive",
            DenialReason::NoUsagePeriod => "no_usage_period",
            DenialReason::LimitReached => "limit_reached",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            DenialReason::NoSubscription => "Subscribe to start transcribing",
            DenialReason::PaymentFailed => "Payment failed",
            DenialReason::Canceled => "Subscription canceled",
            DenialReason::Inactive => "Subscription inactive",
            DenialReason::NoUsagePeriod => "Something went wrong",
            DenialReason::LimitReached => "Monthly limit reached",
        }
    }

    pub fn action_label(&self) -> &'static str {
        match self {
            DenialReason::NoSubscription => "View plans",
            DenialReason::PaymentFailed => "Update payment method",
            DenialReason::Canceled => "Resubscribe",
            DenialReason::Inactive => "Manage subscription",
            DenialReason::NoUsagePeriod => "Contact support",
            DenialReason::LimitReached => "Upgrade plan",
        }
    }

    pub fn action_url(&self) -> &'static str {
        match self {
            DenialReason::NoSubscription | DenialReason::Canceled | DenialReason::LimitReached => {
                "/pricing"
            }
            DenialReason::PaymentFailed | DenialReason::Inactive => "/settings/billing",
            DenialReason::NoUsagePeriod => "/support",
        }
    }

    /// Message for the status endpoint. `resets_at` only matters for `LimitReached`.
    pub fn message(&self, resets_at: Option<DateTime<Utc>>) -> String {
        match self {
            DenialReason::NoSubscription => "You need an active subscription to transcribe.".into(),
            DenialReason::PaymentFailed => {
                "Your payment failed. Please update your payment method to continue.".into()
            }
            DenialReason::Canceled => "Your subscription has been canceled.".into(),
            DenialReason::Inactive => "Your subscription is not active.".into(),
            DenialReason::NoUsagePeriod => {
                "Unable to determine usage. Please contact support.".into()
            }
            DenialReason::LimitReached => format!(
                "You've used all your transcription minutes for this billing period. Resets on {}.",
                format_reset_date(resets_at)
            ),
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Approaching,
    Critical,
}

impl WarningLevel {
    pub fn for_percent(percent_used: i64) -> Option<Self> {
        if percent_used >= WARNING_CRITICAL_PERCENT {
            Some(WarningLevel::Critical)
        } else if percent_used >= WARNING_APPROACHING_PERCENT {
            Some(WarningLevel::Approaching)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageWarning {
    pub level: WarningLevel,
    pub percent_used: i64,
    pub minutes_remaining: i64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<UsageWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_label: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<&'static str>,
}

impl AccessResult {
    pub fn allowed(warning: Option<UsageWarning>) -> Self {
        AccessResult {
            allowed: true,
            reason: None,
            message: "OK".into(),
            warning,
            title: None,
            action_label: None,
            action_url: None,
        }
    }

    pub fn denied(reason: DenialReason, resets_at: Option<DateTime<Utc>>) -> Self {
        AccessResult {
            allowed: false,
            reason: Some(reason),
            message: reason.message(resets_at),
            warning: None,
            title: Some(reason.title()),
            action_label: Some(reason.action_label()),
            action_url: Some(reason.action_url()),
        }
    }
}

/// `round(100 * used / limit)`. A zero limit counts as fully used.
pub fn percent_used(minutes_used: i64, minutes_limit: i64) -> i64 {
    if minutes_limit <= 0 {
        return 100;
    }
    ((minutes_used as f64 / minutes_limit as f64) * 100.0).round() as i64
}

/// Day and full month name, e.g. `15 November`.
pub fn format_reset_date(resets_at: Option<DateTime<Utc>>) -> String {
    match resets_at {
        Some(at) => at.format("%-d %B").to_string(),
        None => "your next billing period".into(),
    }
}
