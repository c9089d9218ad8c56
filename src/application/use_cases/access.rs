//! Access decision.
//!
//! `decide_access` is pure and total: every combination of inputs yields a
//! result, and denials are values rather than errors.

use crate::application::use_cases::subscription::SubscriptionProfile;
use crate::application::use_cases::usage::UsagePeriodProfile;
use crate::domain::entities::access::{
    AccessResult, DenialReason, UsageWarning, WarningLevel, percent_used,
};
use crate::domain::entities::subscription_status::SubscriptionStatus;

/// First matching rule wins:
/// no record, payment failed, canceled, not active, no period, limit reached,
/// then allowed with an optional warning.
pub fn decide_access(
    subscription: Option<&SubscriptionProfile>,
    usage_period: Option<&UsagePeriodProfile>,
) -> AccessResult {
    let Some(subscription) = subscription else {
        return AccessResult::denied(DenialReason::NoSubscription, None);
    };

    if subscription.status.is_payment_failed() {
        return AccessResult::denied(DenialReason::PaymentFailed, None);
    }
    if subscription.status == SubscriptionStatus::Canceled {
        return AccessResult::denied(DenialReason::Canceled, None);
    }
    if !subscription.status.is_active() {
        return AccessResult::denied(DenialReason::Inactive, None);
    }

    let Some(period) = usage_period else {
        return AccessResult::denied(DenialReason::NoUsagePeriod, None);
    };

    let used = i64::from(period.minutes_used);
    let limit = i64::from(period.minutes_limit);
    if used >= limit {
        return AccessResult::denied(DenialReason::LimitReached, Some(period.period_end));
    }

    let percent = percent_used(used, limit);
    let warning = WarningLevel::for_percent(percent).map(|level| UsageWarning {
        level,
        percent_used: percent,
        minutes_remaining: period.minutes_remaining(),
        resets_at: period.period_end,
    });

    AccessResult::allowed(warning)
}
