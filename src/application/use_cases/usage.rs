use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::application::validators::is_valid_source_identifier;
use crate::domain::entities::source_type::SourceType;

/// Default number of audit entries returned when listing usage history.
pub const DEFAULT_LOG_PAGE_SIZE: i64 = 50;
pub const MAX_LOG_PAGE_SIZE: i64 = 200;

// ============================================================================
// Profile Types
// ============================================================================

/// One billing cycle's ledger entry for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsagePeriodProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub minutes_used: i32,
    pub minutes_limit: i32,
    pub created_at: DateTime<Utc>,
}

impl UsagePeriodProfile {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at < self.period_end
    }

    pub fn minutes_remaining(&self) -> i64 {
        (i64::from(self.minutes_limit) - i64::from(self.minutes_used)).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageLogProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub usage_period_id: Uuid,
    pub transcript_id: Option<Uuid>,
    pub source_type: SourceType,
    pub source_identifier: Option<String>,
    pub minutes_charged: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsagePeriod {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub minutes_limit: i32,
}

/// A charge against the period containing `at`.
#[derive(Debug, Clone)]
pub struct UsageCharge {
    pub user_id: Uuid,
    pub minutes: i32,
    pub source_type: SourceType,
    pub source_identifier: Option<String>,
    pub transcript_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait UsageRepoTrait: Send + Sync {
    /// The period whose `[period_start, period_end)` contains `at`.
    async fn get_current_period(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriodProfile>>;

    /// Inserts the period unless one already starts at `period_start` for the user.
    /// Returns the stored period and whether it was created by this call.
    async fn create_period_if_absent(
        &self,
        period: &NewUsagePeriod,
    ) -> AppResult<(UsagePeriodProfile, bool)>;

    /// Atomically adds `charge.minutes` to the current period and appends an
    /// audit entry. Returns `None` when no period contains `charge.at`.
    async fn charge_current_period(
        &self,
        charge: &UsageCharge,
    ) -> AppResult<Option<UsagePeriodProfile>>;

    async fn list_logs(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<UsageLogProfile>>;
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUsageOutcome {
    pub success: bool,
    pub new_minutes_used: i64,
    pub minutes_limit: i64,
    pub limit_exceeded: bool,
}

#[derive(Debug, Clone)]
pub struct RecordUsageInput {
    pub user_id: Uuid,
    pub minutes: f64,
    pub source_type: SourceType,
    pub source_identifier: Option<String>,
    pub transcript_id: Option<Uuid>,
}

/// Partial minutes always round up. Negative, NaN and infinite inputs are rejected.
pub fn minutes_to_charge(minutes: f64) -> AppResult<i32> {
    if !minutes.is_finite() {
        return Err(AppError::InvalidInput("Invalid minutes value".into()));
    }
    if minutes < 0.0 {
        return Err(AppError::InvalidInput("Invalid minutes value".into()));
    }
    let rounded = minutes.ceil();
    if rounded > f64::from(i32::MAX) {
        return Err(AppError::InvalidInput("Minutes value too large".into()));
    }
    Ok(rounded as i32)
}

#[derive(Clone)]
pub struct UsageUseCases {
    usage_repo: Arc<dyn UsageRepoTrait>,
}

impl UsageUseCases {
    pub fn new(usage_repo: Arc<dyn UsageRepoTrait>) -> Self {
        Self { usage_repo }
    }

    /// Charges a finished transcription against the user's current period.
    ///
    /// Overage is committed: work already done is billed, and the next
    /// access check blocks. `success` is false only when there is no period
    /// to charge.
    #[instrument(skip(self), fields(user_id = %input.user_id))]
    pub async fn record_usage(&self, input: RecordUsageInput) -> AppResult<RecordUsageOutcome> {
        let minutes = minutes_to_charge(input.minutes)?;

        if let Some(identifier) = input.source_identifier.as_deref() {
            if !is_valid_source_identifier(identifier) {
                return Err(AppError::InvalidInput("Invalid source identifier".into()));
            }
        }

        let charge = UsageCharge {
            user_id: input.user_id,
            minutes,
            source_type: input.source_type,
            source_identifier: input.source_identifier,
            transcript_id: input.transcript_id,
            at: Utc::now(),
        };

        let Some(period) = self.usage_repo.charge_current_period(&charge).await? else {
            tracing::error!(
                user_id = %input.user_id,
                minutes,
                "No current usage period to charge; usage not recorded"
            );
            return Ok(RecordUsageOutcome {
                success: false,
                new_minutes_used: 0,
                minutes_limit: 0,
                limit_exceeded: false,
            });
        };

        let limit_exceeded = period.minutes_used > period.minutes_limit;
        if limit_exceeded {
            tracing::info!(
                user_id = %input.user_id,
                period_id = %period.id,
                minutes_used = period.minutes_used,
                minutes_limit = period.minutes_limit,
                "Usage charge pushed period over its limit"
            );
        }

        Ok(RecordUsageOutcome {
            success: true,
            new_minutes_used: i64::from(period.minutes_used),
            minutes_limit: i64::from(period.minutes_limit),
            limit_exceeded,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_logs(&self, user_id: Uuid, limit: Option<i64>) -> AppResult<Vec<UsageLogProfile>> {
        let limit = limit
            .unwrap_or(DEFAULT_LOG_PAGE_SIZE)
            .clamp(1, MAX_LOG_PAGE_SIZE);
        self.usage_repo.list_logs(user_id, limit).await
    }
}
