use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::usage::{
        NewUsagePeriod, UsageCharge, UsageLogProfile, UsagePeriodProfile, UsageRepoTrait,
    },
};

fn row_to_period(row: &sqlx::postgres::PgRow) -> UsagePeriodProfile {
    UsagePeriodProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        subscription_id: row.get("subscription_id"),
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        minutes_used: row.get("minutes_used"),
        minutes_limit: row.get("minutes_limit"),
        created_at: row.get("created_at"),
    }
}

fn row_to_log(row: &sqlx::postgres::PgRow) -> UsageLogProfile {
    UsageLogProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        usage_period_id: row.get("usage_period_id"),
        transcript_id: row.get("transcript_id"),
        source_type: row.get("source_type"),
        source_identifier: row.get("source_identifier"),
        minutes_charged: row.get("minutes_charged"),
        created_at: row.get("created_at"),
    }
}

const PERIOD_COLS: &str = r#"
    id, user_id, subscription_id, period_start, period_end,
    minutes_used, minutes_limit, created_at
"#;

const LOG_COLS: &str = r#"
    id, user_id, usage_period_id, transcript_id, source_type,
    source_identifier, minutes_charged, created_at
"#;

#[async_trait]
impl UsageRepoTrait for PostgresPersistence {
    async fn get_current_period(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriodProfile>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM usage_periods
            WHERE user_id = $1 AND period_start <= $2 AND period_end > $2
            ORDER BY period_start DESC
            LIMIT 1
            "#,
            PERIOD_COLS
        ))
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_period))
    }

    async fn create_period_if_absent(
        &self,
        period: &NewUsagePeriod,
    ) -> AppResult<(UsagePeriodProfile, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO usage_periods (
                user_id, subscription_id, period_start, period_end, minutes_used, minutes_limit
            )
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (user_id, period_start) DO NOTHING
            RETURNING {}
            "#,
            PERIOD_COLS
        ))
        .bind(period.user_id)
        .bind(period.subscription_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.minutes_limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        if let Some(row) = inserted {
            return Ok((row_to_period(&row), true));
        }

        let existing = sqlx::query(&format!(
            "SELECT {} FROM usage_periods WHERE user_id = $1 AND period_start = $2",
            PERIOD_COLS
        ))
        .bind(period.user_id)
        .bind(period.period_start)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok((row_to_period(&existing), false))
    }

    async fn charge_current_period(
        &self,
        charge: &UsageCharge,
    ) -> AppResult<Option<UsagePeriodProfile>> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        // Single-statement increment; concurrent charges queue on the row lock.
        let row = sqlx::query(&format!(
            r#"
            UPDATE usage_periods
            SET minutes_used = minutes_used + $3, updated_at = now()
            WHERE id = (
                SELECT id FROM usage_periods
                WHERE user_id = $1 AND period_start <= $2 AND period_end > $2
                ORDER BY period_start DESC
                LIMIT 1
            )
            RETURNING {}
            "#,
            PERIOD_COLS
        ))
        .bind(charge.user_id)
        .bind(charge.at)
        .bind(charge.minutes)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(None);
        };
        let period = row_to_period(&row);

        sqlx::query(
            r#"
            INSERT INTO usage_logs (
                user_id, usage_period_id, transcript_id, source_type, source_identifier, minutes_charged
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(charge.user_id)
        .bind(period.id)
        .bind(charge.transcript_id)
        .bind(charge.source_type)
        .bind(&charge.source_identifier)
        .bind(charge.minutes)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(period))
    }

    async fn list_logs(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<UsageLogProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM usage_logs WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            LOG_COLS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_log).collect())
    }
}
