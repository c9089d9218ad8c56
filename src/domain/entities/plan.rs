//! Static plan catalog.
//!
//! Plans are looked up by the lookup key attached to a Stripe price
//! (`starter_monthly`, `pro_annual`, ...) or, when configured, by the raw
//! Stripe price id. Quotas are fixed per plan and snapshotted into each
//! usage period when it opens.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

pub const STARTER_MINUTES: i32 = 600;
pub const PRO_MINUTES: i32 = 3000;

/// Currency all catalog prices are quoted in (minor units).
pub const CATALOG_CURRENCY: &str = "gbp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "plan_name", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanName {
    Starter,
    Pro,
}

impl PlanName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanName::Starter => "starter",
            PlanName::Pro => "pro",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PlanName::Starter => "Starter",
            PlanName::Pro => "Pro",
        }
    }

    pub fn minutes_limit(&self) -> i32 {
        match self {
            PlanName::Starter => STARTER_MINUTES,
            PlanName::Pro => PRO_MINUTES,
        }
    }

    /// Price in pence for the given interval.
    pub fn price_minor(&self, interval: BillingInterval) -> i64 {
        match (self, interval) {
            (PlanName::Starter, BillingInterval::Month) => 999,
            (PlanName::Starter, BillingInterval::Year) => 9900,
            (PlanName::Pro, BillingInterval::Month) => 2499,
            (PlanName::Pro, BillingInterval::Year) => 24900,
        }
    }
}

impl std::fmt::Display for PlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_interval", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    /// Parses Stripe's `price.recurring.interval`. Only month and year are sold.
    pub fn from_stripe(interval: &str) -> Option<Self> {
        match interval {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriceLookupKey {
    StarterMonthly,
    StarterAnnual,
    ProMonthly,
    ProAnnual,
}

impl PriceLookupKey {
    pub fn plan(&self) -> PlanName {
        match self {
            PriceLookupKey::StarterMonthly | PriceLookupKey::StarterAnnual => PlanName::Starter,
            PriceLookupKey::ProMonthly | PriceLookupKey::ProAnnual => PlanName::Pro,
        }
    }

    pub fn interval(&self) -> BillingInterval {
        match self {
            PriceLookupKey::StarterMonthly | PriceLookupKey::ProMonthly => BillingInterval::Month,
            PriceLookupKey::StarterAnnual | PriceLookupKey::ProAnnual => BillingInterval::Year,
        }
    }

    pub fn details(&self) -> PlanDetails {
        let plan = self.plan();
        PlanDetails {
            plan,
            interval: self.interval(),
            minutes_limit: plan.minutes_limit(),
        }
    }
}

/// Quota and billing terms resolved for a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanDetails {
    pub plan: PlanName,
    pub interval: BillingInterval,
    pub minutes_limit: i32,
}

impl PlanDetails {
    /// Degraded configuration used when a price cannot be resolved.
    pub fn fallback(interval: Option<BillingInterval>) -> Self {
        PlanDetails {
            plan: PlanName::Starter,
            interval: interval.unwrap_or(BillingInterval::Month),
            minutes_limit: STARTER_MINUTES,
        }
    }
}

/// One purchasable catalog entry, as shown on the pricing page.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub lookup_key: PriceLookupKey,
    pub plan: PlanName,
    pub name: &'static str,
    pub interval: BillingInterval,
    pub minutes_limit: i32,
    /// The quota renews with each billing period, so annual plans read "per year".
    pub quota_description: String,
    pub price_minor: i64,
    pub currency: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    /// Stripe price id -> lookup key, for prices created without a lookup key.
    price_ids: HashMap<String, PriceLookupKey>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price_id(mut self, price_id: impl Into<String>, key: PriceLookupKey) -> Self {
        self.price_ids.insert(price_id.into(), key);
        self
    }

    /// Resolves either a lookup key or a configured price id.
    pub fn resolve_plan(&self, price_ref: &str) -> Option<PlanDetails> {
        if let Ok(key) = price_ref.parse::<PriceLookupKey>() {
            return Some(key.details());
        }
        self.price_ids.get(price_ref).map(PriceLookupKey::details)
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        PriceLookupKey::iter()
            .map(|key| {
                let plan = key.plan();
                CatalogEntry {
                    lookup_key: key,
                    plan,
                    name: plan.display_name(),
                    interval: key.interval(),
                    minutes_limit: plan.minutes_limit(),
                    quota_description: format!(
                        "{} of transcription per {}",
                        format_minutes_as_hours(i64::from(plan.minutes_limit())),
                        key.interval()
                    ),
                    price_minor: plan.price_minor(key.interval()),
                    currency: CATALOG_CURRENCY,
                }
            })
            .collect()
    }
}

/// `45 min`, `1 hr`, `2 hr 30 min`.
pub fn format_minutes_as_hours(minutes: i64) -> String {
    let minutes = minutes.max(0);
    if minutes < 60 {
        return format!("{} min", minutes);
    }
    let hours = minutes / 60;
    let rest = minutes % 60;
    if rest == 0 {
        format!("{} hr", hours)
    } else {
        format!("{} hr {} min", hours, rest)
    }
}
