//! Billing periods and usage snapshots.

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A calendar month in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month: month.clamp(1, 12),
        }
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        Self::new(at.year(), at.month())
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self::new(self.year - 1, 12)
        } else {
            Self::new(self.year, self.month - 1)
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Snapshot of one tenant's counters for one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePeriod {
    pub tenant_id: String,
    pub period: BillingPeriod,
    pub operations_executed: u64,
    pub bytes_transferred: u64,
    pub compute_units: f64,
    pub estimated_cost_usd: Decimal,
    /// Monthly budget in force when the snapshot was taken; zero if none.
    pub budget_usd: Decimal,
}

impl UsagePeriod {
    /// Percent of the budget used, or `None` without a budget.
    pub fn utilization_pct(&self) -> Option<f64> {
        utilization_pct(self.estimated_cost_usd, self.budget_usd)
    }
}

pub(crate) fn utilization_pct(used: Decimal, budget: Decimal) -> Option<f64> {
    use rust_decimal::prelude::ToPrimitive;

    if budget <= Decimal::ZERO {
        return None;
    }
    (used * Decimal::ONE_HUNDRED / budget).to_f64()
}
