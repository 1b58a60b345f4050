//! Per-tenant usage metering with edge-triggered budget thresholds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use super::period::{BillingPeriod, UsagePeriod, utilization_pct};
use super::rates::RateTable;
use super::{cost_from_scaled, cost_to_scaled, round_cost};
use crate::backend::BackendType;
use crate::events::{EventBus, GovernanceEvent};
use crate::tier::TierConfig;
use crate::{Error, Result};

/// Compute units are stored as integer thousandths.
const COMPUTE_UNIT_SCALE: f64 = 1000.0;

/// Budget position of a tenant in its current period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BudgetStatus {
    /// No budget assigned.
    Unlimited { used: Decimal },
    WithinBudget { used: Decimal, limit: Decimal },
    Warning { used: Decimal, limit: Decimal },
    Critical { used: Decimal, limit: Decimal },
    Exceeded { used: Decimal, limit: Decimal },
}

impl BudgetStatus {
    pub fn used(&self) -> Decimal {
        match self {
            Self::Unlimited { used }
            | Self::WithinBudget { used, .. }
            | Self::Warning { used, .. }
            | Self::Critical { used, .. }
            | Self::Exceeded { used, .. } => *used,
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BudgetLimits {
    monthly_budget_usd: Decimal,
    warning_pct: f64,
    critical_pct: f64,
    hard_limit: bool,
}

impl BudgetLimits {
    fn from_tier(tier: &TierConfig) -> Self {
        Self {
            monthly_budget_usd: tier.monthly_budget_usd,
            warning_pct: tier.warning_pct,
            critical_pct: tier.critical_pct,
            hard_limit: tier.hard_limit,
        }
    }

    fn has_budget(&self) -> bool {
        self.monthly_budget_usd > Decimal::ZERO
    }
}

#[derive(Debug)]
struct PeriodCounters {
    period: BillingPeriod,
    operations: AtomicU64,
    bytes: AtomicU64,
    compute_milli: AtomicU64,
    /// Integer pico-dollars.
    cost_scaled: AtomicU64,
    warning_fired: AtomicBool,
    critical_fired: AtomicBool,
    exceeded_fired: AtomicBool,
}

impl PeriodCounters {
    fn new(period: BillingPeriod) -> Self {
        Self {
            period,
            operations: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            compute_milli: AtomicU64::new(0),
            cost_scaled: AtomicU64::new(0),
            warning_fired: AtomicBool::new(false),
            critical_fired: AtomicBool::new(false),
            exceeded_fired: AtomicBool::new(false),
        }
    }

    fn cost_usd(&self) -> Decimal {
        cost_from_scaled(self.cost_scaled.load(Ordering::Acquire))
    }

    fn snapshot(&self, tenant_id: &str, budget_usd: Decimal) -> UsagePeriod {
        UsagePeriod {
            tenant_id: tenant_id.to_string(),
            period: self.period,
            operations_executed: self.operations.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            compute_units: self.compute_milli.load(Ordering::Relaxed) as f64 / COMPUTE_UNIT_SCALE,
            estimated_cost_usd: self.cost_usd(),
            budget_usd,
        }
    }
}

/// Add to a counter without wrapping. Returns the new total.
fn add_saturating(counter: &AtomicU64, n: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_add(n)))
        .unwrap_or_else(|v| v);
    previous.saturating_add(n)
}

/// Fire-once flag. Only the caller that flips it wins.
fn fire_once(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[derive(Debug)]
struct TenantLedger {
    limits: RwLock<Option<BudgetLimits>>,
    periods: RwLock<BTreeMap<BillingPeriod, Arc<PeriodCounters>>>,
}

impl TenantLedger {
    fn new() -> Self {
        Self {
            limits: RwLock::new(None),
            periods: RwLock::new(BTreeMap::new()),
        }
    }

    fn limits(&self) -> Option<BudgetLimits> {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, period: BillingPeriod) -> Option<Arc<PeriodCounters>> {
        self.periods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&period)
            .cloned()
    }

    /// Counters a record at `period` lands in. Records never reach back into
    /// a period older than the newest one, which is closed to writes.
    fn counters_for(&self, period: BillingPeriod) -> Arc<PeriodCounters> {
        {
            let periods = self.periods.read().unwrap_or_else(|e| e.into_inner());
            if let Some((&latest, counters)) = periods.last_key_value()
                && latest >= period
            {
                return Arc::clone(counters);
            }
        }
        let mut periods = self.periods.write().unwrap_or_else(|e| e.into_inner());
        if let Some((&latest, counters)) = periods.last_key_value()
            && latest >= period
        {
            return Arc::clone(counters);
        }
        Arc::clone(
            periods
                .entry(period)
                .or_insert_with(|| Arc::new(PeriodCounters::new(period))),
        )
    }
}

/// Records completed operations and decides budget admission.
///
/// State is sharded per tenant; unrelated tenants never contend.
#[derive(Debug)]
pub struct UsageMeter {
    tenants: DashMap<String, Arc<TenantLedger>>,
    rates: RateTable,
    events: EventBus,
}

impl UsageMeter {
    pub fn new(rates: RateTable, events: EventBus) -> Self {
        Self {
            tenants: DashMap::new(),
            rates,
            events,
        }
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    fn ledger(&self, tenant_id: &str) -> Arc<TenantLedger> {
        if let Some(ledger) = self.tenants.get(tenant_id) {
            return Arc::clone(ledger.value());
        }
        Arc::clone(
            self.tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(TenantLedger::new()))
                .value(),
        )
    }

    /// Bind a tenant to its tier's budget. Applies to subsequent records.
    pub fn assign_tier(&self, tenant_id: &str, tier: &TierConfig) {
        let limits = BudgetLimits::from_tier(tier);
        let ledger = self.ledger(tenant_id);
        if ledger.limits() == Some(limits) {
            return;
        }
        *ledger.limits.write().unwrap_or_else(|e| e.into_inner()) = Some(limits);
    }

    /// Record one completed operation now. Returns its cost in USD.
    pub fn record_operation(
        &self,
        tenant_id: &str,
        backend: BackendType,
        bytes: u64,
        compute_units: f64,
    ) -> Decimal {
        self.record_operation_at(tenant_id, backend, bytes, compute_units, Utc::now())
    }

    pub fn record_operation_at(
        &self,
        tenant_id: &str,
        backend: BackendType,
        bytes: u64,
        compute_units: f64,
        at: DateTime<Utc>,
    ) -> Decimal {
        let ledger = self.ledger(tenant_id);
        let counters = ledger.counters_for(BillingPeriod::containing(at));
        let cost = round_cost(self.rates.cost(backend, bytes, compute_units));
        let scaled = cost_to_scaled(cost);
        let milli = (compute_units.max(0.0) * COMPUTE_UNIT_SCALE).round() as u64;

        counters.operations.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        counters.compute_milli.fetch_add(milli, Ordering::Relaxed);
        let total_scaled = add_saturating(&counters.cost_scaled, scaled);

        if let Some(limits) = ledger.limits()
            && limits.has_budget()
        {
            let used = cost_from_scaled(total_scaled);
            self.check_thresholds(tenant_id, &counters, &limits, used);
        }
        cost
    }

    fn check_thresholds(
        &self,
        tenant_id: &str,
        counters: &PeriodCounters,
        limits: &BudgetLimits,
        used: Decimal,
    ) {
        let Some(pct) = utilization_pct(used, limits.monthly_budget_usd) else {
            return;
        };
        let period = counters.period;

        if pct >= limits.warning_pct && fire_once(&counters.warning_fired) {
            tracing::warn!(tenant_id, period = %period, utilization_pct = pct, "Budget warning threshold crossed");
            self.events.publish(GovernanceEvent::BudgetWarning {
                tenant_id: tenant_id.to_string(),
                period,
                utilization_pct: pct,
            });
        }
        if pct >= limits.critical_pct && fire_once(&counters.critical_fired) {
            tracing::warn!(tenant_id, period = %period, utilization_pct = pct, "Budget critical threshold crossed");
            self.events.publish(GovernanceEvent::BudgetCritical {
                tenant_id: tenant_id.to_string(),
                period,
                utilization_pct: pct,
            });
        }
        if pct >= 100.0 && fire_once(&counters.exceeded_fired) {
            tracing::warn!(tenant_id, period = %period, utilization_pct = pct, "Budget exceeded");
            self.events.publish(GovernanceEvent::BudgetExceeded {
                tenant_id: tenant_id.to_string(),
                period,
                utilization_pct: pct,
            });
        }
    }

    /// `false` only for a hard-limit tenant whose current period is spent.
    pub fn can_admit(&self, tenant_id: &str) -> bool {
        self.check_admission(tenant_id).is_ok()
    }

    pub fn can_admit_at(&self, tenant_id: &str, at: DateTime<Utc>) -> bool {
        self.check_admission_at(tenant_id, at).is_ok()
    }

    pub fn check_admission(&self, tenant_id: &str) -> Result<()> {
        self.check_admission_at(tenant_id, Utc::now())
    }

    /// Like [`UsageMeter::can_admit_at`], with the spend in the error.
    pub fn check_admission_at(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<()> {
        let Some(ledger) = self.tenants.get(tenant_id).map(|l| Arc::clone(l.value())) else {
            return Ok(());
        };
        let Some(limits) = ledger.limits() else {
            return Ok(());
        };
        if !limits.hard_limit || !limits.has_budget() {
            return Ok(());
        }
        let Some(counters) = ledger.get(BillingPeriod::containing(at)) else {
            return Ok(());
        };
        let used = counters.cost_usd();
        if used >= limits.monthly_budget_usd {
            return Err(Error::BudgetExceeded {
                tenant_id: tenant_id.to_string(),
                used: used.to_f64().unwrap_or(f64::MAX),
                limit: limits.monthly_budget_usd.to_f64().unwrap_or(0.0),
            });
        }
        Ok(())
    }

    pub fn usage(&self, tenant_id: &str, period: BillingPeriod) -> Option<UsagePeriod> {
        let ledger = self.tenants.get(tenant_id).map(|l| Arc::clone(l.value()))?;
        let budget = ledger
            .limits()
            .map(|l| l.monthly_budget_usd)
            .unwrap_or_default();
        ledger
            .get(period)
            .map(|counters| counters.snapshot(tenant_id, budget))
    }

    /// Every recorded period for a tenant, oldest first.
    pub fn periods(&self, tenant_id: &str) -> Vec<UsagePeriod> {
        let Some(ledger) = self.tenants.get(tenant_id).map(|l| Arc::clone(l.value())) else {
            return Vec::new();
        };
        let budget = ledger
            .limits()
            .map(|l| l.monthly_budget_usd)
            .unwrap_or_default();
        ledger
            .periods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|counters| counters.snapshot(tenant_id, budget))
            .collect()
    }

    pub fn status(&self, tenant_id: &str) -> BudgetStatus {
        self.status_at(tenant_id, Utc::now())
    }

    pub fn status_at(&self, tenant_id: &str, at: DateTime<Utc>) -> BudgetStatus {
        let ledger = self.tenants.get(tenant_id).map(|l| Arc::clone(l.value()));
        let used = ledger
            .as_ref()
            .and_then(|l| l.get(BillingPeriod::containing(at)))
            .map(|c| c.cost_usd())
            .unwrap_or_default();
        let limits = ledger.and_then(|l| l.limits()).filter(|l| l.has_budget());

        let Some(limits) = limits else {
            return BudgetStatus::Unlimited { used };
        };
        let limit = limits.monthly_budget_usd;
        let pct = utilization_pct(used, limit).unwrap_or(0.0);
        if pct >= 100.0 {
            BudgetStatus::Exceeded { used, limit }
        } else if pct >= limits.critical_pct {
            BudgetStatus::Critical { used, limit }
        } else if pct >= limits.warning_pct {
            BudgetStatus::Warning { used, limit }
        } else {
            BudgetStatus::WithinBudget { used, limit }
        }
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new(RateTable::default(), EventBus::new())
    }
}
