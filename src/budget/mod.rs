//! Tenant usage metering and monthly budget enforcement.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

mod meter;
mod period;
mod rates;

pub use meter::{BudgetStatus, UsageMeter};
pub use period::{BillingPeriod, UsagePeriod};
pub use rates::{BackendRates, RateTable, RateTableBuilder};

/// Decimal places kept when costs are stored as integer pico-dollars.
const COST_DECIMAL_PLACES: u32 = 12;

/// Scale factor for storing Decimal costs as AtomicU64 (12 decimal places precision).
const COST_SCALE_FACTOR: Decimal = dec!(1_000_000_000_000);

/// Round a cost to the precision the atomic counters keep.
pub(crate) fn round_cost(cost: Decimal) -> Decimal {
    cost.round_dp(COST_DECIMAL_PLACES)
}

/// Cost as integer pico-dollars. Saturates at `u64::MAX`; negative costs are zero.
pub(crate) fn cost_to_scaled(cost: Decimal) -> u64 {
    if cost.is_sign_negative() {
        return 0;
    }
    round_cost(cost)
        .checked_mul(COST_SCALE_FACTOR)
        .and_then(|scaled| scaled.to_u64())
        .unwrap_or(u64::MAX)
}

pub(crate) fn cost_from_scaled(scaled: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(scaled), COST_DECIMAL_PLACES)
}
