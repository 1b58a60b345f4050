//! Static usage rates for the cost model.
//!
//! `cost = per_operation[backend] + per_byte[backend] * bytes + per_compute_unit * units`

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::backend::BackendType;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendRates {
    pub per_operation: Decimal,
    pub per_byte: Decimal,
}

impl BackendRates {
    pub const fn new(per_operation: Decimal, per_byte: Decimal) -> Self {
        Self {
            per_operation,
            per_byte,
        }
    }

    pub fn defaults_for(backend: BackendType) -> Self {
        match backend {
            BackendType::Relational => Self::new(dec!(0.0001), dec!(0.000000001)),
            BackendType::Document => Self::new(dec!(0.0001), dec!(0.000000001)),
            BackendType::KeyValue => Self::new(dec!(0.00001), dec!(0.0000000005)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    backends: HashMap<BackendType, BackendRates>,
    per_compute_unit: Decimal,
}

impl RateTable {
    pub fn builder() -> RateTableBuilder {
        RateTableBuilder::new()
    }

    pub fn rates(&self, backend: BackendType) -> BackendRates {
        self.backends
            .get(&backend)
            .copied()
            .unwrap_or_else(|| BackendRates::defaults_for(backend))
    }

    pub fn per_compute_unit(&self) -> Decimal {
        self.per_compute_unit
    }

    /// Cost in USD of one completed operation.
    pub fn cost(&self, backend: BackendType, bytes: u64, compute_units: f64) -> Decimal {
        let rates = self.rates(backend);
        let units = Decimal::from_f64(compute_units.max(0.0)).unwrap_or_default();
        rates.per_operation + rates.per_byte * Decimal::from(bytes) + self.per_compute_unit * units
    }

    pub(crate) fn first_negative_rate(&self) -> Option<String> {
        if self.per_compute_unit.is_sign_negative() {
            return Some(format!("per_compute_unit {}", self.per_compute_unit));
        }
        self.backends.iter().find_map(|(backend, rates)| {
            if rates.per_operation.is_sign_negative() {
                Some(format!("{}.per_operation {}", backend, rates.per_operation))
            } else if rates.per_byte.is_sign_negative() {
                Some(format!("{}.per_byte {}", backend, rates.per_byte))
            } else {
                None
            }
        })
    }
}

impl Default for RateTable {
    fn default() -> Self {
        RateTableBuilder::new().with_defaults().build()
    }
}

#[derive(Debug, Default)]
pub struct RateTableBuilder {
    backends: HashMap<BackendType, BackendRates>,
    per_compute_unit: Option<Decimal>,
}

impl RateTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        for &backend in BackendType::all() {
            self.backends
                .insert(backend, BackendRates::defaults_for(backend));
        }
        self.per_compute_unit = Some(dec!(0.00005));
        self
    }

    pub fn backend(mut self, backend: BackendType, per_operation: Decimal, per_byte: Decimal) -> Self {
        self.backends
            .insert(backend, BackendRates::new(per_operation, per_byte));
        self
    }

    pub fn per_compute_unit(mut self, rate: Decimal) -> Self {
        self.per_compute_unit = Some(rate);
        self
    }

    /// Backends left unset fall back to their default rates.
    pub fn build(self) -> RateTable {
        RateTable {
            backends: self.backends,
            per_compute_unit: self.per_compute_unit.unwrap_or(dec!(0.00005)),
        }
    }
}
