//! Cost estimation and admission control.
//!
//! [`CostEstimator::estimate`] turns an operation into a [`CostVerdict`] whose
//! [`CostShape`] depends on the backend kind: planner cost and rows for
//! relational statements, a complexity score for staged pipelines, and a
//! denylist match for key-value commands. [`CostEstimator::check_admission`]
//! then weighs the verdict against a tier.
//!
//! Estimation failures never block: a missing or failed planner estimate
//! yields [`CostShape::Unavailable`] and the operation is admitted.

mod denylist;
mod estimator;
mod pipeline;

pub use denylist::{DenylistEntry, KvDenylist};
pub use estimator::CostEstimator;
pub(crate) use estimator::effective_timeout;
pub use pipeline::{score_pipeline, stage_penalty};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendType;
use crate::config::{duration_ms, duration_us};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Bound on a planner round-trip, independent of the query timeout.
    #[serde(rename = "estimation_timeout_ms", with = "duration_ms")]
    pub estimation_timeout: Duration,
    /// Wall-clock time one planner cost unit is assumed to take.
    #[serde(rename = "cost_unit_duration_us", with = "duration_us")]
    pub cost_unit_duration: Duration,
    /// Pipeline scores up to this are `Low`.
    pub complexity_low: u32,
    pub complexity_medium: u32,
    /// Pipeline scores above this are `Extreme` and always rejected.
    pub complexity_high: u32,
    /// Fraction of the tier query timeout granted to `High` pipelines.
    pub high_complexity_timeout_factor: f64,
    pub kv_denylist: HashMap<BackendType, Vec<DenylistEntry>>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        let mut kv_denylist = HashMap::new();
        kv_denylist.insert(BackendType::KeyValue, KvDenylist::default_entries());
        Self {
            estimation_timeout: Duration::from_millis(500),
            cost_unit_duration: Duration::from_micros(10),
            complexity_low: 5,
            complexity_medium: 10,
            complexity_high: 20,
            high_complexity_timeout_factor: 0.5,
            kv_denylist,
        }
    }
}

impl EstimatorConfig {
    pub fn classify(&self, score: u32) -> ComplexityClass {
        if score <= self.complexity_low {
            ComplexityClass::Low
        } else if score <= self.complexity_medium {
            ComplexityClass::Medium
        } else if score <= self.complexity_high {
            ComplexityClass::High
        } else {
            ComplexityClass::Extreme
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityClass {
    Low,
    Medium,
    High,
    Extreme,
}

impl ComplexityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific cost measurements behind a verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum CostShape {
    Relational {
        cost: f64,
        rows: u64,
    },
    Pipeline {
        stages: usize,
        score: u32,
        class: ComplexityClass,
    },
    KeyValue {
        command: String,
        denylisted: bool,
    },
    /// No estimate could be produced; admission proceeds without one.
    Unavailable {
        reason: String,
    },
}

impl CostShape {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Conservative execution options forced on an admitted operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionHints {
    pub allow_disk_use: Option<bool>,
    /// Per-call timeout tighter than the tier's query timeout.
    pub timeout: Option<Duration>,
}

impl ExecutionHints {
    pub fn is_empty(&self) -> bool {
        self.allow_disk_use.is_none() && self.timeout.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    CostThreshold { estimated: f64, limit: f64 },
    RowThreshold { estimated: u64, limit: u64 },
    DurationExceedsTimeout { estimated: Duration, timeout: Duration },
    ExtremeComplexity { score: u32 },
    DeniedCommand { command: String, alternative: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CostThreshold { estimated, limit } => {
                write!(f, "estimated cost {:.1} exceeds tier limit {:.1}", estimated, limit)
            }
            Self::RowThreshold { estimated, limit } => {
                write!(f, "estimated {} rows exceeds tier limit {}", estimated, limit)
            }
            Self::DurationExceedsTimeout { estimated, timeout } => write!(
                f,
                "estimated duration {:.1}s exceeds query timeout {:.1}s",
                estimated.as_secs_f64(),
                timeout.as_secs_f64()
            ),
            Self::ExtremeComplexity { score } => {
                write!(f, "pipeline complexity score {} is extreme", score)
            }
            Self::DeniedCommand {
                command,
                alternative,
            } => write!(f, "{} scans the whole keyspace, use {} instead", command, alternative),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostVerdict {
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    pub duration_hint: Option<Duration>,
    /// Tier-independent verdict; tier thresholds are applied by `check_admission`.
    pub allowed: bool,
    pub reason: Option<RejectionReason>,
    pub shape: CostShape,
    pub hints: ExecutionHints,
    /// Advisory only, never changes `allowed`.
    pub recommendations: Vec<String>,
}

impl CostVerdict {
    pub(crate) fn allow(shape: CostShape) -> Self {
        Self {
            estimated_cost: 0.0,
            estimated_rows: 0,
            duration_hint: None,
            allowed: true,
            reason: None,
            shape,
            hints: ExecutionHints::default(),
            recommendations: Vec::new(),
        }
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::allow(CostShape::Unavailable {
            reason: reason.into(),
        })
    }

    pub(crate) fn reject(mut self, reason: RejectionReason) -> Self {
        self.allowed = false;
        self.reason = Some(reason);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admit { hints: ExecutionHints },
    Reject { reason: RejectionReason },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    pub fn reason(&self) -> Option<&RejectionReason> {
        match self {
            Self::Admit { .. } => None,
            Self::Reject { reason } => Some(reason),
        }
    }

    /// Admitted hints, or `AdmissionRejected`.
    pub fn into_result(self) -> Result<ExecutionHints> {
        match self {
            Self::Admit { hints } => Ok(hints),
            Self::Reject { reason } => Err(Error::AdmissionRejected { reason }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        let config = EstimatorConfig::default();
        assert_eq!(config.classify(5), ComplexityClass::Low);
        assert_eq!(config.classify(6), ComplexityClass::Medium);
        assert_eq!(config.classify(10), ComplexityClass::Medium);
        assert_eq!(config.classify(20), ComplexityClass::High);
        assert_eq!(config.classify(21), ComplexityClass::Extreme);
    }

    #[test]
    fn test_rejection_becomes_error() {
        let decision = AdmissionDecision::Reject {
            reason: RejectionReason::ExtremeComplexity { score: 30 },
        };
        assert!(!decision.is_allowed());
        let err = decision.into_result().unwrap_err();
        assert!(err.is_policy_rejection());
        assert!(err.to_string().contains("complexity score 30"));
    }

    #[test]
    fn test_config_roundtrip_keeps_denylist() {
        let json = serde_json::to_string(&EstimatorConfig::default()).unwrap();
        let parsed: EstimatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EstimatorConfig::default());
        assert!(json.contains("\"estimation_timeout_ms\":500"));
        assert!(json.contains("\"cost_unit_duration_us\":10"));
    }
}
