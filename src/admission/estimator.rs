//! Per-backend cost estimation and the tier admission check.

use std::sync::Arc;
use std::time::Duration;

use super::pipeline::{recommendations, score_pipeline};
use super::{
    AdmissionDecision, ComplexityClass, CostShape, CostVerdict, EstimatorConfig, ExecutionHints,
    KvDenylist, RejectionReason,
};
use crate::Error;
use crate::backend::{
    BackendType, DriverRegistry, KeyValueOp, Operation, PipelineOp, PlanEstimate, RelationalOp,
};
use crate::observability::GovernanceMetrics;
use crate::tier::TierConfig;

/// Rows above which an unbounded relational statement gets a LIMIT note.
const LIMIT_ADVICE_ROWS: u64 = 1_000;

#[derive(Debug)]
pub struct CostEstimator {
    config: EstimatorConfig,
    drivers: DriverRegistry,
    metrics: Arc<GovernanceMetrics>,
}

impl CostEstimator {
    pub fn new(
        config: EstimatorConfig,
        drivers: DriverRegistry,
        metrics: Arc<GovernanceMetrics>,
    ) -> Self {
        Self {
            config,
            drivers,
            metrics,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate an operation's cost against `backend`.
    ///
    /// Never fails: estimation problems degrade to an allowing verdict with
    /// [`CostShape::Unavailable`].
    pub async fn estimate(&self, operation: &Operation, backend: BackendType) -> CostVerdict {
        match operation {
            Operation::Relational(op) => self.estimate_relational(op, operation, backend).await,
            Operation::Pipeline(op) => self.estimate_pipeline(op),
            Operation::KeyValue(op) => self.estimate_key_value(op, backend),
        }
    }

    async fn estimate_relational(
        &self,
        op: &RelationalOp,
        operation: &Operation,
        backend: BackendType,
    ) -> CostVerdict {
        let plan = match self.plan(operation, backend).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                tracing::debug!(backend = %backend, "Backend offers no planner estimate, admitting");
                self.metrics.estimation_unavailable.inc();
                return CostVerdict::unavailable("planner not supported");
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Cost estimation unavailable, admitting without estimate");
                self.metrics.estimation_unavailable.inc();
                return CostVerdict::unavailable(e.to_string());
            }
        };

        let mut verdict = CostVerdict::allow(CostShape::Relational {
            cost: plan.total_cost,
            rows: plan.rows,
        });
        verdict.estimated_cost = plan.total_cost;
        verdict.estimated_rows = plan.rows;
        verdict.duration_hint = plan.duration_hint.or_else(|| {
            Duration::try_from_secs_f64(
                plan.total_cost.max(0.0) * self.config.cost_unit_duration.as_secs_f64(),
            )
            .ok()
        });

        let statement = op.statement.to_ascii_uppercase();
        if plan.rows > LIMIT_ADVICE_ROWS && !statement.contains(" LIMIT ") {
            verdict
                .recommendations
                .push("add a LIMIT clause to bound the result set".to_string());
        }
        if statement.contains("SELECT *") {
            verdict
                .recommendations
                .push("select only the columns you need".to_string());
        }
        verdict
    }

    async fn plan(
        &self,
        operation: &Operation,
        backend: BackendType,
    ) -> crate::Result<Option<PlanEstimate>> {
        let driver = self.drivers.get(backend)?;
        match tokio::time::timeout(
            self.config.estimation_timeout,
            driver.explain_cost(operation),
        )
        .await
        {
            Ok(Ok(plan)) => Ok(plan),
            Ok(Err(e)) => Err(Error::EstimationUnavailable(e.to_string())),
            Err(_) => Err(Error::EstimationUnavailable(format!(
                "planner did not answer within {}ms",
                self.config.estimation_timeout.as_millis()
            ))),
        }
    }

    fn estimate_pipeline(&self, op: &PipelineOp) -> CostVerdict {
        let score = score_pipeline(&op.stages);
        let class = self.config.classify(score);

        let mut verdict = CostVerdict::allow(CostShape::Pipeline {
            stages: op.stages.len(),
            score,
            class,
        });
        verdict.estimated_cost = f64::from(score);
        verdict.recommendations = recommendations(&op.stages);

        match class {
            ComplexityClass::Extreme => {
                tracing::debug!(collection = %op.collection, score, "Rejecting extreme pipeline");
                verdict.reject(RejectionReason::ExtremeComplexity { score })
            }
            ComplexityClass::High => {
                verdict.hints.allow_disk_use = Some(false);
                verdict
            }
            _ => verdict,
        }
    }

    fn estimate_key_value(&self, op: &KeyValueOp, backend: BackendType) -> CostVerdict {
        let entries = self
            .config
            .kv_denylist
            .get(&backend)
            .map(Vec::as_slice)
            .unwrap_or_default();

        match KvDenylist::new(entries).lookup(&op.command) {
            Some(entry) => {
                let mut verdict = CostVerdict::allow(CostShape::KeyValue {
                    command: op.command.to_ascii_uppercase(),
                    denylisted: true,
                });
                verdict
                    .recommendations
                    .push(format!("use {} instead", entry.alternative));
                verdict.reject(RejectionReason::DeniedCommand {
                    command: entry.command.clone(),
                    alternative: entry.alternative.clone(),
                })
            }
            None => CostVerdict::allow(CostShape::KeyValue {
                command: op.command.to_ascii_uppercase(),
                denylisted: false,
            }),
        }
    }

    /// Weigh a verdict against a tier.
    pub fn check_admission(&self, verdict: &CostVerdict, tier: &TierConfig) -> AdmissionDecision {
        if let Some(reason) = &verdict.reason {
            return AdmissionDecision::Reject {
                reason: reason.clone(),
            };
        }

        let mut hints = verdict.hints;
        match &verdict.shape {
            CostShape::Relational { cost, rows } => {
                if *cost > tier.cost_threshold {
                    return AdmissionDecision::Reject {
                        reason: RejectionReason::CostThreshold {
                            estimated: *cost,
                            limit: tier.cost_threshold,
                        },
                    };
                }
                if *rows > tier.row_threshold {
                    return AdmissionDecision::Reject {
                        reason: RejectionReason::RowThreshold {
                            estimated: *rows,
                            limit: tier.row_threshold,
                        },
                    };
                }
                if let Some(estimated) = verdict.duration_hint
                    && estimated > tier.query_timeout
                {
                    return AdmissionDecision::Reject {
                        reason: RejectionReason::DurationExceedsTimeout {
                            estimated,
                            timeout: tier.query_timeout,
                        },
                    };
                }
            }
            CostShape::Pipeline {
                class: ComplexityClass::High,
                ..
            } => {
                hints.timeout = Some(
                    tier.query_timeout
                        .mul_f64(self.config.high_complexity_timeout_factor),
                );
            }
            _ => {}
        }
        AdmissionDecision::Admit { hints }
    }

    /// Estimate and check in one step.
    pub async fn admit(
        &self,
        operation: &Operation,
        backend: BackendType,
        tier: &TierConfig,
    ) -> (CostVerdict, AdmissionDecision) {
        let verdict = self.estimate(operation, backend).await;
        let decision = self.check_admission(&verdict, tier);
        (verdict, decision)
    }
}

/// Merge admitted hints into the per-call timeout.
pub(crate) fn effective_timeout(base: Duration, hints: &ExecutionHints) -> Duration {
    match hints.timeout {
        Some(tighter) => tighter.min(base),
        None => base,
    }
}
