//! Scoring controller - quality gates with retry-until-threshold
//!
//! A step with a scoring policy does not commit on first success: its
//! output is evaluated against criteria, aggregated, and gated against a
//! minimum threshold. Below-threshold output is retried with backoff up to
//! `retryLimit` attempts, optionally requiring each retry to improve on
//! the previous score. When attempts run out, the `onFailure` policy
//! decides between recording the failure and proceeding, aborting the
//! ensemble, or granting one more full round.
//!
//! ```text
//!   execute ──→ evaluate ──→ score >= minimum ? ──yes──→ commit
//!      ↑                            │no
//!      │         attempts left? ────┤
//!      │               │yes         │no
//!      └── backoff ────┘      onFailure: continue | abort | retry
//! ```
//!
//! The transient-failure retry loop of the step itself (`step.retry`) runs
//! *inside* each scoring attempt - one scoring attempt is one (internally
//! retried) member execution plus one evaluation. `retryLimit` counts
//! evaluations.

pub mod evaluators;

pub use evaluators::{
    content_text, Criterion, Embedder, EmbeddingEvaluator, Evaluator, JudgeEvaluator,
    NlpEvaluator, RuleEvaluator, ScoreReport,
};

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Score thresholds, all in [0,1] with `minimum <= target <= excellent`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub minimum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excellent: Option<f64>,
}

impl Thresholds {
    pub fn minimum(minimum: f64) -> Self {
        Self {
            minimum,
            target: None,
            excellent: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for value in [Some(self.minimum), self.target, self.excellent]
            .into_iter()
            .flatten()
        {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Validation(format!(
                    "threshold {value} outside [0,1]"
                )));
            }
        }
        let target = self.target.unwrap_or(self.minimum);
        let excellent = self.excellent.unwrap_or(target);
        if self.minimum > target || target > excellent {
            return Err(EngineError::Validation(
                "thresholds must satisfy minimum <= target <= excellent".to_string(),
            ));
        }
        Ok(())
    }

    /// Which band a score lands in, for reporting.
    pub fn band(&self, score: f64) -> &'static str {
        if let Some(excellent) = self.excellent {
            if score >= excellent {
                return "excellent";
            }
        }
        if let Some(target) = self.target {
            if score >= target {
                return "target";
            }
        }
        if score >= self.minimum {
            "minimum"
        } else {
            "below"
        }
    }
}

/// How per-criterion scores collapse into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    #[default]
    WeightedAverage,
    Minimum,
    GeometricMean,
}

impl Aggregation {
    pub fn apply(&self, criteria: &[Criterion], breakdown: &BTreeMap<String, f64>) -> f64 {
        let scores: Vec<(f64, f64)> = criteria
            .iter()
            .map(|c| (breakdown.get(&c.name).copied().unwrap_or(0.0), c.weight))
            .collect();
        if scores.is_empty() {
            return 0.0;
        }
        match self {
            Aggregation::WeightedAverage => {
                let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
                if total_weight == 0.0 {
                    return 0.0;
                }
                scores.iter().map(|(s, w)| s * w).sum::<f64>() / total_weight
            }
            Aggregation::Minimum => scores
                .iter()
                .map(|(s, _)| *s)
                .fold(f64::INFINITY, f64::min),
            Aggregation::GeometricMean => {
                let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
                if total_weight == 0.0 {
                    return 0.0;
                }
                let log_sum: f64 = scores
                    .iter()
                    .map(|(s, w)| {
                        if *s <= 0.0 {
                            f64::NEG_INFINITY
                        } else {
                            w * s.ln()
                        }
                    })
                    .sum();
                if log_sum == f64::NEG_INFINITY {
                    0.0
                } else {
                    (log_sum / total_weight).exp()
                }
            }
        }
    }
}

/// Backoff shapes between scoring attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBackoff {
    Fixed,
    #[default]
    Linear,
    Exponential,
}

/// What to do when attempts run out below threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Record the failure and proceed with the last output
    Continue,
    /// Terminate the ensemble with a scoring failure
    #[default]
    Abort,
    /// Grant one additional full round of attempts, then abort
    Retry,
}

/// Which evaluator a policy uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorKind {
    #[default]
    Rule,
    Nlp,
    Embedding,
    Judge,
}

/// Per-step scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    #[serde(default)]
    pub evaluator: EvaluatorKind,

    pub criteria: Vec<Criterion>,

    pub thresholds: Thresholds,

    #[serde(default)]
    pub aggregation: Aggregation,

    /// Maximum evaluations (including the first); minimum 1
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,

    #[serde(default)]
    pub backoff: ScoreBackoff,

    /// Seconds before the second attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: f64,

    /// Abort unless every retry improves on the previous score
    #[serde(default)]
    pub require_improvement: bool,

    /// Minimum improvement per retry when `require_improvement` is on
    #[serde(default)]
    pub min_improvement: f64,

    #[serde(default)]
    pub on_failure: OnFailure,

    /// Judge evaluator: member reference of the judging LLM member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<String>,

    /// Mirror the latest score into reserved state keys
    #[serde(default)]
    pub track_in_state: bool,
}

fn default_retry_limit() -> usize {
    3
}

fn default_initial_backoff() -> f64 {
    0.5
}

impl ScoringPolicy {
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.criteria.is_empty() {
            return Err(EngineError::Validation(
                "scoring policy has no criteria".to_string(),
            ));
        }
        if self.initial_backoff < 0.0 {
            return Err(EngineError::Validation(
                "initial backoff must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    fn delay(&self, failed_attempt: usize) -> Duration {
        let seconds = match self.backoff {
            ScoreBackoff::Fixed => self.initial_backoff,
            ScoreBackoff::Linear => self.initial_backoff * failed_attempt as f64,
            ScoreBackoff::Exponential => {
                self.initial_backoff * 2f64.powi(failed_attempt.saturating_sub(1) as i32)
            }
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Result of a gated execution
#[derive(Debug, Clone)]
pub struct ScoredOutcome {
    /// The committed output (last attempt's output when the gate failed
    /// under `continue`)
    pub value: Value,
    pub report: ScoreReport,
    /// Retries consumed (attempts - 1)
    pub retry_count: usize,
    pub passed: bool,
}

/// Drives the evaluate/retry loop for one step
pub struct ScoringController {
    policy: ScoringPolicy,
    evaluator: Arc<dyn Evaluator>,
}

impl ScoringController {
    pub fn new(policy: ScoringPolicy, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { policy, evaluator }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Run `execute` until its output clears the gate or policy gives up.
    ///
    /// `execute` receives the 1-based attempt number and performs one full
    /// member execution (including the step's own transient retries).
    pub async fn run<F, Fut>(&self, step_id: &str, mut execute: F) -> Result<ScoredOutcome>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let limit = self.policy.retry_limit.max(1);
        let minimum = self.policy.thresholds.minimum;
        let mut previous_score: Option<f64> = None;
        let mut extra_round_granted = false;
        let mut attempt = 0usize;
        let mut total_attempts = 0usize;

        loop {
            attempt += 1;
            total_attempts += 1;

            let value = execute(total_attempts).await?;
            let breakdown = self.evaluator.evaluate(&value, &self.policy.criteria).await?;
            let score = self.policy.aggregation.apply(&self.policy.criteria, &breakdown);
            let passed = score >= minimum;

            let report = ScoreReport {
                average: score,
                breakdown,
                threshold: minimum,
                passed,
                detail: json!({
                    "attempt": total_attempts,
                    "band": self.policy.thresholds.band(score),
                    "aggregation": self.policy.aggregation,
                }),
            };

            if passed {
                tracing::debug!(
                    step = %step_id,
                    score,
                    attempts = total_attempts,
                    "scoring gate passed"
                );
                return Ok(ScoredOutcome {
                    value,
                    report,
                    retry_count: total_attempts - 1,
                    passed: true,
                });
            }

            if self.policy.require_improvement {
                if let Some(previous) = previous_score {
                    if score < previous + self.policy.min_improvement {
                        tracing::warn!(
                            step = %step_id,
                            score,
                            previous,
                            "retry did not improve; aborting scoring loop"
                        );
                        return Err(EngineError::ScoringFailure {
                            step: step_id.to_string(),
                            score,
                            minimum,
                            attempts: total_attempts,
                        });
                    }
                }
            }
            previous_score = Some(score);

            if attempt < limit {
                let delay = self.policy.delay(attempt);
                tracing::debug!(
                    step = %step_id,
                    score,
                    attempt = total_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scoring gate missed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            // Attempts exhausted: the failure policy decides.
            match self.policy.on_failure {
                OnFailure::Continue => {
                    return Ok(ScoredOutcome {
                        value,
                        report,
                        retry_count: total_attempts - 1,
                        passed: false,
                    });
                }
                OnFailure::Retry if !extra_round_granted => {
                    extra_round_granted = true;
                    attempt = 0;
                    previous_score = None;
                    continue;
                }
                OnFailure::Abort | OnFailure::Retry => {
                    return Err(EngineError::ScoringFailure {
                        step: step_id.to_string(),
                        score,
                        minimum,
                        attempts: total_attempts,
                    });
                }
            }
        }
    }
}
