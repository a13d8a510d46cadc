//! Execution machinery shared by the linear executor and graph scheduler
//!
//! The per-step pipeline lives here: both executors funnel every step
//! through [`execute_step`], which implements
//!
//! ```text
//! when? ──→ interpolate input ──→ fingerprint ──→ cache/single-flight
//!        ──→ member invocation (timeout, transient retry, scoring loop)
//!        ──→ state commit ──→ output record ──→ events
//! ```
//!
//! [`ExecutionContext`] is the mutable per-run world: frozen input and
//! env, the permissioned state store, prior outputs, scoring history, and
//! metrics. It is created by the driver, threaded through the executor,
//! snapshotted on suspension, and discarded after the output projection.

pub mod graph;
pub mod linear;
pub mod plan;
pub mod retry;
pub mod scope;

use crate::cache::{CacheOutcome, PutOptions, StepCache};
use crate::canonical::fingerprint;
use crate::error::{EngineError, Result};
use crate::events::{EventEmitter, EventKind};
use crate::flow::{Ensemble, Step};
use crate::member::{
    Member, MemberContext, MemberError, MemberErrorKind, MemberOutcome, MemberResponse,
};
use crate::registry::{MemberRef, MemberRegistry};
use crate::scoring::{
    Embedder, EmbeddingEvaluator, Evaluator, EvaluatorKind, JudgeEvaluator, NlpEvaluator,
    RuleEvaluator, ScoreReport, ScoringController, ScoringPolicy,
};
use crate::state::StateStore;
use crate::template::{Interpolator, Scope};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use self::scope::CancelScope;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scoring bookkeeping across a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringRecord {
    /// Latest report per step
    pub per_step: HashMap<String, ScoreReport>,
    /// Score history per step, one entry per committed gate
    pub history: HashMap<String, Vec<f64>>,
    /// Scoring retries consumed per step
    pub retry_counts: HashMap<String, usize>,
    /// Mean of the latest per-step scores
    pub aggregate: f64,
}

impl ScoringRecord {
    fn record(&mut self, step_id: &str, report: &ScoreReport, retry_count: usize) {
        self.per_step.insert(step_id.to_string(), report.clone());
        self.history
            .entry(step_id.to_string())
            .or_default()
            .push(report.average);
        *self.retry_counts.entry(step_id.to_string()).or_default() += retry_count;
        let total: f64 = self.per_step.values().map(|r| r.average).sum();
        self.aggregate = total / self.per_step.len() as f64;
    }
}

/// Run-level metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub start_time: DateTime<Utc>,
    /// `(step id, member duration in ms)` per invocation
    pub member_timings: Vec<(String, u64)>,
    pub cache_hits: usize,
    /// Transient member retries across the run
    pub retries: usize,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            member_timings: Vec::new(),
            cache_hits: 0,
            retries: 0,
        }
    }
}

/// Serializable snapshot of a context, captured on suspension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub input: Value,
    pub state: Map<String, Value>,
    pub outputs: HashMap<String, Value>,
    pub scoring: ScoringRecord,
    pub metrics: RunMetrics,
}

/// Optional engine capabilities consumed by scoring evaluators
#[derive(Clone, Default)]
pub struct ScoringSupport {
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// The mutable world of one ensemble execution
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    /// Caller arguments, frozen for the run
    pub input: Value,
    /// Deployment bindings, frozen for the process
    pub env: Value,
    pub state: StateStore,
    pub outputs: Arc<RwLock<HashMap<String, Value>>>,
    pub scoring: Arc<RwLock<ScoringRecord>>,
    pub metrics: Arc<RwLock<RunMetrics>>,
    pub emitter: EventEmitter,
    pub cache: Arc<StepCache>,
    pub registry: Arc<MemberRegistry>,
    pub scoring_support: ScoringSupport,
    /// Fingerprints observed during this run; repeated lookups stay
    /// consistent even if the shared cache expires mid-run.
    seen: Arc<RwLock<HashMap<String, Value>>>,
    /// Step ids whose output was injected at resume time (the approved
    /// gate). Consulted once, then cleared, so later re-runs of the same
    /// id (loops) execute normally.
    resume_skips: Arc<RwLock<std::collections::HashSet<String>>>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        input: Value,
        env: Value,
        state: StateStore,
        emitter: EventEmitter,
        cache: Arc<StepCache>,
        registry: Arc<MemberRegistry>,
        scoring_support: ScoringSupport,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            input,
            env,
            state,
            outputs: Arc::new(RwLock::new(HashMap::new())),
            scoring: Arc::new(RwLock::new(ScoringRecord::default())),
            metrics: Arc::new(RwLock::new(RunMetrics::default())),
            emitter,
            cache,
            registry,
            scoring_support,
            seen: Arc::new(RwLock::new(HashMap::new())),
            resume_skips: Arc::new(RwLock::new(std::collections::HashSet::new())),
        }
    }

    /// Mark a step as already satisfied (resume injection): its recorded
    /// output is served instead of executing it, once.
    pub fn skip_once(&self, step_id: &str) {
        self.resume_skips.write().insert(step_id.to_string());
    }

    /// Capture everything a resumption needs.
    pub async fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            input: self.input.clone(),
            state: self.state.snapshot().await,
            outputs: self.outputs.read().clone(),
            scoring: self.scoring.read().clone(),
            metrics: self.metrics.read().clone(),
        }
    }

    /// Rehydrate from a snapshot (resumption path).
    pub async fn restore(&self, snapshot: ContextSnapshot) {
        self.state.restore(snapshot.state).await;
        *self.outputs.write() = snapshot.outputs;
        *self.scoring.write() = snapshot.scoring;
        *self.metrics.write() = snapshot.metrics;
    }

    /// Build the interpolation scope a step sees, including its permitted
    /// state slice and any block-local bindings.
    pub async fn scope_for(&self, use_keys: &[String], locals: &[(String, Value)]) -> Scope {
        let mut scope = Scope::new(self.input.clone(), self.env.clone())
            .with_state(self.state.visible(use_keys).await)
            .with_outputs(self.outputs.read().clone());
        for (name, value) in locals {
            scope = scope.bind(name.clone(), value.clone());
        }
        scope
    }

    pub fn record_output(&self, step_id: &str, value: Value) {
        self.outputs.write().insert(step_id.to_string(), value);
    }

    /// Interpolation scope for block-level templates (conditions, items).
    /// Blocks are engine constructs, not steps, so they see the whole
    /// state rather than a declared slice.
    pub async fn block_scope(&self, locals: &[(String, Value)]) -> Scope {
        let mut scope = Scope::new(self.input.clone(), self.env.clone())
            .with_state(self.state.snapshot().await)
            .with_outputs(self.outputs.read().clone());
        for (name, value) in locals {
            scope = scope.bind(name.clone(), value.clone());
        }
        scope
    }
}

/// How one step concluded
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Value),
    Skipped,
    /// The member raised a suspend signal; the walker must capture a frame.
    Suspended(crate::member::SuspendSignal),
}

fn build_evaluator(
    policy: &ScoringPolicy,
    ctx: &ExecutionContext,
) -> Result<Arc<dyn Evaluator>> {
    match policy.evaluator {
        EvaluatorKind::Rule => Ok(Arc::new(RuleEvaluator::new())),
        EvaluatorKind::Nlp => Ok(Arc::new(NlpEvaluator::new())),
        EvaluatorKind::Embedding => {
            let embedder = ctx.scoring_support.embedder.clone().ok_or_else(|| {
                EngineError::Validation(
                    "embedding evaluator requires an embedder capability".to_string(),
                )
            })?;
            Ok(Arc::new(EmbeddingEvaluator::new(embedder)))
        }
        EvaluatorKind::Judge => {
            let reference = policy.judge.as_deref().ok_or_else(|| {
                EngineError::Validation("judge evaluator requires a judge member".to_string())
            })?;
            let member_ref = MemberRef::parse(reference)?;
            let (judge, _meta) = ctx.registry.create(&member_ref, &ctx.env)?;
            Ok(Arc::new(JudgeEvaluator::new(judge, ctx.env.clone())))
        }
    }
}

/// Invoke a member once under the step's deadline and cancellation scope.
/// Panics are caught at this boundary and wrapped as `Unknown` failures.
async fn invoke_member_once(
    member: Arc<dyn Member>,
    member_ctx: MemberContext,
    step_id: &str,
    timeout: Option<Duration>,
    scope: &CancelScope,
) -> Result<MemberResponse> {
    if scope.is_cancelled() {
        return Err(EngineError::Cancelled(format!(
            "scope cancelled before step '{step_id}'"
        )));
    }

    let invocation_scope = member_ctx.cancellation.clone();
    let started = Instant::now();
    let handle = tokio::spawn(async move { member.execute(member_ctx).await });

    let deadline = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        joined = handle => {
            let elapsed = started.elapsed().as_millis() as u64;
            match joined {
                Ok(mut response) => {
                    if response.duration_ms == 0 {
                        response.duration_ms = elapsed;
                    }
                    Ok(response)
                }
                Err(join_error) if join_error.is_panic() => {
                    Ok(MemberResponse::failure(MemberError::new(
                        MemberErrorKind::Unknown,
                        format!("member panicked: {join_error}"),
                    ))
                    .with_duration_ms(elapsed))
                }
                Err(join_error) => Err(EngineError::Internal(format!(
                    "member task failed: {join_error}"
                ))),
            }
        }
        _ = scope.cancelled() => {
            invocation_scope.cancel();
            Err(EngineError::Cancelled(format!("step '{step_id}' cancelled")))
        }
        _ = deadline => {
            invocation_scope.cancel();
            Err(EngineError::Timeout {
                step: step_id.to_string(),
                duration_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
            })
        }
    }
}

/// One member execution with the step's transient retry policy applied.
/// Returns the successful output value, a suspend marker, or the terminal
/// failure.
#[allow(clippy::too_many_arguments)]
async fn run_member_with_retry(
    ctx: &ExecutionContext,
    member: Arc<dyn Member>,
    member_name: &str,
    step: &Step,
    step_id: &str,
    resolved_input: &Value,
    timeout: Option<Duration>,
    scope: &CancelScope,
) -> Result<Value> {
    let policy = step.retry.clone().unwrap_or_default();
    let mut attempt = 0usize;

    loop {
        attempt += 1;

        let member_ctx = MemberContext::new(
            resolved_input.clone(),
            ctx.env.clone(),
            scope.child(),
            step_id,
            Some(ctx.emitter.clone()),
        );

        let result =
            invoke_member_once(Arc::clone(&member), member_ctx, step_id, timeout, scope).await;

        let failure: MemberError = match result {
            Ok(response) => {
                let duration_ms = response.duration_ms;
                ctx.metrics
                    .write()
                    .member_timings
                    .push((step_id.to_string(), duration_ms));
                match response.outcome {
                    MemberOutcome::Success(value) => {
                        if attempt > 1 {
                            tracing::info!(step = %step_id, attempt, "member succeeded after retry");
                        }
                        return Ok(value);
                    }
                    MemberOutcome::Suspend(signal) => {
                        return Err(EngineError::Suspended {
                            step: step_id.to_string(),
                            signal,
                        });
                    }
                    MemberOutcome::Failure(error) => error,
                }
            }
            Err(EngineError::Timeout { step, duration_ms }) => {
                // A deadline miss is a retryable failure kind under the
                // policy; if retries run out it surfaces as Timeout.
                if policy.retries_kind(MemberErrorKind::Timeout) && policy.should_retry(attempt) {
                    MemberError::new(MemberErrorKind::Timeout, format!("deadline {duration_ms}ms"))
                } else {
                    return Err(EngineError::Timeout { step, duration_ms });
                }
            }
            Err(other) => return Err(other),
        };

        if policy.retries_kind(failure.kind) && policy.should_retry(attempt) {
            let delay = policy.delay(attempt);
            tracing::warn!(
                step = %step_id,
                attempt,
                error = %failure.message,
                delay_ms = delay.as_millis() as u64,
                "member failed, retrying"
            );
            ctx.metrics.write().retries += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            continue;
        }

        return Err(EngineError::MemberFailure {
            step: step_id.to_string(),
            member: member_name.to_string(),
            message: failure.message,
        });
    }
}

/// Map a member's output onto the step's declared `stateSet` keys.
///
/// An object output supplies each declared key it contains; a single
/// declared key with no matching field receives the whole output.
fn state_writes_for(step: &Step, output: &Value) -> Vec<(String, Value)> {
    let mut writes = Vec::new();
    for key in &step.state_set {
        match output {
            Value::Object(map) if map.contains_key(key) => {
                writes.push((key.clone(), map[key].clone()));
            }
            _ if step.state_set.len() == 1 => {
                writes.push((key.clone(), output.clone()));
            }
            _ => {}
        }
    }
    writes
}

/// The full per-step pipeline. Both executors call this for every step.
pub async fn execute_step(
    ctx: &ExecutionContext,
    ensemble: &Ensemble,
    step: &Step,
    step_id: &str,
    scope: &CancelScope,
    locals: &[(String, Value)],
) -> Result<StepOutcome> {
    if scope.is_cancelled() {
        return Err(EngineError::Cancelled(format!(
            "scope cancelled before step '{step_id}'"
        )));
    }

    // Resume injection: an approved gate's output was recorded by the
    // resume path; serve it instead of re-executing the member.
    if ctx.resume_skips.write().remove(step_id) {
        let value = ctx.outputs.read().get(step_id).cloned().unwrap_or(Value::Null);
        return Ok(StepOutcome::Completed(value));
    }

    let interpolator = Interpolator::new();
    let template_scope = ctx.scope_for(&step.state_use, locals).await;

    // a. conditional skip
    if let Some(when) = &step.when {
        let resolved = interpolator.resolve(when, &template_scope)?;
        if !Interpolator::truthy(&resolved) {
            ctx.emitter.emit(
                EventKind::StepSkipped,
                Some(step_id),
                json!({"reason": "when"}),
            );
            return Ok(StepOutcome::Skipped);
        }
    }

    // b. input resolution
    let resolved_input = match &step.input {
        Some(template) => interpolator.resolve(template, &template_scope)?,
        None => Value::Null,
    };

    let member_ref = MemberRef::parse(&step.member)?;
    let (member, metadata) = ctx.registry.create(&member_ref, &ctx.env)?;

    ctx.emitter.emit(
        EventKind::StepStarted,
        Some(step_id),
        json!({"member": metadata.name, "version": metadata.version}),
    );

    // c. fingerprint
    let cache_spec = step.cache.clone().unwrap_or_default();
    let key = fingerprint(
        &metadata.name,
        &metadata.version,
        &resolved_input,
        &metadata.config,
    );

    // Within one run, an already-observed fingerprint stays consistent
    // regardless of shared-cache expiry.
    if cache_spec.enabled && !cache_spec.bypass {
        let seen_value = ctx.seen.read().get(&key).cloned();
        if let Some(value) = seen_value {
            ctx.metrics.write().cache_hits += 1;
            return finish_step(ctx, step, step_id, value, None, CacheOutcome::Hit, scope).await;
        }
    }

    let timeout = step
        .timeout
        .or(ensemble.default_timeout)
        .map(Duration::from_secs_f64);

    let put_options = PutOptions {
        ttl: cache_spec.ttl.map(Duration::from_secs),
        tags: cache_spec.tags.clone(),
    };

    // e-g. member invocation, scoring loop, transient retries - all under
    // the per-fingerprint flight when caching is enabled. The closure
    // takes ownership of what the invocation needs so the future it
    // returns is self-contained.
    let scoring_policy = step.scoring.clone().or_else(|| ensemble.scoring.clone());
    let compute = move || async move {
        match &scoring_policy {
            None => {
                run_member_with_retry(
                    ctx,
                    Arc::clone(&member),
                    &metadata.name,
                    step,
                    step_id,
                    &resolved_input,
                    timeout,
                    scope,
                )
                .await
            }
            Some(policy) => {
                policy.validate()?;
                let evaluator = build_evaluator(policy, ctx)?;
                let controller = ScoringController::new(policy.clone(), evaluator);
                let outcome = controller
                    .run(step_id, |_attempt| {
                        run_member_with_retry(
                            ctx,
                            Arc::clone(&member),
                            &metadata.name,
                            step,
                            step_id,
                            &resolved_input,
                            timeout,
                            scope,
                        )
                    })
                    .await?;

                ctx.scoring
                    .write()
                    .record(step_id, &outcome.report, outcome.retry_count);
                if policy.track_in_state {
                    let aggregate = ctx.scoring.read().aggregate;
                    ctx.state
                        .set_reserved(&format!("$scores.{step_id}"), json!(outcome.report.average))
                        .await;
                    ctx.state.set_reserved("$score", json!(aggregate)).await;
                }
                Ok(outcome.value)
            }
        }
    };

    let (result, outcome) = if cache_spec.enabled {
        ctx.cache
            .get_or_compute(&key, cache_spec.bypass, put_options, compute)
            .await
    } else {
        (compute().await, CacheOutcome::Bypassed)
    };

    match result {
        Ok(value) => {
            if outcome == CacheOutcome::Hit {
                ctx.metrics.write().cache_hits += 1;
            }
            if cache_spec.enabled {
                ctx.seen.write().insert(key, value.clone());
            }
            let score = ctx.scoring.read().per_step.get(step_id).map(|r| r.average);
            finish_step(ctx, step, step_id, value, score, outcome, scope).await
        }
        Err(error) => {
            let error = unwrap_shared(error);
            match error {
                EngineError::Suspended { signal, .. } => {
                    // Suspension is not a failure: no state writes, no
                    // cache entry, the walker captures a frame.
                    Ok(StepOutcome::Suspended(signal))
                }
                error => {
                    ctx.emitter.emit(
                        EventKind::StepFailed,
                        Some(step_id),
                        json!({"kind": error.kind(), "message": error.to_string()}),
                    );
                    Err(error)
                }
            }
        }
    }
}

/// Shared-flight errors carry the leader's error; unwrap one level so
/// control-flow markers (suspension) are visible to waiters too.
fn unwrap_shared(error: EngineError) -> EngineError {
    match error {
        EngineError::SharedFlight(inner) => match &*inner {
            EngineError::Suspended { step, signal } => EngineError::Suspended {
                step: step.clone(),
                signal: signal.clone(),
            },
            _ => EngineError::SharedFlight(inner),
        },
        other => other,
    }
}

/// h. success path: state writes, output record, completion event.
///
/// A terminated scope rejects commits: work that raced past its
/// cancellation point must not leak state.
async fn finish_step(
    ctx: &ExecutionContext,
    step: &Step,
    step_id: &str,
    value: Value,
    score: Option<f64>,
    cache_outcome: CacheOutcome,
    scope: &CancelScope,
) -> Result<StepOutcome> {
    if scope.is_cancelled() {
        return Err(EngineError::Cancelled(format!(
            "scope cancelled before commit of step '{step_id}'"
        )));
    }
    let mut handle = ctx
        .state
        .begin_step(step_id, &step.state_use, &step.state_set)
        .await;
    for (key, write_value) in state_writes_for(step, &value) {
        handle.write(&key, write_value)?;
    }
    handle.commit().await?;

    ctx.record_output(step_id, value.clone());
    ctx.emitter.emit(
        EventKind::StepCompleted,
        Some(step_id),
        json!({
            "cache": format!("{cache_outcome:?}").to_lowercase(),
            "score": score,
        }),
    );
    Ok(StepOutcome::Completed(value))
}
