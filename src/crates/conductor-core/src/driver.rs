//! Ensemble driver - the top-level execution entry point
//!
//! The [`Engine`] owns the long-lived pieces (member registry, shared
//! step cache, frame store, event sinks) and exposes:
//!
//! - [`Engine::run`] - validate, initialize state, route to the linear
//!   executor or graph scheduler, project the output, return a
//!   [`RunOutcome`]
//! - [`Engine::resume`] - rehydrate a suspended frame and continue from
//!   its exact frontier
//! - [`Engine::approve`] / [`Engine::reject`] / [`Engine::cancel_token`] -
//!   the external approval surface
//!
//! Validation happens before any step runs: structural ensemble checks
//! plus resolution of every member reference against the registry.
//! Failures there never touch state, cache, or members.

use crate::cache::StepCache;
use crate::error::{EngineError, Result};
use crate::events::{EventEmitter, EventKind, EventSink, History};
use crate::executor::graph::{GraphOutcome, GraphScheduler};
use crate::executor::linear::{LinearExecutor, WalkOutcome};
use crate::executor::plan::assign_node_ids;
use crate::executor::scope::CancelScope;
use crate::executor::{ExecutionContext, RunMetrics, ScoringRecord, ScoringSupport};
use crate::flow::{assign_step_ids, Ensemble, FlowElement};
use crate::registry::{MemberRef, MemberRegistry};
use crate::state::StateStore;
use crate::suspend::SuspendManager;
use crate::template::Interpolator;
use chrono::{DateTime, Utc};
use conductor_frame::{FrameStore, InMemoryFrameStore, ResumePoint};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Terminal status of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum RunStatus {
    Completed,
    Suspended {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Failed,
}

/// Structured error surface of a failed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    fn from_error(error: &EngineError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            step: error.step().map(|s| s.to_string()),
            details: None,
        }
    }
}

/// What a run returns to the caller
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ok: bool,
    pub status: RunStatus,
    /// Projected output on success
    pub data: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub metrics: RunMetrics,
    /// Per-step score reports and retry counts
    pub scoring: ScoringRecord,
    pub execution_id: String,
    /// Step outputs recorded before a failure
    pub partial_outputs: Option<HashMap<String, Value>>,
    /// The full replayable event trace
    pub history: History,
}

impl RunOutcome {
    /// Process exit code mapping for embedding CLIs: 0 success,
    /// 1 validation error, 2 execution error, 3 timeout, 4 suspended.
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            RunStatus::Completed => 0,
            RunStatus::Suspended { .. } => 4,
            RunStatus::Failed => match self.error.as_ref().map(|e| e.kind.as_str()) {
                Some("ValidationError")
                | Some("MemberNotFound")
                | Some("CyclicDependency")
                | Some("ConflictingWrites") => 1,
                Some("Timeout") => 3,
                _ => 2,
            },
        }
    }
}

/// Long-lived engine wiring shared across executions
pub struct Engine {
    registry: Arc<MemberRegistry>,
    cache: Arc<StepCache>,
    suspend: SuspendManager,
    sinks: Vec<Arc<dyn EventSink>>,
    scoring_support: ScoringSupport,
    env: Value,
}

impl Engine {
    /// Engine with in-memory frames and default cache - the test and
    /// single-process configuration.
    pub fn new(registry: Arc<MemberRegistry>) -> Self {
        Self::with_frame_store(registry, Arc::new(InMemoryFrameStore::new()))
    }

    pub fn with_frame_store(registry: Arc<MemberRegistry>, frames: Arc<dyn FrameStore>) -> Self {
        Self {
            registry,
            cache: Arc::new(StepCache::default()),
            suspend: SuspendManager::new(frames),
            sinks: Vec::new(),
            scoring_support: ScoringSupport::default(),
            env: Value::Null,
        }
    }

    pub fn with_cache(mut self, cache: Arc<StepCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_env(mut self, env: Value) -> Self {
        self.env = env;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_scoring_support(mut self, support: ScoringSupport) -> Self {
        self.scoring_support = support;
        self
    }

    pub fn with_suspend_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.suspend = self.suspend.with_ttl(ttl);
        self
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<StepCache> {
        &self.cache
    }

    pub fn suspend_manager(&self) -> &SuspendManager {
        &self.suspend
    }

    /// Pre-execution validation: ensemble structure plus member-reference
    /// resolution against the registry.
    pub fn validate(&self, ensemble: &Ensemble) -> Result<()> {
        ensemble.validate()?;
        for reference in ensemble.member_refs() {
            let member_ref = MemberRef::parse(&reference)?;
            if !self.registry.contains(&member_ref) {
                return Err(EngineError::MemberNotFound(reference));
            }
        }
        Ok(())
    }

    /// Execute an ensemble from the start.
    pub async fn run(&self, ensemble: &Ensemble, input: Value) -> RunOutcome {
        let execution_id = Uuid::new_v4().to_string();
        let emitter = EventEmitter::new(execution_id.clone(), self.sinks.clone());
        let history = emitter.history().clone();

        if let Err(error) = self.validate(ensemble) {
            return failure_outcome(execution_id, history, RunMetrics::default(), None, error);
        }

        let state = StateStore::new(ensemble.state_schema());
        if let Err(error) = state.apply_initial(&ensemble.initial_state()).await {
            return failure_outcome(execution_id, history, RunMetrics::default(), None, error);
        }

        let ctx = ExecutionContext::new(
            execution_id.clone(),
            input,
            self.env.clone(),
            state,
            emitter.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            self.scoring_support.clone(),
        );

        emitter.emit(
            EventKind::EnsembleStarted,
            None,
            json!({"ensemble": ensemble.name}),
        );

        self.drive(ensemble, ctx, ResumeFrontier::Fresh).await
    }

    /// Approve a pending frame. External actor surface.
    pub async fn approve(&self, token: &str, actor: &str, data: Option<Value>) -> Result<()> {
        self.suspend.approve(token, actor, data).await.map(|_| ())
    }

    /// Reject a pending frame. External actor surface.
    pub async fn reject(&self, token: &str, actor: &str, reason: Option<String>) -> Result<()> {
        self.suspend.reject(token, actor, reason).await.map(|_| ())
    }

    /// Delete a frame outright.
    pub async fn cancel_token(&self, token: &str) -> Result<bool> {
        self.suspend.cancel(token).await
    }

    /// Resume a suspended execution from its frame.
    ///
    /// `resumption_data` overrides the data attached at approval time;
    /// either becomes the output of the suspended step.
    pub async fn resume(
        &self,
        ensemble: &Ensemble,
        token: &str,
        resumption_data: Option<Value>,
    ) -> RunOutcome {
        let execution_id = Uuid::new_v4().to_string();
        let emitter = EventEmitter::new(execution_id.clone(), self.sinks.clone());
        let history = emitter.history().clone();

        let (frame, approved_data) = match self.suspend.take_approved(token).await {
            Ok(loaded) => loaded,
            Err(error) => {
                return failure_outcome(execution_id, history, RunMetrics::default(), None, error)
            }
        };

        if frame.ensemble.name != ensemble.name {
            return failure_outcome(
                execution_id,
                history,
                RunMetrics::default(),
                None,
                EngineError::Validation(format!(
                    "token belongs to ensemble '{}', not '{}'",
                    frame.ensemble.name, ensemble.name
                )),
            );
        }

        let snapshot = match SuspendManager::snapshot_of(&frame) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                return failure_outcome(execution_id, history, RunMetrics::default(), None, error)
            }
        };

        let state = StateStore::new(ensemble.state_schema());
        let ctx = ExecutionContext::new(
            execution_id.clone(),
            snapshot.input.clone(),
            self.env.clone(),
            state,
            emitter.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            self.scoring_support.clone(),
        );
        ctx.restore(snapshot).await;

        // The approved gate's output: explicit resumption data wins over
        // approval-time data.
        let gate_output = resumption_data.or(approved_data).unwrap_or(Value::Null);
        ctx.record_output(&frame.suspended_by, gate_output);
        ctx.skip_once(&frame.suspended_by);

        emitter.emit(
            EventKind::Resumed,
            Some(&frame.suspended_by),
            json!({"token": token, "ensemble": ensemble.name}),
        );

        let frontier = match frame.resume_at.clone() {
            ResumePoint::Linear { index } => ResumeFrontier::Linear { index },
            ResumePoint::Graph { completed } => ResumeFrontier::Graph {
                completed: completed.into_iter().collect(),
            },
        };
        self.drive(ensemble, ctx, frontier).await
    }

    /// Shared walk-and-project tail of `run` and `resume`.
    async fn drive(
        &self,
        ensemble: &Ensemble,
        ctx: ExecutionContext,
        frontier: ResumeFrontier,
    ) -> RunOutcome {
        let scope = CancelScope::new();
        let emitter = ctx.emitter.clone();
        let history = emitter.history().clone();
        let execution_id = ctx.execution_id.clone();

        let walked = if ensemble.has_graph_constructs() {
            let completed = match &frontier {
                ResumeFrontier::Graph { completed } => completed.clone(),
                _ => HashSet::new(),
            };
            GraphScheduler::run(&ctx, ensemble, &scope, &completed)
                .await
                .map(|outcome| match outcome {
                    GraphOutcome::Completed => Walked::Completed,
                    GraphOutcome::Suspended {
                        step_id,
                        signal,
                        completed,
                    } => Walked::Suspended {
                        step_id,
                        signal,
                        resume_at: ResumePoint::Graph { completed },
                    },
                })
        } else {
            let start_index = match &frontier {
                ResumeFrontier::Linear { index } => *index,
                _ => 0,
            };
            LinearExecutor::run(&ctx, ensemble, start_index, &scope)
                .await
                .map(|outcome| match outcome {
                    WalkOutcome::Completed => Walked::Completed,
                    WalkOutcome::Suspended {
                        step_id,
                        index,
                        signal,
                    } => Walked::Suspended {
                        step_id,
                        signal,
                        // The gate's output is injected at resume time;
                        // execution continues at the next step.
                        resume_at: ResumePoint::Linear { index: index + 1 },
                    },
                })
        };

        let metrics = ctx.metrics.read().clone();
        match walked {
            Ok(Walked::Completed) => {
                let data = match self.project_output(ensemble, &ctx).await {
                    Ok(data) => data,
                    Err(error) => {
                        let outputs = ctx.outputs.read().clone();
                        emitter.emit(
                            EventKind::EnsembleFailed,
                            None,
                            json!({"kind": error.kind()}),
                        );
                        return failure_outcome(
                            execution_id,
                            history,
                            metrics,
                            Some(outputs),
                            error,
                        );
                    }
                };
                emitter.emit(EventKind::EnsembleCompleted, None, json!({}));
                RunOutcome {
                    ok: true,
                    status: RunStatus::Completed,
                    data: Some(data),
                    error: None,
                    metrics,
                    scoring: ctx.scoring.read().clone(),
                    execution_id,
                    partial_outputs: None,
                    history,
                }
            }
            Ok(Walked::Suspended {
                step_id,
                signal,
                resume_at,
            }) => {
                let snapshot = ctx.snapshot().await;
                let captured = self
                    .suspend
                    .capture(
                        &ensemble.name,
                        ensemble.version.as_deref(),
                        snapshot,
                        resume_at,
                        &step_id,
                        &signal,
                    )
                    .await;
                match captured {
                    Ok(frame) => {
                        emitter.emit(
                            EventKind::Suspended,
                            Some(&step_id),
                            json!({"token": frame.token, "reason": signal.reason}),
                        );
                        RunOutcome {
                            ok: true,
                            status: RunStatus::Suspended {
                                token: frame.token,
                                expires_at: frame.expires_at,
                            },
                            data: None,
                            error: None,
                            metrics,
                            scoring: ctx.scoring.read().clone(),
                            execution_id,
                            partial_outputs: Some(ctx.outputs.read().clone()),
                            history,
                        }
                    }
                    Err(error) => {
                        failure_outcome(execution_id, history, metrics, None, error)
                    }
                }
            }
            Err(error) => {
                let outputs = ctx.outputs.read().clone();
                emitter.emit(
                    EventKind::EnsembleFailed,
                    None,
                    json!({"kind": error.kind(), "message": error.to_string()}),
                );
                failure_outcome(execution_id, history, metrics, Some(outputs), error)
            }
        }
    }

    /// Project the ensemble's `output` template, or fall back to the last
    /// completed step's output.
    async fn project_output(&self, ensemble: &Ensemble, ctx: &ExecutionContext) -> Result<Value> {
        match &ensemble.output {
            Some(template) => {
                let scope = ctx.block_scope(&[]).await;
                Interpolator::new().resolve(template, &scope)
            }
            None => {
                let outputs = ctx.outputs.read();
                let candidate_ids: Vec<String> = if ensemble.has_graph_constructs() {
                    assign_node_ids(&ensemble.flow)
                } else {
                    let steps: Vec<&crate::flow::Step> = ensemble
                        .flow
                        .iter()
                        .filter_map(|e| match e {
                            FlowElement::Step(step) => Some(step),
                            _ => None,
                        })
                        .collect();
                    assign_step_ids(&steps)
                };
                Ok(candidate_ids
                    .iter()
                    .rev()
                    .find_map(|id| outputs.get(id).cloned())
                    .unwrap_or_else(|| json!({})))
            }
        }
    }
}

enum ResumeFrontier {
    Fresh,
    Linear { index: usize },
    Graph { completed: HashSet<String> },
}

enum Walked {
    Completed,
    Suspended {
        step_id: String,
        signal: crate::member::SuspendSignal,
        resume_at: ResumePoint,
    },
}

fn failure_outcome(
    execution_id: String,
    history: History,
    metrics: RunMetrics,
    partial_outputs: Option<HashMap<String, Value>>,
    error: EngineError,
) -> RunOutcome {
    RunOutcome {
        ok: false,
        status: RunStatus::Failed,
        data: None,
        error: Some(ErrorInfo::from_error(&error)),
        metrics,
        scoring: ScoringRecord::default(),
        execution_id,
        partial_outputs,
        history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Step;
    use crate::member::{
        FnMember, Member, MemberContext, MemberKind, MemberMetadata, MemberResponse,
    };

    fn registry() -> Arc<MemberRegistry> {
        let registry = MemberRegistry::new();
        registry
            .register(
                MemberMetadata::new("echo", MemberKind::Function, "1.0.0"),
                Arc::new(|_c, _e| {
                    Ok(FnMember::new(|ctx: MemberContext| async move {
                        MemberResponse::success(ctx.input)
                    }) as Arc<dyn Member>)
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_empty_flow_returns_empty_object() {
        let engine = Engine::new(registry());
        let ensemble = Ensemble::new("empty", vec![]);
        let outcome = engine.run(&ensemble, json!({})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.data, Some(json!({})));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_unknown_member_fails_validation_before_any_step() {
        let engine = Engine::new(registry());
        let ensemble = Ensemble::new("bad", vec![FlowElement::Step(Step::new("ghost"))]);
        let outcome = engine.run(&ensemble, json!({})).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_ref().unwrap().kind, "MemberNotFound");
        assert_eq!(outcome.exit_code(), 1);
        // Nothing started
        assert!(outcome.history.is_empty());
    }

    #[tokio::test]
    async fn test_default_output_is_last_step() {
        let engine = Engine::new(registry());
        let ensemble = Ensemble::new(
            "chain",
            vec![
                FlowElement::Step(Step::new("echo").with_input(json!({"first": true}))),
                FlowElement::Step(Step::new("echo").with_input(json!({"second": true}))),
            ],
        );
        let outcome = engine.run(&ensemble, json!({})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.data, Some(json!({"second": true})));
    }

    #[tokio::test]
    async fn test_output_projection_template() {
        let engine = Engine::new(registry());
        let ensemble = Ensemble::new(
            "projected",
            vec![FlowElement::Step(
                Step::new("echo").with_input(json!({"value": "${input.x}"})),
            )],
        )
        .with_output(json!({"wrapped": "${echo.output.value}"}));
        let outcome = engine.run(&ensemble, json!({"x": 41})).await;
        assert_eq!(outcome.data, Some(json!({"wrapped": 41})));
    }

    #[tokio::test]
    async fn test_exit_code_mapping() {
        let engine = Engine::new(registry());
        let ensemble = Ensemble::new("empty", vec![]);
        let ok = engine.run(&ensemble, json!({})).await;
        assert_eq!(ok.exit_code(), 0);

        let failed = failure_outcome(
            "x".into(),
            History::new(),
            RunMetrics::default(),
            None,
            EngineError::Timeout {
                step: "s".into(),
                duration_ms: 10,
            },
        );
        assert_eq!(failed.exit_code(), 3);
    }
}
