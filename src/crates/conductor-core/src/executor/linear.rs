//! Linear executor - strictly ordered sequential flows
//!
//! A flow containing only plain steps (no control blocks, no `dependsOn`
//! edges) executes here: steps run in declared order, one at a time, with
//! no reordering even when dependencies would allow it. Each step goes
//! through the shared pipeline in [`super`] (interpolation, cache,
//! scoring, state commit, events).
//!
//! The walker supports starting at an arbitrary index, which is how
//! resumption re-enters the flow at the exact step after a suspension.

use super::scope::CancelScope;
use super::{execute_step, ExecutionContext, StepOutcome};
use crate::error::{EngineError, Result};
use crate::flow::{assign_step_ids, Ensemble, FlowElement, Step};
use crate::member::SuspendSignal;

/// How a linear walk ended
#[derive(Debug, Clone)]
pub enum WalkOutcome {
    /// Every step completed or was skipped
    Completed,
    /// A member suspended at `index`; resume continues at `index + 1`
    Suspended {
        step_id: String,
        index: usize,
        signal: SuspendSignal,
    },
}

/// Sequential walker over a linear flow
pub struct LinearExecutor;

impl LinearExecutor {
    /// Collect the flow's steps, rejecting graph constructs.
    fn steps(ensemble: &Ensemble) -> Result<Vec<&Step>> {
        ensemble
            .flow
            .iter()
            .map(|element| match element {
                FlowElement::Step(step) => Ok(step),
                _ => Err(EngineError::Internal(
                    "graph construct routed to the linear executor".to_string(),
                )),
            })
            .collect()
    }

    /// Walk the flow from `start_index` (0 for a fresh run).
    pub async fn run(
        ctx: &ExecutionContext,
        ensemble: &Ensemble,
        start_index: usize,
        scope: &CancelScope,
    ) -> Result<WalkOutcome> {
        let steps = Self::steps(ensemble)?;
        let step_ids = assign_step_ids(&steps);

        for index in start_index..steps.len() {
            let step = steps[index];
            let step_id = &step_ids[index];

            match execute_step(ctx, ensemble, step, step_id, scope, &[]).await? {
                StepOutcome::Completed(_) | StepOutcome::Skipped => {}
                StepOutcome::Suspended(signal) => {
                    tracing::info!(
                        step = %step_id,
                        index,
                        reason = %signal.reason,
                        "linear flow suspended"
                    );
                    return Ok(WalkOutcome::Suspended {
                        step_id: step_id.clone(),
                        index,
                        signal,
                    });
                }
            }
        }
        Ok(WalkOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StepCache;
    use crate::events::EventEmitter;
    use crate::executor::ScoringSupport;
    use crate::member::{
        FnMember, Member, MemberContext, MemberKind, MemberMetadata, MemberResponse,
    };
    use crate::registry::MemberRegistry;
    use crate::state::{StateSchema, StateStore};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn registry() -> Arc<MemberRegistry> {
        let registry = MemberRegistry::new();
        registry
            .register(
                MemberMetadata::new("upper", MemberKind::Function, "1.0.0"),
                Arc::new(|_c, _e| {
                    Ok(FnMember::new(|ctx: MemberContext| async move {
                        let text = ctx.input["text"].as_str().unwrap_or_default();
                        MemberResponse::success(json!(text.to_uppercase()))
                    }) as Arc<dyn Member>)
                }),
            )
            .unwrap();
        registry
            .register(
                MemberMetadata::new("join", MemberKind::Function, "1.0.0"),
                Arc::new(|_c, _e| {
                    Ok(FnMember::new(|ctx: MemberContext| async move {
                        let a = ctx.input["a"].as_str().unwrap_or_default();
                        let b = ctx.input["b"].as_str().unwrap_or_default();
                        MemberResponse::success(json!(format!("{a}{b}")))
                    }) as Arc<dyn Member>)
                }),
            )
            .unwrap();
        registry
            .register(
                MemberMetadata::new("gate", MemberKind::Form, "1.0.0"),
                Arc::new(|_c, _e| {
                    Ok(FnMember::new(|_ctx: MemberContext| async move {
                        MemberResponse::suspend(SuspendSignal::new("human-approval"))
                    }) as Arc<dyn Member>)
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn ctx(input: Value) -> ExecutionContext {
        ExecutionContext::new(
            "exec-lin",
            input,
            Value::Null,
            StateStore::new(StateSchema::new()),
            EventEmitter::new("exec-lin", vec![]),
            Arc::new(StepCache::default()),
            registry(),
            ScoringSupport::default(),
        )
    }

    fn greet_ensemble() -> Ensemble {
        Ensemble::new(
            "greet",
            vec![
                FlowElement::Step(
                    Step::new("upper").with_input(json!({"text": "${input.name}"})),
                ),
                FlowElement::Step(
                    Step::new("join")
                        .with_input(json!({"a": "Hello, ", "b": "${upper.output}"})),
                ),
            ],
        )
    }

    #[tokio::test]
    async fn test_sequential_interpolation_chain() {
        let ctx = ctx(json!({"name": "ada"}));
        let outcome = LinearExecutor::run(&ctx, &greet_ensemble(), 0, &CancelScope::new())
            .await
            .unwrap();
        assert!(matches!(outcome, WalkOutcome::Completed));
        assert_eq!(
            ctx.outputs.read().get("join"),
            Some(&json!("Hello, ADA"))
        );
    }

    #[tokio::test]
    async fn test_empty_flow_completes_immediately() {
        let ctx = ctx(json!({}));
        let ensemble = Ensemble::new("empty", vec![]);
        let outcome = LinearExecutor::run(&ctx, &ensemble, 0, &CancelScope::new())
            .await
            .unwrap();
        assert!(matches!(outcome, WalkOutcome::Completed));
        assert!(ctx.outputs.read().is_empty());
    }

    #[tokio::test]
    async fn test_suspension_reports_position() {
        let ctx = ctx(json!({"name": "ada"}));
        let ensemble = Ensemble::new(
            "gated",
            vec![
                FlowElement::Step(
                    Step::new("upper").with_input(json!({"text": "${input.name}"})),
                ),
                FlowElement::Step(Step::new("gate")),
                FlowElement::Step(
                    Step::new("join").with_input(json!({"a": "x", "b": "y"})),
                ),
            ],
        );
        let outcome = LinearExecutor::run(&ctx, &ensemble, 0, &CancelScope::new())
            .await
            .unwrap();
        match outcome {
            WalkOutcome::Suspended { step_id, index, signal } => {
                assert_eq!(step_id, "gate");
                assert_eq!(index, 1);
                assert_eq!(signal.reason, "human-approval");
            }
            other => panic!("expected suspension, got {other:?}"),
        }
        // The step after the gate never ran
        assert!(!ctx.outputs.read().contains_key("join"));
    }

    #[tokio::test]
    async fn test_resume_from_index_skips_completed_prefix() {
        let ctx = ctx(json!({"name": "ada"}));
        // Pretend the first step already ran and its output was recorded
        ctx.record_output("upper", json!("ADA"));

        let outcome = LinearExecutor::run(&ctx, &greet_ensemble(), 1, &CancelScope::new())
            .await
            .unwrap();
        assert!(matches!(outcome, WalkOutcome::Completed));
        assert_eq!(
            ctx.outputs.read().get("join"),
            Some(&json!("Hello, ADA"))
        );
    }

    #[tokio::test]
    async fn test_repeated_member_ids_disambiguate() {
        let ctx = ctx(json!({"name": "ada"}));
        let ensemble = Ensemble::new(
            "twice",
            vec![
                FlowElement::Step(Step::new("upper").with_input(json!({"text": "a"}))),
                FlowElement::Step(Step::new("upper").with_input(json!({"text": "b"}))),
            ],
        );
        LinearExecutor::run(&ctx, &ensemble, 0, &CancelScope::new())
            .await
            .unwrap();
        let outputs = ctx.outputs.read();
        assert_eq!(outputs.get("upper"), Some(&json!("A")));
        assert_eq!(outputs.get("upper#2"), Some(&json!("B")));
    }
}
