//! End-to-end scenarios over the public engine API

use conductor_core::{
    Criterion, Engine, Ensemble, EvaluatorKind, FlowElement, FnMember, ForeachBlock, Member,
    MemberContext, MemberError, MemberKind, MemberMetadata, MemberRegistry, MemberResponse,
    OnFailure, ParallelBlock, RunStatus, ScoreBackoff, ScoringPolicy, Step, SuspendSignal,
    Thresholds, WaitFor, WhileBlock,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn base_registry() -> (Arc<MemberRegistry>, Arc<AtomicUsize>) {
    let registry = MemberRegistry::new();
    let invocations = Arc::new(AtomicUsize::new(0));

    let upper_count = Arc::clone(&invocations);
    registry
        .register(
            MemberMetadata::new("upper", MemberKind::Function, "1.0.0"),
            Arc::new(move |_c, _e| {
                let count = Arc::clone(&upper_count);
                Ok(FnMember::new(move |ctx: MemberContext| {
                    let count = Arc::clone(&count);
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        let text = ctx.input["text"].as_str().unwrap_or_default();
                        MemberResponse::success(json!(text.to_uppercase()))
                    }
                }) as Arc<dyn Member>)
            }),
        )
        .unwrap();

    let join_count = Arc::clone(&invocations);
    registry
        .register(
            MemberMetadata::new("join", MemberKind::Function, "1.0.0"),
            Arc::new(move |_c, _e| {
                let count = Arc::clone(&join_count);
                Ok(FnMember::new(move |ctx: MemberContext| {
                    let count = Arc::clone(&count);
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        let a = ctx.input["a"].as_str().unwrap_or_default();
                        let b = ctx.input["b"].as_str().unwrap_or_default();
                        MemberResponse::success(json!(format!("{a}{b}")))
                    }
                }) as Arc<dyn Member>)
            }),
        )
        .unwrap();

    (Arc::new(registry), invocations)
}

fn greet_ensemble() -> Ensemble {
    Ensemble::new(
        "greet",
        vec![
            FlowElement::Step(Step::new("upper").with_input(json!({"text": "${input.name}"}))),
            FlowElement::Step(
                Step::new("join").with_input(json!({"a": "Hello, ", "b": "${upper.output}"})),
            ),
        ],
    )
    .with_output(json!({"msg": "${join.output}"}))
}

#[tokio::test]
async fn scenario_linear_with_interpolation() {
    let (registry, _) = base_registry();
    let engine = Engine::new(registry);

    let outcome = engine.run(&greet_ensemble(), json!({"name": "ada"})).await;
    assert!(outcome.ok);
    assert_eq!(outcome.data, Some(json!({"msg": "Hello, ADA"})));
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn scenario_second_run_is_fully_cached() {
    let (registry, invocations) = base_registry();
    let engine = Engine::new(registry);
    let ensemble = greet_ensemble();

    let first = engine.run(&ensemble, json!({"name": "ada"})).await;
    assert!(first.ok);
    assert_eq!(first.metrics.cache_hits, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let second = engine.run(&ensemble, json!({"name": "ada"})).await;
    assert!(second.ok);
    assert_eq!(second.data, Some(json!({"msg": "Hello, ADA"})));
    assert_eq!(second.metrics.cache_hits, 2);
    // No member implementation ran again
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scenario_scoring_retry_until_threshold() {
    let registry = MemberRegistry::new();
    let lengths = [20usize, 30, 50];
    let attempt = Arc::new(AtomicUsize::new(0));
    let member_attempt = Arc::clone(&attempt);
    registry
        .register(
            MemberMetadata::new("draft", MemberKind::Think, "1.0.0"),
            Arc::new(move |_c, _e| {
                let attempt = Arc::clone(&member_attempt);
                Ok(FnMember::new(move |_ctx: MemberContext| {
                    let attempt = Arc::clone(&attempt);
                    async move {
                        let n = lengths[attempt.fetch_add(1, Ordering::SeqCst).min(2)];
                        MemberResponse::success(json!("x".repeat(n)))
                    }
                }) as Arc<dyn Member>)
            }),
        )
        .unwrap();

    let mut step = Step::new("draft");
    step.scoring = Some(ScoringPolicy {
        evaluator: EvaluatorKind::Rule,
        criteria: vec![Criterion::rule("length", "length >= 40")],
        thresholds: Thresholds::minimum(1.0),
        aggregation: Default::default(),
        retry_limit: 3,
        backoff: ScoreBackoff::Fixed,
        initial_backoff: 0.0,
        require_improvement: false,
        min_improvement: 0.0,
        on_failure: OnFailure::Abort,
        judge: None,
        track_in_state: false,
    });

    let engine = Engine::new(Arc::new(registry));
    let ensemble = Ensemble::new("scored", vec![FlowElement::Step(step)]);
    let outcome = engine.run(&ensemble, json!({})).await;

    assert!(outcome.ok);
    assert_eq!(attempt.load(Ordering::SeqCst), 3);
    let report = &outcome.scoring.per_step["draft"];
    assert!(report.passed);
    assert_eq!(outcome.scoring.retry_counts["draft"], 2);
}

#[tokio::test]
async fn scenario_parallel_failure_cancels_siblings() {
    let registry = MemberRegistry::new();
    for (name, delay_ms, fails) in [("m1", 500u64, false), ("m2", 50, true), ("m3", 500, false)] {
        registry
            .register(
                MemberMetadata::new(name, MemberKind::Api, "1.0.0"),
                Arc::new(move |_c, _e| {
                    Ok(FnMember::new(move |ctx: MemberContext| async move {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                            _ = ctx.cancellation.cancelled() => {
                                return MemberResponse::failure(MemberError::permanent("cancelled"));
                            }
                        }
                        if fails {
                            MemberResponse::failure(MemberError::permanent("exploded"))
                        } else {
                            MemberResponse::success(json!("done"))
                        }
                    }) as Arc<dyn Member>)
                }),
            )
            .unwrap();
    }

    let mut m1 = Step::new("m1");
    m1.state_set = vec!["a".to_string()];
    let mut m3 = Step::new("m3");
    m3.state_set = vec!["b".to_string()];
    let ensemble = Ensemble::new(
        "par",
        vec![FlowElement::Parallel {
            parallel: ParallelBlock {
                id: None,
                wait_for: WaitFor::All,
                children: vec![
                    FlowElement::Step(m1),
                    FlowElement::Step(Step::new("m2")),
                    FlowElement::Step(m3),
                ],
                max_concurrency: None,
            },
        }],
    );

    let engine = Engine::new(Arc::new(registry));
    let started = Instant::now();
    let outcome = engine.run(&ensemble, json!({})).await;
    let elapsed = started.elapsed();

    assert!(!outcome.ok);
    assert_eq!(outcome.error.as_ref().unwrap().kind, "MemberFailure");
    // Siblings were cancelled promptly instead of running out their 500ms
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    // No sibling output or state commit survived
    let partial = outcome.partial_outputs.unwrap_or_default();
    assert!(!partial.contains_key("m1"));
    assert!(!partial.contains_key("m3"));
}

#[tokio::test]
async fn scenario_suspend_approve_resume() {
    let (registry, _) = base_registry();
    registry
        .register(
            MemberMetadata::new("gate", MemberKind::Form, "1.0.0"),
            Arc::new(|_c, _e| {
                Ok(FnMember::new(|_ctx: MemberContext| async move {
                    MemberResponse::suspend(
                        SuspendSignal::new("human-approval")
                            .with_approval_data(json!({"needs": "sign-off"})),
                    )
                }) as Arc<dyn Member>)
            }),
        )
        .unwrap();

    let ensemble = Ensemble::new(
        "gated",
        vec![
            FlowElement::Step(Step::new("upper").with_input(json!({"text": "${input.name}"}))),
            FlowElement::Step(Step::new("gate")),
            FlowElement::Step(
                Step::new("join").with_input(json!({"a": "Hello, ", "b": "${upper.output}"})),
            ),
        ],
    )
    .with_output(json!({"msg": "${join.output}"}));

    let engine = Engine::new(registry);
    let suspended = engine.run(&ensemble, json!({"name": "ada"})).await;

    assert!(suspended.ok);
    let token = match &suspended.status {
        RunStatus::Suspended { token, expires_at } => {
            assert!(token.starts_with("resume_"));
            assert!(*expires_at > chrono::Utc::now());
            token.clone()
        }
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(suspended.exit_code(), 4);

    engine
        .approve(&token, "alice", Some(json!({"approved": true})))
        .await
        .unwrap();

    let resumed = engine.resume(&ensemble, &token, None).await;
    assert!(resumed.ok, "resume failed: {:?}", resumed.error);
    // Same final output as a run that never suspended
    assert_eq!(resumed.data, Some(json!({"msg": "Hello, ADA"})));

    // Tokens are single-use
    let replay = engine.resume(&ensemble, &token, None).await;
    assert!(!replay.ok);
    assert_eq!(replay.error.unwrap().kind, "TokenExpired");
}

#[tokio::test]
async fn scenario_rejected_frame_blocks_resume() {
    let (registry, _) = base_registry();
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

    let ensemble = Ensemble::new("gated", vec![FlowElement::Step(Step::new("gate"))]);
    let engine = Engine::new(registry);
    let suspended = engine.run(&ensemble, json!({})).await;
    let RunStatus::Suspended { token, .. } = suspended.status else {
        panic!("expected suspension");
    };

    // Resume before any decision: not ready
    let premature = engine.resume(&ensemble, &token, None).await;
    assert_eq!(premature.error.unwrap().kind, "NotReady");

    engine
        .reject(&token, "bob", Some("not today".to_string()))
        .await
        .unwrap();
    let rejected = engine.resume(&ensemble, &token, None).await;
    assert_eq!(rejected.error.unwrap().kind, "Rejected");
}

#[tokio::test]
async fn scenario_cyclic_dag_rejected_before_any_step() {
    let (registry, invocations) = base_registry();

    let mut a = Step::new("upper").with_id("a");
    a.input = Some(json!({"text": "x"}));
    a.depends_on = vec!["b".to_string()];
    let mut b = Step::new("upper").with_id("b");
    b.input = Some(json!({"text": "y"}));
    b.depends_on = vec!["a".to_string()];

    let ensemble = Ensemble::new(
        "cyclic",
        vec![FlowElement::Step(a), FlowElement::Step(b)],
    );
    let engine = Engine::new(registry);
    let outcome = engine.run(&ensemble, json!({})).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.error.as_ref().unwrap().kind, "CyclicDependency");
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn boundary_foreach_over_empty_array() {
    let (registry, invocations) = base_registry();
    let ensemble = Ensemble::new(
        "empty-items",
        vec![FlowElement::Foreach {
            foreach: ForeachBlock {
                id: Some("fan".to_string()),
                items: json!("${input.items}"),
                step: Box::new(FlowElement::Step(
                    Step::new("upper").with_input(json!({"text": "${item}"})),
                )),
                max_concurrency: None,
                break_when: None,
            },
        }],
    )
    .with_output(json!("${fan.output}"));

    let engine = Engine::new(registry);
    let outcome = engine.run(&ensemble, json!({"items": []})).await;
    assert!(outcome.ok);
    assert_eq!(outcome.data, Some(json!([])));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn boundary_foreach_fans_out_with_bindings() {
    let (registry, _) = base_registry();
    let ensemble = Ensemble::new(
        "fanout",
        vec![FlowElement::Foreach {
            foreach: ForeachBlock {
                id: Some("fan".to_string()),
                items: json!(["a", "b", "c"]),
                step: Box::new(FlowElement::Step(
                    Step::new("upper").with_input(json!({"text": "${item}"})),
                )),
                max_concurrency: Some(2),
                break_when: None,
            },
        }],
    )
    .with_output(json!("${fan.output}"));

    let engine = Engine::new(registry);
    let outcome = engine.run(&ensemble, json!({})).await;
    assert!(outcome.ok);
    assert_eq!(outcome.data, Some(json!(["A", "B", "C"])));
}

#[tokio::test]
async fn boundary_while_iteration_limit() {
    let (registry, _) = base_registry();
    let ensemble = Ensemble::new(
        "spin",
        vec![FlowElement::While {
            r#while: WhileBlock {
                id: Some("spin".to_string()),
                condition: json!(true),
                steps: vec![FlowElement::Step(
                    Step::new("upper").with_input(json!({"text": "x"})),
                )],
                max_iterations: 5,
            },
        }],
    );

    let engine = Engine::new(registry);
    let outcome = engine.run(&ensemble, json!({})).await;
    assert!(!outcome.ok);
    assert_eq!(outcome.error.unwrap().kind, "IterationLimit");
}

#[tokio::test]
async fn graph_happens_before_via_depends_on() {
    let registry = MemberRegistry::new();
    registry
        .register(
            MemberMetadata::new("emit", MemberKind::Function, "1.0.0"),
            Arc::new(|_c, _e| {
                Ok(FnMember::new(|ctx: MemberContext| async move {
                    MemberResponse::success(ctx.input)
                }) as Arc<dyn Member>)
            }),
        )
        .unwrap();

    use conductor_core::{StateDecl, StateSchema, StateType};
    let mut writer = Step::new("emit").with_id("writer");
    writer.input = Some(json!({"token": "written-by-a"}));
    writer.state_set = vec!["token".to_string()];
    let mut reader = Step::new("emit").with_id("reader");
    reader.input = Some(json!({"seen": "${state.token}"}));
    reader.state_use = vec!["token".to_string()];
    reader.depends_on = vec!["writer".to_string()];

    let ensemble = Ensemble::new(
        "hb",
        vec![FlowElement::Step(writer), FlowElement::Step(reader)],
    )
    .with_state(StateDecl {
        schema: StateSchema::new().with_field("token", StateType::String),
        initial: serde_json::Map::new(),
    })
    .with_output(json!("${reader.output}"));

    let engine = Engine::new(Arc::new(registry));
    let outcome = engine.run(&ensemble, json!({})).await;
    assert!(outcome.ok, "{:?}", outcome.error);
    assert_eq!(outcome.data, Some(json!({"seen": "written-by-a"})));
}

#[tokio::test]
async fn resolution_leaves_unresolved_references_visible() {
    let (registry, _) = base_registry();
    let ensemble = Ensemble::new(
        "partial",
        vec![FlowElement::Step(
            Step::new("join").with_input(json!({"a": "x: ${missing.output}", "b": ""})),
        )],
    );

    let engine = Engine::new(registry);
    let outcome = engine.run(&ensemble, json!({})).await;
    assert!(outcome.ok);
    // The unresolved embedded reference stayed literal
    assert_eq!(outcome.data, Some(json!("x: ${missing.output}")));
}
