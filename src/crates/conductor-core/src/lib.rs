//! # conductor-core - Ensemble Orchestration Engine
//!
//! A workflow orchestration engine that executes declarative, YAML-defined
//! pipelines ("ensembles") composed of reusable steps ("members"):
//!
//! - **Interpolation** - `${path}` references resolved against a layered
//!   context (input, state, prior outputs, env, block-local bindings)
//! - **Caching** - content-addressed step memoization with stable
//!   fingerprints, TTL, tags, and single-flight per fingerprint
//! - **Permissioned state** - a typed shared bag where every step
//!   declares exactly what it reads and writes, with atomic commits
//! - **Scoring gates** - quality thresholds with retry-until-threshold,
//!   backoff, and improvement enforcement
//! - **Linear and graph execution** - sequential flows, or DAGs with
//!   `parallel`, `branch`, `foreach`, `while`, `try`, `switch`, and
//!   `map-reduce` blocks under bounded concurrency and cooperative
//!   cancellation
//! - **Suspend/resume** - human-in-the-loop gates captured as durable
//!   frames (see [`conductor_frame`]) under cryptographically random
//!   tokens, with a single-shot approval protocol
//! - **Events** - a structured, replayable per-execution trace with
//!   pluggable sinks
//! - **Scheduling and webhooks** - cron-triggered dispatch and inbound
//!   request mapping, with the engine kept transport-agnostic
//!
//! ## Quick Start
//!
//! ```rust
//! use conductor_core::{
//!     Engine, Ensemble, FlowElement, FnMember, Member, MemberContext, MemberKind,
//!     MemberMetadata, MemberRegistry, MemberResponse, Step,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = MemberRegistry::new();
//! registry
//!     .register(
//!         MemberMetadata::new("shout", MemberKind::Function, "1.0.0"),
//!         Arc::new(|_config, _env| {
//!             Ok(FnMember::new(|ctx: MemberContext| async move {
//!                 let text = ctx.input["text"].as_str().unwrap_or_default();
//!                 MemberResponse::success(json!(text.to_uppercase()))
//!             }) as Arc<dyn Member>)
//!         }),
//!     )
//!     .unwrap();
//!
//! let ensemble = Ensemble::new(
//!     "hello",
//!     vec![FlowElement::Step(
//!         Step::new("shout").with_input(json!({"text": "${input.greeting}"})),
//!     )],
//! )
//! .with_output(json!({"msg": "${shout.output}"}));
//!
//! let engine = Engine::new(Arc::new(registry));
//! let outcome = engine.run(&ensemble, json!({"greeting": "hi"})).await;
//! assert_eq!(outcome.data, Some(json!({"msg": "HI"})));
//! # }
//! ```

pub mod cache;
pub mod canonical;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod flow;
pub mod member;
pub mod registry;
pub mod schedule;
pub mod scoring;
pub mod state;
pub mod suspend;
pub mod template;
pub mod webhook;
pub mod yaml;

pub use cache::{CacheConfig, CacheMetrics, CacheOutcome, EvictionPolicy, PutOptions, StepCache};
pub use canonical::{canonical_string, canonicalize, fingerprint};
pub use driver::{Engine, ErrorInfo, RunOutcome, RunStatus};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventEmitter, EventKind, EventSink, History, TracingSink};
pub use executor::graph::{GraphOutcome, GraphScheduler};
pub use executor::linear::{LinearExecutor, WalkOutcome};
pub use executor::retry::{RetryBackoff, StepRetryPolicy};
pub use executor::scope::CancelScope;
pub use executor::{ContextSnapshot, ExecutionContext, RunMetrics, ScoringSupport, StepOutcome};
pub use flow::{
    BranchBlock, CacheSpec, Ensemble, FlowElement, ForeachBlock, MapReduceBlock, ParallelBlock,
    ScheduleDef, StateDecl, Step, SwitchBlock, TryBlock, WaitFor, WebhookAuth, WebhookBinding,
    WebhookMethod, WebhookMode, WhileBlock,
};
pub use member::{
    FnMember, Member, MemberContext, MemberError, MemberErrorKind, MemberKind, MemberMetadata,
    MemberOutcome, MemberResponse, SuspendSignal,
};
pub use registry::{MemberFactory, MemberRef, MemberRegistry, VersionSpec};
pub use schedule::{Dispatcher, ScheduleEntry, Scheduler, SCHEDULE_METADATA_KEY};
pub use scoring::{
    Aggregation, Criterion, Embedder, Evaluator, EvaluatorKind, OnFailure, ScoreBackoff,
    ScoreReport, ScoringController, ScoringPolicy, Thresholds,
};
pub use state::{StateHandle, StateSchema, StateStore, StateType};
pub use suspend::{SuspendManager, DEFAULT_FRAME_TTL};
pub use template::{Interpolator, RefPath, Scope, TemplatePart, TemplateString, ValueResolver};
pub use webhook::{WebhookAction, WebhookDispatcher, WebhookRequest};

// Re-export the frame crate so embedders get the storage types from one
// place.
pub use conductor_frame;
