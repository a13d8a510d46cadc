//! The member contract - opaque callables invoked by steps
//!
//! Members are the engine's unit of reuse: LLM calls, HTTP fetchers, SQL
//! runners, renderers. The engine never knows what a member *does*; it
//! only relies on the contract:
//!
//! ```text
//! execute(ctx) -> MemberResponse
//!   ctx      = { input, env, cancellation, emit(event) }
//!   response = { outcome: success | failure | suspend, duration_ms, metadata }
//! ```
//!
//! A member must be pure with respect to its input and config: identical
//! values produce equivalent data (modulo member-declared nondeterminism).
//! That purity is what makes fingerprint caching sound. Members may block
//! on I/O but must honor `ctx.cancellation`.
//!
//! A member returning a failure is a *step failure*, handled by retry and
//! ensemble policy. A member that panics is caught at the invocation
//! boundary and wrapped into a failure with the `Unknown` kind.
//!
//! The `kind` on [`MemberMetadata`] (`Think`, `Function`, `Api`, ...) is
//! advisory metadata for tooling; the runtime treats every member
//! uniformly through this trait.

use crate::events::{EventEmitter, EventKind};
use crate::executor::scope::CancelScope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Advisory member categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Think,
    Function,
    Data,
    Api,
    Mcp,
    Scoring,
    Email,
    Sms,
    Form,
    Page,
    Html,
    Pdf,
}

/// Member-declared failure classification, used by `retryOn` filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberErrorKind {
    /// Worth retrying: timeouts, connection resets, 5xx
    Transient,
    /// Upstream throttling
    RateLimit,
    /// The member's own deadline elapsed
    Timeout,
    /// Not worth retrying: bad input, 4xx, validation
    Permanent,
    /// Anything unclassified, including wrapped panics
    Unknown,
}

impl MemberErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberErrorKind::Transient => "transient",
            MemberErrorKind::RateLimit => "rate_limit",
            MemberErrorKind::Timeout => "timeout",
            MemberErrorKind::Permanent => "permanent",
            MemberErrorKind::Unknown => "unknown",
        }
    }

    /// Default retry classification when a step declares no `retryOn`
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemberErrorKind::Transient | MemberErrorKind::RateLimit | MemberErrorKind::Timeout
        )
    }
}

/// A member failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberError {
    pub kind: MemberErrorKind,
    pub message: String,
}

impl MemberError {
    pub fn new(kind: MemberErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(MemberErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(MemberErrorKind::Permanent, message)
    }
}

/// A member's request to relinquish control to an external actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendSignal {
    /// Why control is being handed off (e.g. "human-approval")
    pub reason: String,

    /// Optional notification routing hint for the embedder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_channel: Option<String>,

    /// Data shown to the approving actor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_data: Option<Value>,
}

impl SuspendSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            notify_channel: None,
            approval_data: None,
        }
    }

    pub fn with_approval_data(mut self, data: Value) -> Self {
        self.approval_data = Some(data);
        self
    }
}

/// The three ways a member invocation ends
#[derive(Debug, Clone)]
pub enum MemberOutcome {
    Success(Value),
    Failure(MemberError),
    Suspend(SuspendSignal),
}

/// What a member returns to the engine
#[derive(Debug, Clone)]
pub struct MemberResponse {
    pub outcome: MemberOutcome,
    pub duration_ms: u64,
    pub metadata: Map<String, Value>,
}

impl MemberResponse {
    pub fn success(data: Value) -> Self {
        Self {
            outcome: MemberOutcome::Success(data),
            duration_ms: 0,
            metadata: Map::new(),
        }
    }

    pub fn failure(error: MemberError) -> Self {
        Self {
            outcome: MemberOutcome::Failure(error),
            duration_ms: 0,
            metadata: Map::new(),
        }
    }

    pub fn suspend(signal: SuspendSignal) -> Self {
        Self {
            outcome: MemberOutcome::Suspend(signal),
            duration_ms: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, MemberOutcome::Success(_))
    }
}

/// Per-invocation context handed to a member
#[derive(Clone)]
pub struct MemberContext {
    /// Resolved step input (frozen)
    pub input: Value,

    /// Deployment-time bindings (frozen)
    pub env: Value,

    /// Cooperative cancellation; members blocking on I/O must observe it
    pub cancellation: CancelScope,

    step_id: String,
    emitter: Option<EventEmitter>,
}

impl MemberContext {
    pub fn new(
        input: Value,
        env: Value,
        cancellation: CancelScope,
        step_id: impl Into<String>,
        emitter: Option<EventEmitter>,
    ) -> Self {
        Self {
            input,
            env,
            cancellation,
            step_id: step_id.into(),
            emitter,
        }
    }

    /// Bare context for unit-testing members.
    pub fn for_test(input: Value) -> Self {
        Self::new(input, Value::Null, CancelScope::new(), "test", None)
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The `emit` capability of the contract: publish a progress payload
    /// into the execution's event stream.
    pub fn emit(&self, payload: Value) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(EventKind::StepProgress, Some(&self.step_id), payload);
        }
    }
}

/// The capability every step invokes
#[async_trait]
pub trait Member: Send + Sync {
    async fn execute(&self, ctx: MemberContext) -> MemberResponse;
}

/// Descriptive metadata registered alongside a member factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MemberKind,
    /// Semver string (`1.2.0`)
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Member-specific configuration, part of the cache fingerprint
    #[serde(default)]
    pub config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl MemberMetadata {
    pub fn new(name: impl Into<String>, kind: MemberKind, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            version: version.into(),
            description: None,
            config: Value::Null,
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Convenience: build a member from an async closure. Used heavily in
/// tests and by embedders registering function members.
pub struct FnMember<F> {
    f: F,
}

impl<F, Fut> FnMember<F>
where
    F: Fn(MemberContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = MemberResponse> + Send,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> Member for FnMember<F>
where
    F: Fn(MemberContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = MemberResponse> + Send,
{
    async fn execute(&self, ctx: MemberContext) -> MemberResponse {
        (self.f)(ctx).await
    }
}
