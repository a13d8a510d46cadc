//! Error types and error handling for ensemble execution
//!
//! This module defines all errors the engine can produce, from pre-execution
//! validation through planning, step execution, scoring, and suspension.
//! All errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError
//! ├── Validation          - malformed ensemble/member definitions (pre-execution)
//! ├── InvalidTemplate     - bad ${...} reference syntax at resolution time
//! ├── PermissionDenied    - state access outside declared use/set keys
//! ├── StateType           - state write violates the declared schema
//! ├── MemberNotFound      - member reference cannot be resolved
//! ├── MemberFailure       - member returned ok: false
//! ├── Timeout             - step exceeded its deadline
//! ├── ScoringFailure      - scoring retries exhausted under abort policy
//! ├── IterationLimit      - while-loop safety cap exceeded
//! ├── CyclicDependency    - planning-time cycle in the flow DAG
//! ├── ConflictingWrites   - overlapping stateSet on concurrent siblings
//! ├── TokenExpired        - resume against an absent or expired frame
//! ├── InvalidStateTransition - approval protocol misuse
//! ├── NotReady            - resume against a still-pending frame
//! ├── Rejected            - resume against a rejected frame
//! ├── Cancelled           - scope terminated externally
//! ├── Serialization / Yaml / Io - wrapped library errors
//! └── Internal            - invariant violations (engine bugs)
//! ```
//!
//! # Propagation policy
//!
//! `Validation` errors surface before any step runs. Member failures are
//! retried per policy and, after exhaustion, surface as the ensemble result
//! unless caught by an enclosing `try` block. Planning errors
//! (`CyclicDependency`, `ConflictingWrites`) are always terminal. `finally`
//! blocks run even under `Cancelled`.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors produced by the ensemble engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed ensemble or member definition, detected before any step
    /// runs (unknown member references, duplicate step ids, bad thresholds).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A `${...}` reference with invalid syntax (empty path, unbalanced
    /// braces inside a path segment).
    #[error("Invalid template reference: {0}")]
    InvalidTemplate(String),

    /// A step read or wrote a state key outside its declared permissions.
    #[error("Step '{step}' denied {action} access to state key '{key}'")]
    PermissionDenied {
        /// Step that attempted the access
        step: String,
        /// "read" or "write"
        action: &'static str,
        /// The state key involved
        key: String,
    },

    /// A state write violated the declared schema type for its key.
    #[error("State key '{key}' expects {expected}, got {actual}")]
    StateType {
        key: String,
        expected: String,
        actual: String,
    },

    /// A member reference could not be resolved in the registry.
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    /// A member returned `ok: false`. Carries the member-declared error
    /// kind (or `Unknown` for wrapped panics).
    #[error("Member '{member}' failed in step '{step}': {message}")]
    MemberFailure {
        step: String,
        member: String,
        message: String,
    },

    /// Step exceeded its deadline.
    #[error("Step '{step}' timed out after {duration_ms}ms")]
    Timeout { step: String, duration_ms: u64 },

    /// Scoring retries exhausted under `onFailure: abort`.
    #[error("Step '{step}' failed scoring gate: score {score:.3} < minimum {minimum:.3} after {attempts} attempts")]
    ScoringFailure {
        step: String,
        score: f64,
        minimum: f64,
        attempts: usize,
    },

    /// A `while` block exceeded its mandatory `maxIterations` cap.
    #[error("While block '{block}' exceeded {max_iterations} iterations")]
    IterationLimit {
        block: String,
        max_iterations: usize,
    },

    /// The flow DAG contains a dependency cycle. Planning-time, terminal.
    #[error("Cyclic dependency in flow: {0}")]
    CyclicDependency(String),

    /// Concurrent siblings declare overlapping `stateSet` keys.
    /// Planning-time, terminal.
    #[error("Conflicting writes to state key '{key}' between concurrent steps '{first}' and '{second}'")]
    ConflictingWrites {
        key: String,
        first: String,
        second: String,
    },

    /// Resume was attempted with an absent or expired token.
    #[error("Resumption token expired or unknown: {0}")]
    TokenExpired(String),

    /// The approval protocol was used out of order (approve/reject on a
    /// non-pending frame).
    #[error("Invalid frame transition: {0}")]
    InvalidStateTransition(String),

    /// Resume was attempted on a frame still awaiting approval.
    #[error("Frame for token {0} is still pending approval")]
    NotReady(String),

    /// Resume was attempted on a rejected frame.
    #[error("Frame for token {token} was rejected{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Rejected {
        token: String,
        reason: Option<String>,
    },

    /// The enclosing cancellation scope was terminated.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Control-flow marker: a member raised a suspend signal. The executor
    /// converts this into a suspended frame; it never surfaces to callers.
    #[error("Step '{step}' suspended: {}", signal.reason)]
    Suspended {
        step: String,
        signal: crate::member::SuspendSignal,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-store failure surfaced from the persistence layer.
    #[error("Frame store error: {0}")]
    FrameStore(String),

    /// A failure propagated to a waiter that shared an in-flight
    /// computation of the same fingerprint. Failures are never cached, but
    /// concurrent waiters observe the leader's outcome.
    #[error("{0}")]
    SharedFlight(std::sync::Arc<EngineError>),

    /// Invariant violation inside the engine. Always a bug.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable kind name, used in result payloads and the
    /// event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::InvalidTemplate(_) => "InvalidTemplate",
            EngineError::PermissionDenied { .. } => "PermissionDenied",
            EngineError::StateType { .. } => "TypeError",
            EngineError::MemberNotFound(_) => "MemberNotFound",
            EngineError::MemberFailure { .. } => "MemberFailure",
            EngineError::Timeout { .. } => "Timeout",
            EngineError::ScoringFailure { .. } => "ScoringFailure",
            EngineError::IterationLimit { .. } => "IterationLimit",
            EngineError::CyclicDependency(_) => "CyclicDependency",
            EngineError::ConflictingWrites { .. } => "ConflictingWrites",
            EngineError::TokenExpired(_) => "TokenExpired",
            EngineError::InvalidStateTransition(_) => "InvalidStateTransition",
            EngineError::NotReady(_) => "NotReady",
            EngineError::Rejected { .. } => "Rejected",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Suspended { .. } => "Suspended",
            EngineError::Serialization(_) => "Serialization",
            EngineError::Yaml(_) => "Yaml",
            EngineError::Io(_) => "Io",
            EngineError::FrameStore(_) => "FrameStore",
            EngineError::SharedFlight(inner) => inner.kind(),
            EngineError::Internal(_) => "Internal",
        }
    }

    /// The step id the error is attributed to, when there is one.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::PermissionDenied { step, .. }
            | EngineError::MemberFailure { step, .. }
            | EngineError::Timeout { step, .. }
            | EngineError::ScoringFailure { step, .. } => Some(step),
            EngineError::SharedFlight(inner) => inner.step(),
            _ => None,
        }
    }

    /// Helper constructor for member failures.
    pub fn member_failure(
        step: impl Into<String>,
        member: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::MemberFailure {
            step: step.into(),
            member: member.into(),
            message: message.into(),
        }
    }

    /// Whether this error is terminal for the whole ensemble regardless of
    /// retry policy (planning and protocol errors are; step failures are
    /// decided by policy).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::CyclicDependency(_)
                | EngineError::ConflictingWrites { .. }
                | EngineError::IterationLimit { .. }
                | EngineError::Internal(_)
        )
    }
}

impl From<conductor_frame::FrameError> for EngineError {
    fn from(err: conductor_frame::FrameError) -> Self {
        use conductor_frame::FrameError;
        match err {
            FrameError::TokenExpired(token) => EngineError::TokenExpired(token),
            FrameError::InvalidStateTransition { from, attempted } => {
                EngineError::InvalidStateTransition(format!("{attempted} on {from} frame"))
            }
            FrameError::CasConflict(token) => {
                EngineError::InvalidStateTransition(format!("concurrent transition on {token}"))
            }
            FrameError::Serialization(e) => EngineError::Serialization(e),
            FrameError::Storage(msg) | FrameError::Custom(msg) => EngineError::FrameStore(msg),
        }
    }
}
