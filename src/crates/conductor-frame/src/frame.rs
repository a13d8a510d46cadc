//! Suspended execution frames and the approval state machine
//!
//! A [`SuspendedFrame`] is the durable snapshot an execution leaves behind
//! when a member relinquishes control (human approval gates, long-running
//! external work). The frame is addressed by a cryptographically random
//! resumption token and carries everything the engine needs to continue
//! from the exact step where execution stopped:
//!
//! - the serialized execution context (input, state, outputs, scoring,
//!   metrics) as an opaque JSON snapshot owned by the engine,
//! - a [`ResumePoint`] identifying the frontier (linear index or the set of
//!   completed graph nodes),
//! - the single-shot approval status ([`FrameStatus`]).
//!
//! # Token format
//!
//! Tokens are `resume_` followed by 26 lowercase base32 characters encoding
//! 128 bits from the OS RNG — URL-safe and comfortably above the 122-bit
//! entropy floor required for unguessable handoff URLs.
//!
//! # Approval protocol
//!
//! ```text
//!             approve(actor, data)
//!   Pending ───────────────────────→ Approved ──→ resume() proceeds
//!      │
//!      │      reject(actor, reason)
//!      └────────────────────────────→ Rejected ──→ resume() fails
//! ```
//!
//! Transitions are single-shot: any transition attempted on a non-`Pending`
//! frame fails with [`FrameError::InvalidStateTransition`].
//!
//! [`FrameError::InvalidStateTransition`]: crate::error::FrameError::InvalidStateTransition

use crate::error::{FrameError, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix carried by every resumption token
pub const TOKEN_PREFIX: &str = "resume_";

/// RFC 4648 base32 alphabet, lowercased (URL-safe, no padding)
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Generate a fresh resumption token: `resume_` + base32(128 random bits)
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);

    // 16 bytes -> 26 base32 chars (130 bits of alphabet space, 128 used)
    let mut out = String::with_capacity(TOKEN_PREFIX.len() + 26);
    out.push_str(TOKEN_PREFIX);
    let mut buffer: u32 = 0;
    let mut bits = 0u8;
    for byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Reference to the ensemble a frame belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleRef {
    /// Ensemble name, unique within a project
    pub name: String,

    /// Ensemble version at suspension time, if versioned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl EnsembleRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Where execution continues after resumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResumePoint {
    /// Linear flow: continue at this step index
    Linear { index: usize },

    /// Graph flow: these node ids are already committed; scheduling resumes
    /// from the frontier they induce.
    Graph { completed: Vec<String> },
}

/// Single-shot approval status of a suspended frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    /// Waiting for an external actor
    Pending,

    /// Approved; resumption may proceed
    Approved {
        /// Who approved
        actor: String,
        /// Optional payload handed to the resumed execution
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// When the approval happened
        at: DateTime<Utc>,
    },

    /// Rejected; resumption fails with the recorded reason
    Rejected {
        /// Who rejected
        actor: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl FrameStatus {
    /// Short status name used in errors and CAS comparisons
    pub fn kind(&self) -> &'static str {
        match self {
            FrameStatus::Pending => "pending",
            FrameStatus::Approved { .. } => "approved",
            FrameStatus::Rejected { .. } => "rejected",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, FrameStatus::Pending)
    }
}

/// A captured execution frame bound to a resumption token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedFrame {
    /// Resumption token (`resume_...`)
    pub token: String,

    /// Which ensemble this frame belongs to
    pub ensemble: EnsembleRef,

    /// Engine-owned context snapshot (input, state, outputs, scoring,
    /// metrics). Opaque to the storage layer.
    pub snapshot: Value,

    /// Where to continue
    pub resume_at: ResumePoint,

    /// Step id that produced the suspend signal
    pub suspended_by: String,

    /// Member-supplied reason (e.g. "human-approval")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Member-supplied data shown to approvers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_data: Option<Value>,

    /// Approval state machine
    pub status: FrameStatus,

    /// When the frame was captured
    pub created_at: DateTime<Utc>,

    /// Hard expiry; stores must not return the frame past this instant
    pub expires_at: DateTime<Utc>,
}

impl SuspendedFrame {
    /// Capture a new pending frame with a fresh token.
    pub fn capture(
        ensemble: EnsembleRef,
        snapshot: Value,
        resume_at: ResumePoint,
        suspended_by: impl Into<String>,
        ttl_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            token: generate_token(),
            ensemble,
            snapshot,
            resume_at,
            suspended_by: suspended_by.into(),
            reason: None,
            approval_data: None,
            status: FrameStatus::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_approval_data(mut self, data: Value) -> Self {
        self.approval_data = Some(data);
        self
    }

    /// Whether the frame has passed its expiry instant
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Transition `Pending -> Approved`. Single-shot.
    pub fn approve(&mut self, actor: impl Into<String>, data: Option<Value>) -> Result<()> {
        if !self.status.is_pending() {
            return Err(FrameError::InvalidStateTransition {
                from: self.status.kind().to_string(),
                attempted: "approve".to_string(),
            });
        }
        self.status = FrameStatus::Approved {
            actor: actor.into(),
            data,
            at: Utc::now(),
        };
        Ok(())
    }

    /// Transition `Pending -> Rejected`. Single-shot.
    pub fn reject(&mut self, actor: impl Into<String>, reason: Option<String>) -> Result<()> {
        if !self.status.is_pending() {
            return Err(FrameError::InvalidStateTransition {
                from: self.status.kind().to_string(),
                attempted: "reject".to_string(),
            });
        }
        self.status = FrameStatus::Rejected {
            actor: actor.into(),
            reason,
            at: Utc::now(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_frame() -> SuspendedFrame {
        SuspendedFrame::capture(
            EnsembleRef::new("review-pipeline"),
            json!({"state": {}}),
            ResumePoint::Linear { index: 2 },
            "gate",
            3600,
        )
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert!(token.starts_with(TOKEN_PREFIX));
        let body = &token[TOKEN_PREFIX.len()..];
        assert_eq!(body.len(), 26);
        assert!(body.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_approve_is_single_shot() {
        let mut frame = pending_frame();
        frame.approve("alice", Some(json!({"notes": "ok"}))).unwrap();
        assert_eq!(frame.status.kind(), "approved");

        let err = frame.approve("bob", None).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidStateTransition { ref from, .. } if from == "approved"
        ));
    }

    #[test]
    fn test_reject_after_approve_fails() {
        let mut frame = pending_frame();
        frame.approve("alice", None).unwrap();
        assert!(frame.reject("mallory", None).is_err());
    }

    #[test]
    fn test_frame_round_trips_through_json() {
        let frame = pending_frame().with_reason("human-approval");
        let bytes = serde_json::to_vec(&frame).unwrap();
        let restored: SuspendedFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.token, frame.token);
        assert_eq!(restored.resume_at, ResumePoint::Linear { index: 2 });
        assert_eq!(restored.reason.as_deref(), Some("human-approval"));
    }

    #[test]
    fn test_expiry() {
        let mut frame = pending_frame();
        assert!(!frame.is_expired());
        frame.expires_at = Utc::now() - Duration::seconds(1);
        assert!(frame.is_expired());
    }
}
