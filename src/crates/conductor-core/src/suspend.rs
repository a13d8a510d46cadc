//! Suspend/resume manager - durable handoff to external actors
//!
//! When a member raises a suspend signal, the executor stops dispatching,
//! the context is snapshotted, and this manager captures a
//! [`SuspendedFrame`] under a fresh resumption token in the configured
//! [`FrameStore`]. The token travels to an external actor (approval UI,
//! email link, webhook); the approval protocol then drives the frame's
//! single-shot state machine:
//!
//! - [`SuspendManager::approve`] - `pending -> approved`, optionally
//!   attaching data for the resumed execution
//! - [`SuspendManager::reject`] - `pending -> rejected`
//! - [`SuspendManager::cancel`] - deletes the frame outright
//!
//! Resumption loads the frame, admits only `approved` ones (`pending`
//! maps to `NotReady`, `rejected` to `Rejected`, absent or expired to
//! `TokenExpired`), and consumes the token so a frame resumes at most
//! once.

use crate::error::{EngineError, Result};
use crate::executor::ContextSnapshot;
use crate::member::SuspendSignal;
use chrono::{DateTime, Utc};
use conductor_frame::{EnsembleRef, FrameStatus, FrameStore, ResumePoint, SuspendedFrame};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default frame lifetime: 24 hours
pub const DEFAULT_FRAME_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Captures, transitions, and loads suspended frames
#[derive(Clone)]
pub struct SuspendManager {
    store: Arc<dyn FrameStore>,
    ttl: Duration,
}

impl SuspendManager {
    pub fn new(store: Arc<dyn FrameStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_FRAME_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Capture a frame for a suspended execution and persist it under a
    /// fresh token. Returns the stored frame (token, expiry).
    pub async fn capture(
        &self,
        ensemble_name: &str,
        ensemble_version: Option<&str>,
        snapshot: ContextSnapshot,
        resume_at: ResumePoint,
        step_id: &str,
        signal: &SuspendSignal,
    ) -> Result<SuspendedFrame> {
        let mut ensemble_ref = EnsembleRef::new(ensemble_name);
        if let Some(version) = ensemble_version {
            ensemble_ref = ensemble_ref.with_version(version);
        }

        let mut frame = SuspendedFrame::capture(
            ensemble_ref,
            serde_json::to_value(&snapshot)?,
            resume_at,
            step_id,
            self.ttl.as_secs() as i64,
        )
        .with_reason(&signal.reason);
        if let Some(data) = &signal.approval_data {
            frame = frame.with_approval_data(data.clone());
        }

        tracing::info!(
            token = %frame.token,
            step = %step_id,
            reason = %signal.reason,
            "captured suspended frame"
        );
        self.store.put(frame.clone(), self.ttl).await?;
        Ok(frame)
    }

    /// `pending -> approved`. Single-shot.
    pub async fn approve(
        &self,
        token: &str,
        actor: &str,
        data: Option<Value>,
    ) -> Result<SuspendedFrame> {
        let next = FrameStatus::Approved {
            actor: actor.to_string(),
            data,
            at: Utc::now(),
        };
        Ok(self.store.cas(token, "pending", next).await?)
    }

    /// `pending -> rejected`. Single-shot.
    pub async fn reject(
        &self,
        token: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<SuspendedFrame> {
        let next = FrameStatus::Rejected {
            actor: actor.to_string(),
            reason,
            at: Utc::now(),
        };
        Ok(self.store.cas(token, "pending", next).await?)
    }

    /// Delete the frame regardless of status.
    pub async fn cancel(&self, token: &str) -> Result<bool> {
        Ok(self.store.delete(token).await?)
    }

    /// Peek at a frame without consuming it (approval UIs).
    pub async fn inspect(&self, token: &str) -> Result<Option<SuspendedFrame>> {
        Ok(self.store.get(token).await?)
    }

    /// Load a frame for resumption and consume its token. Only approved
    /// frames pass.
    pub async fn take_approved(&self, token: &str) -> Result<(SuspendedFrame, Option<Value>)> {
        let frame = self
            .store
            .get(token)
            .await?
            .ok_or_else(|| EngineError::TokenExpired(token.to_string()))?;

        match &frame.status {
            FrameStatus::Pending => Err(EngineError::NotReady(token.to_string())),
            FrameStatus::Rejected { reason, .. } => Err(EngineError::Rejected {
                token: token.to_string(),
                reason: reason.clone(),
            }),
            FrameStatus::Approved { data, .. } => {
                let approved_data = data.clone();
                // Tokens are single-use: consume before the execution
                // continues so a replay cannot resume twice.
                self.store.delete(token).await?;
                Ok((frame, approved_data))
            }
        }
    }

    /// Deserialize the context snapshot out of a frame.
    pub fn snapshot_of(frame: &SuspendedFrame) -> Result<ContextSnapshot> {
        Ok(serde_json::from_value(frame.snapshot.clone())?)
    }

    /// Expiry instant for a frame captured now.
    pub fn expires_at_from_now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RunMetrics, ScoringRecord};
    use conductor_frame::InMemoryFrameStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            input: json!({"name": "ada"}),
            state: serde_json::Map::new(),
            outputs: HashMap::from([("draft".to_string(), json!("text"))]),
            scoring: ScoringRecord::default(),
            metrics: RunMetrics::default(),
        }
    }

    fn manager() -> SuspendManager {
        SuspendManager::new(Arc::new(InMemoryFrameStore::new()))
    }

    async fn captured(manager: &SuspendManager) -> SuspendedFrame {
        manager
            .capture(
                "review",
                Some("1.0.0"),
                snapshot(),
                ResumePoint::Linear { index: 2 },
                "gate",
                &SuspendSignal::new("human-approval").with_approval_data(json!({"doc": 7})),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_capture_persists_pending_frame() {
        let manager = manager();
        let frame = captured(&manager).await;
        assert!(frame.token.starts_with("resume_"));

        let loaded = manager.inspect(&frame.token).await.unwrap().unwrap();
        assert!(loaded.status.is_pending());
        assert_eq!(loaded.suspended_by, "gate");
        assert_eq!(loaded.approval_data, Some(json!({"doc": 7})));
    }

    #[tokio::test]
    async fn test_approve_then_take() {
        let manager = manager();
        let frame = captured(&manager).await;

        manager
            .approve(&frame.token, "alice", Some(json!({"approved": true})))
            .await
            .unwrap();

        let (loaded, data) = manager.take_approved(&frame.token).await.unwrap();
        assert_eq!(loaded.resume_at, ResumePoint::Linear { index: 2 });
        assert_eq!(data, Some(json!({"approved": true})));

        // Token consumed
        assert!(matches!(
            manager.take_approved(&frame.token).await,
            Err(EngineError::TokenExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_frame_is_not_ready() {
        let manager = manager();
        let frame = captured(&manager).await;
        assert!(matches!(
            manager.take_approved(&frame.token).await,
            Err(EngineError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_frame_reports_reason() {
        let manager = manager();
        let frame = captured(&manager).await;
        manager
            .reject(&frame.token, "bob", Some("over budget".to_string()))
            .await
            .unwrap();

        match manager.take_approved(&frame.token).await {
            Err(EngineError::Rejected { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some("over budget"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_double_approval_is_invalid_transition() {
        let manager = manager();
        let frame = captured(&manager).await;
        manager.approve(&frame.token, "alice", None).await.unwrap();
        assert!(matches!(
            manager.approve(&frame.token, "bob", None).await,
            Err(EngineError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_deletes_frame() {
        let manager = manager();
        let frame = captured(&manager).await;
        assert!(manager.cancel(&frame.token).await.unwrap());
        assert!(matches!(
            manager.take_approved(&frame.token).await,
            Err(EngineError::TokenExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let manager = manager();
        let frame = captured(&manager).await;
        let restored = SuspendManager::snapshot_of(&frame).unwrap();
        assert_eq!(restored.input, json!({"name": "ada"}));
        assert_eq!(restored.outputs.get("draft"), Some(&json!("text")));
    }
}
