//! In-memory frame storage for development and testing
//!
//! **[`InMemoryFrameStore`]** is the reference implementation of
//! [`FrameStore`]: a thread-safe map guarded by `Arc<RwLock<...>>` with TTL
//! enforcement on read. Frames do not survive a process restart, which makes
//! this backend suitable for tests, demos, and single-process deployments
//! where suspended executions are short-lived.
//!
//! Expired frames are dropped lazily: `get`/`cas` treat them as absent and
//! remove them in passing, so the map does not need a background sweeper.

use crate::error::{FrameError, Result};
use crate::frame::{FrameStatus, SuspendedFrame};
use crate::traits::FrameStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Thread-safe in-memory [`FrameStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryFrameStore {
    frames: Arc<RwLock<HashMap<String, SuspendedFrame>>>,
}

impl InMemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) frames
    pub async fn len(&self) -> usize {
        let frames = self.frames.read().await;
        frames.values().filter(|f| !f.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove everything; test isolation helper
    pub async fn clear(&self) {
        self.frames.write().await.clear();
    }
}

#[async_trait]
impl FrameStore for InMemoryFrameStore {
    async fn put(&self, mut frame: SuspendedFrame, ttl: Duration) -> Result<()> {
        frame.expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| FrameError::Storage(format!("ttl out of range: {e}")))?;
        let mut frames = self.frames.write().await;
        frames.insert(frame.token.clone(), frame);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<SuspendedFrame>> {
        let frames = self.frames.read().await;
        match frames.get(token) {
            Some(frame) if frame.is_expired() => {
                drop(frames);
                self.frames.write().await.remove(token);
                Ok(None)
            }
            Some(frame) => Ok(Some(frame.clone())),
            None => Ok(None),
        }
    }

    async fn cas(
        &self,
        token: &str,
        expected_kind: &str,
        next: FrameStatus,
    ) -> Result<SuspendedFrame> {
        let mut frames = self.frames.write().await;
        let frame = match frames.get_mut(token) {
            Some(frame) if !frame.is_expired() => frame,
            Some(_) => {
                frames.remove(token);
                return Err(FrameError::TokenExpired(token.to_string()));
            }
            None => return Err(FrameError::TokenExpired(token.to_string())),
        };

        if frame.status.kind() != expected_kind {
            return Err(FrameError::CasConflict(token.to_string()));
        }
        frame.status = next;
        Ok(frame.clone())
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        let mut frames = self.frames.write().await;
        match frames.remove(token) {
            Some(frame) => Ok(!frame.is_expired()),
            None => Ok(false),
        }
    }
}
