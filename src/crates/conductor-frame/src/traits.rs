//! Extensible frame storage trait for custom backend implementations
//!
//! This module defines **[`FrameStore`]** - the abstraction behind durable
//! suspend/resume. The engine only ever talks to this trait; any KV with TTL
//! semantics (Redis, DynamoDB, SQL table with an expiry column, ...) can back
//! it. The in-memory implementation in [`crate::memory`] is the reference
//! used by tests and single-process deployments.
//!
//! # Contract
//!
//! - `put` stores a frame under its token with a time-to-live. Overwrites an
//!   existing frame under the same token.
//! - `get` returns `Ok(None)` for unknown tokens and MUST NOT return frames
//!   past their expiry.
//! - `cas` atomically replaces the stored status, failing with
//!   [`FrameError::CasConflict`] when the current status kind does not match
//!   the expected one. This is what makes the approval protocol single-shot
//!   under concurrent approvers.
//! - `delete` removes a frame; deleting an unknown token is not an error.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use conductor_frame::{FrameStore, SuspendedFrame, FrameStatus};
//! use async_trait::async_trait;
//!
//! struct RedisFrameStore { /* connection pool */ }
//!
//! #[async_trait]
//! impl FrameStore for RedisFrameStore {
//!     async fn put(&self, frame: SuspendedFrame, ttl: std::time::Duration)
//!         -> conductor_frame::Result<()>
//!     {
//!         // SET token payload EX ttl
//!         Ok(())
//!     }
//!     // ... get / cas / delete ...
//! }
//! ```
//!
//! [`FrameError::CasConflict`]: crate::error::FrameError::CasConflict

use crate::error::Result;
use crate::frame::{FrameStatus, SuspendedFrame};
use async_trait::async_trait;
use std::time::Duration;

/// Storage abstraction for suspended frames.
///
/// Implementations must be `Send + Sync`; multiple executions suspend and
/// resume concurrently against one store.
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Store a frame under its token with the given TTL.
    async fn put(&self, frame: SuspendedFrame, ttl: Duration) -> Result<()>;

    /// Fetch a frame. Expired frames are treated as absent.
    async fn get(&self, token: &str) -> Result<Option<SuspendedFrame>>;

    /// Atomically replace the frame's status.
    ///
    /// Fails with `CasConflict` if the stored status kind is not
    /// `expected_kind` at the moment of the swap, and with `TokenExpired`
    /// if the frame is absent or expired. Returns the updated frame.
    async fn cas(
        &self,
        token: &str,
        expected_kind: &str,
        next: FrameStatus,
    ) -> Result<SuspendedFrame>;

    /// Remove a frame. Returns `true` if a live frame was removed.
    async fn delete(&self, token: &str) -> Result<bool>;
}
