//! # conductor-frame - Durable Suspend/Resume Frames
//!
//! Storage abstractions for Conductor's human-in-the-loop handoff: when an
//! ensemble execution suspends (approval gates, external work), the engine
//! captures a [`SuspendedFrame`] under a cryptographically random resumption
//! token and hands it to a [`FrameStore`]. An external actor later approves
//! or rejects the frame, and the engine resumes from the recorded frontier.
//!
//! This crate deliberately knows nothing about ensembles, members, or
//! scheduling - it owns:
//!
//! - **[`SuspendedFrame`]** - token, ensemble reference, opaque context
//!   snapshot, resume point, and the single-shot approval state machine
//! - **[`FrameStore`]** - `put`/`get`/`cas`/`delete` with TTL; any KV
//!   backend can implement it
//! - **[`InMemoryFrameStore`]** - reference backend for tests and
//!   single-process deployments
//! - **[`SerializerProtocol`]** / **[`JsonSerializer`]** - byte-level
//!   encoding at the storage boundary
//!
//! ## Example
//!
//! ```rust
//! use conductor_frame::{
//!     EnsembleRef, FrameStore, InMemoryFrameStore, ResumePoint, SuspendedFrame,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> conductor_frame::Result<()> {
//! let store = InMemoryFrameStore::new();
//!
//! let frame = SuspendedFrame::capture(
//!     EnsembleRef::new("expense-approval"),
//!     serde_json::json!({"state": {"amount": 1200}}),
//!     ResumePoint::Linear { index: 3 },
//!     "manager-gate",
//!     86_400,
//! );
//! let token = frame.token.clone();
//!
//! store.put(frame, Duration::from_secs(86_400)).await?;
//!
//! // Later, from the approval surface:
//! let pending = store.get(&token).await?.expect("frame still live");
//! assert!(pending.status.is_pending());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use error::{FrameError, Result};
pub use frame::{
    generate_token, EnsembleRef, FrameStatus, ResumePoint, SuspendedFrame, TOKEN_PREFIX,
};
pub use memory::InMemoryFrameStore;
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::FrameStore;
