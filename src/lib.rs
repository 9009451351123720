//! # Tokio Context Tree
//!
//! This crate provides Go-style context trees for Tokio: a lightweight,
//! immutable-once-built `Context` value that carries a cooperative
//! cancellation signal, an optional deadline, and request-scoped key/value
//! data through a tree of concurrent tasks.
//!
//! ## Problem
//!
//! When a request fans out into many concurrent operations, every one of
//! them needs to learn that the request was canceled or timed out, without
//! the request handler knowing about each descendant. Wiring that by hand
//! means threading a `CancellationToken` plus a deadline plus ad-hoc
//! parameters through every call, and carefully cancelling children when a
//! parent finishes:
//!
//! ```ignore
//! // Ad-hoc plumbing that grows with every new parameter
//! async fn handle(token: CancellationToken, deadline: Instant, ray_id: String) {
//!     let child_token = token.child_token();
//!     // ...remember to cancel child_token, remember to compare deadlines...
//! }
//! ```
//!
//! ## Solution
//!
//! Build contexts by composition. Each combinator returns a new node
//! wrapping its parent; cancellation flows strictly downward, exactly once:
//!
//! ```rust
//! use tokio_context_tree::{background, with_cancel, with_value, CancelReason};
//!
//! let root = background();                      // never cancels
//! let ctx = with_value(&root, "ray_id", "ray_abc123".to_string());
//! let (ctx, cancel) = with_cancel(&ctx);
//!
//! // Descendants observe the same request-scoped data...
//! let ray_id: String = ctx.value_as("ray_id").unwrap();
//! assert_eq!(ray_id, "ray_abc123");
//!
//! // ...and the same cancellation signal.
//! cancel.cancel();
//! assert_eq!(ctx.reason(), Some(CancelReason::Canceled));
//! ```
//!
//! Deadlines compose the same way and are clamped to the parent's:
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_context_tree::{background, with_timeout, CancelReason};
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let (ctx, _cancel) = with_timeout(&background(), Duration::from_millis(50));
//! let done = ctx.done().expect("timer contexts are cancelable");
//!
//! done.cancelled().await;
//! assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));
//! # }
//! ```
//!
//! ## Features
//!
//! - **Strictly downward propagation**: canceling a parent cancels every
//!   registered descendant with the same reason; canceling a child never
//!   touches the parent
//! - **First-cancel-wins**: explicit cancel, parent fan-out, and timer
//!   expiry race safely; only the first call records a reason
//! - **Bounded registries**: a child canceled directly detaches from its
//!   parent, so finished subtrees release their memory
//! - **Deadline clamping**: a requested deadline later than the parent's
//!   degrades to a plain cancelable node, no stray timers
//! - **Foreign contexts**: externally defined context types participate via
//!   an observation race on their done-signal
//! - **Zero boilerplate awaits**: [`ContextExt::with_context`] replaces the
//!   usual `tokio::select!` dance, and [`check_canceled`] covers
//!   synchronous polling loops
//!
//! ## Cancellation helpers
//!
//! ```rust
//! use tokio_context_tree::{background, with_cancel, CancelReason, ContextExt};
//!
//! #[derive(Debug)]
//! enum FetchError {
//!     Canceled,
//!     Network(String),
//! }
//!
//! impl From<CancelReason> for FetchError {
//!     fn from(_: CancelReason) -> Self {
//!         FetchError::Canceled
//!     }
//! }
//!
//! # async fn fetch_rows() -> Result<Vec<String>, FetchError> { Ok(vec![]) }
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FetchError> {
//! let (ctx, _cancel) = with_cancel(&background());
//!
//! let rows = fetch_rows()
//!     .with_context::<FetchError>(&ctx, "fetch_rows")
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod cancel;
mod context;
mod error;
mod ext;
mod propagate;
mod timer;
mod value;

pub use cancel::{with_cancel, CancelFunc};
pub use context::{background, todo, AnyContext, Context};
pub use error::CancelReason;
pub use ext::{check_canceled, ContextExt};
pub use timer::{with_deadline, with_timeout};
pub use value::{with_value, ContextValue};

// Re-export the done-signal primitive for convenience
pub use tokio_util::sync::CancellationToken;
