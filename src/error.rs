use thiserror::Error;

/// The terminal cause recorded when a context finishes.
///
/// A reason is not exceptional control flow: it is a state, surfaced through
/// [`Context::reason`](crate::Context::reason) to any number of readers
/// without panicking or returning `Err` from the read itself. Once a node
/// has recorded a reason it never changes, and the same reason is fanned
/// out verbatim to every registered descendant.
///
/// `CancelReason` implements [`std::error::Error`] so it slots into caller
/// error enums via `From`/`Into`:
///
/// ```rust
/// use tokio_context_tree::CancelReason;
///
/// #[derive(Debug)]
/// enum JobError {
///     Canceled,
///     TimedOut,
///     Io(String),
/// }
///
/// impl From<CancelReason> for JobError {
///     fn from(reason: CancelReason) -> Self {
///         match reason {
///             CancelReason::Canceled => JobError::Canceled,
///             CancelReason::DeadlineExceeded => JobError::TimedOut,
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    /// The context was canceled explicitly through its cancel function or
    /// by an ancestor's fan-out.
    #[error("context has been canceled")]
    Canceled,

    /// The context's deadline elapsed before it was canceled explicitly.
    #[error("context deadline has been exceeded")]
    DeadlineExceeded,
}
