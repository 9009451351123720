//! Extension helpers for running work under a context without repetitive
//! `tokio::select!` boilerplate.

use std::future::Future;

use tracing::debug;

use crate::context::Context;
use crate::error::CancelReason;

/// Extension trait for adding context cancellation to any `Result` future.
///
/// Implemented for every future returning `Result<T, E0>` where both `E0`
/// and [`CancelReason`] convert into the target error type, so a canceled
/// or timed-out context surfaces through the caller's own error enum.
///
/// ```rust
/// use std::time::Duration;
/// use tokio_context_tree::{background, with_timeout, CancelReason, ContextExt};
///
/// #[derive(Debug, PartialEq)]
/// enum QueryError {
///     TimedOut,
///     Canceled,
/// }
///
/// impl From<CancelReason> for QueryError {
///     fn from(reason: CancelReason) -> Self {
///         match reason {
///             CancelReason::DeadlineExceeded => QueryError::TimedOut,
///             CancelReason::Canceled => QueryError::Canceled,
///         }
///     }
/// }
///
/// # async fn run_query() -> Result<u64, QueryError> {
/// #     tokio::time::sleep(Duration::from_secs(60)).await;
/// #     Ok(42)
/// # }
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let (ctx, _cancel) = with_timeout(&background(), Duration::from_millis(50));
///
/// let result: Result<u64, QueryError> = run_query()
///     .with_context(&ctx, "run_query")
///     .await;
/// assert_eq!(result, Err(QueryError::TimedOut));
/// # }
/// ```
pub trait ContextExt<T> {
    /// The error type of the wrapped future.
    type OriginalError;

    /// Runs the future until it completes or `ctx` finishes, whichever
    /// happens first.
    ///
    /// When the context finishes first, its reason is converted into the
    /// target error type. A context that can never be canceled adds no
    /// overhead: the future runs directly. `operation` labels the wrapped
    /// work in log output when cancellation wins.
    fn with_context<'a, E>(
        self,
        ctx: &'a Context,
        operation: &'a str,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        CancelReason: Into<E>,
        Self::OriginalError: Into<E>,
        Self: 'a;
}

#[allow(clippy::manual_async_fn)] // Complex lifetime bounds make async fn impractical here
impl<F, T, OriginalError> ContextExt<T> for F
where
    F: Future<Output = Result<T, OriginalError>> + Send,
{
    type OriginalError = OriginalError;

    fn with_context<'a, E>(
        self,
        ctx: &'a Context,
        operation: &'a str,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        CancelReason: Into<E>,
        OriginalError: Into<E>,
        F: 'a,
    {
        async move {
            let Some(done) = ctx.done() else {
                return self.await.map_err(Into::into);
            };
            tokio::select! {
                () = done.cancelled() => {
                    let reason = ctx.reason().unwrap_or(CancelReason::Canceled);
                    debug!(%reason, "{operation}: context finished");
                    Err(reason.into())
                }
                result = self => result.map_err(Into::into),
            }
        }
    }
}

/// Checks whether `ctx` has finished and returns its reason as an error if
/// so.
///
/// This is the helper for synchronous code that needs to notice
/// cancellation at specific points, such as the top of a loop iteration:
///
/// ```rust
/// use tokio_context_tree::{check_canceled, CancelReason, Context};
///
/// fn process_items(ctx: &Context, items: &[i32]) -> Result<Vec<i32>, CancelReason> {
///     let mut results = Vec::new();
///     for item in items {
///         check_canceled(ctx, "process_items")?;
///         results.push(item * 2);
///     }
///     Ok(results)
/// }
/// ```
pub fn check_canceled(ctx: &Context, operation: &str) -> Result<(), CancelReason> {
    match ctx.reason() {
        Some(reason) => {
            debug!(%reason, "{operation}: cancellation detected");
            Err(reason)
        }
        None => Ok(()),
    }
}
