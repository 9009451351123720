//! Timer-backed nodes: cancelable nodes that cancel themselves with
//! [`CancelReason::DeadlineExceeded`] when their deadline elapses.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::{with_cancel, CancelFunc, CancelNode};
use crate::context::{Context, Node};
use crate::error::CancelReason;
use crate::propagate::{self, Canceler};

/// A cancelable node with an explicit deadline and a one-shot timer.
///
/// The embedded [`CancelNode`] implements done/reason/value; this node
/// only adds the deadline and the timer handle. Transitions out of the
/// scheduled state are terminal: the timer fires, or an explicit cancel or
/// a parent's fan-out gets there first. Whichever path runs stops the
/// timer before delegating downward, so an expiry can never fire after an
/// explicit cancellation.
pub(crate) struct TimerNode {
    inner: Arc<CancelNode>,
    deadline: Instant,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimerNode {
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn parent(&self) -> &Context {
        self.inner.parent()
    }

    pub(crate) fn cancel_node(&self) -> &Arc<CancelNode> {
        &self.inner
    }

    pub(crate) fn done(&self) -> CancellationToken {
        self.inner.done()
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        self.inner.reason()
    }

    fn timer_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().expect("timer slot lock poisoned")
    }

    /// Stops any pending timer. Idempotent: stopping a timer that never
    /// existed, already fired, or was already stopped is a no-op.
    fn stop_timer(&self) {
        if let Some(handle) = self.timer_slot().take() {
            handle.abort();
        }
    }

    /// Cancels this node: stops the timer first, then delegates to the
    /// embedded cancelable node. `detach` removes this node (under its
    /// timer identity) from the cancelable ancestor's registry.
    pub(crate) fn cancel(self: Arc<Self>, detach: bool, reason: CancelReason) {
        self.stop_timer();
        Arc::clone(&self.inner).cancel(false, reason);
        if detach {
            propagate::unregister_child(self.inner.parent(), &Canceler::Timer(Arc::clone(&self)));
        }
    }
}

/// Returns a copy of `parent` with its deadline adjusted to be no later
/// than `deadline`, plus the cancel function.
///
/// If the parent's own deadline is already no later than the requested
/// one, no timer is created: the result behaves like
/// [`with_cancel(parent)`](with_cancel), since the parent's deadline
/// already bounds the child at least as tightly.
///
/// The returned context's done-signal fires when the deadline expires,
/// when the cancel function is called, or when the parent's done-signal
/// fires, whichever happens first. A deadline that has already passed
/// cancels the context synchronously, before this call returns.
///
/// Canceling this context releases the resources associated with it, so
/// call the cancel function as soon as the operations running under it
/// complete.
///
/// Scheduling the timer requires a Tokio runtime.
pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelFunc) {
    if let Some(parent_deadline) = parent.deadline() {
        if parent_deadline <= deadline {
            return with_cancel(parent);
        }
    }

    let node = Arc::new(TimerNode {
        inner: Arc::new(CancelNode::new(parent.clone())),
        deadline,
        timer: Mutex::new(None),
    });
    propagate::register_child(parent, Canceler::Timer(Arc::clone(&node)));
    let ctx = Context::from_node(Node::Timer(Arc::clone(&node)));

    if deadline <= Instant::now() {
        debug!(ctx = %ctx, "deadline already passed at construction");
        Arc::clone(&node).cancel(true, CancelReason::DeadlineExceeded);
        return (ctx, CancelFunc::new(Canceler::Timer(node)));
    }

    // Registration may have found an already-canceled parent; arming a
    // timer for a finished node would be wasted work.
    if node.reason().is_none() {
        let armed = Arc::clone(&node);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!(deadline = ?deadline, "context deadline elapsed");
            armed.cancel(true, CancelReason::DeadlineExceeded);
        });
        *node.timer_slot() = Some(handle);
        // The expiry may have run before the handle landed in the slot;
        // it found the slot empty, so clear it here instead.
        if node.reason().is_some() {
            node.stop_timer();
        }
    }

    (ctx, CancelFunc::new(Canceler::Timer(node)))
}

/// Returns [`with_deadline(parent, now + timeout)`](with_deadline).
pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelFunc) {
    with_deadline(parent, Instant::now() + timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::background;
    use crate::propagate::cancelable_ancestor;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn with_deadline_has_correct_api() {
        let deadline = Instant::now() + Duration::from_millis(500);
        let (ctx, _cancel) = with_deadline(&background(), deadline);

        assert_eq!(ctx.deadline(), Some(deadline));
        assert!(ctx.reason().is_none());
        assert!(!ctx.done().unwrap().is_cancelled());
        assert!(ctx
            .to_string()
            .starts_with("context.background.withDeadline("));
    }

    #[test]
    fn already_passed_deadline_cancels_synchronously() {
        let (ctx, _cancel) = with_deadline(&background(), Instant::now());

        // No "not yet canceled" window is observable.
        assert!(ctx.done().unwrap().is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn timer_fires_at_deadline() {
        let (ctx, _cancel) = with_timeout(&background(), Duration::from_millis(50));
        let done = ctx.done().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!done.is_cancelled());
        assert!(ctx.reason().is_none());

        tokio::time::sleep(Duration::from_millis(190)).await;
        assert!(done.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expiry_detaches_from_parent() {
        let (parent, _keep) = with_cancel(&background());
        let (ctx, _cancel) = with_timeout(&parent, Duration::from_millis(20));

        let registry = cancelable_ancestor(&parent).unwrap();
        assert_eq!(registry.child_count(), Some(1));

        ctx.done().unwrap().cancelled().await;
        assert_eq!(registry.child_count(), Some(0));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn explicit_cancel_beats_the_timer() {
        let (ctx, cancel) = with_timeout(&background(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(ctx.reason(), Some(CancelReason::Canceled));

        // The stopped timer must not overwrite the reason.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.reason(), Some(CancelReason::Canceled));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn later_deadline_clamps_to_parent() {
        let parent_deadline = Instant::now() + Duration::from_millis(50);
        let (parent, _keep) = with_deadline(&background(), parent_deadline);
        let (child, _cancel) = with_deadline(&parent, parent_deadline + Duration::from_secs(1));

        // No independent timer: the child reads the parent's deadline and
        // is a plain cancelable node.
        assert_eq!(child.deadline(), Some(parent_deadline));
        assert!(child.to_string().ends_with(".withCancel"));

        child.done().unwrap().cancelled().await;
        assert_eq!(child.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn equal_deadline_also_clamps() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let (parent, _keep) = with_deadline(&background(), deadline);
        let (child, _cancel) = with_deadline(&parent, deadline);

        assert!(child.to_string().ends_with(".withCancel"));
        assert_eq!(child.deadline(), Some(deadline));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn timer_on_canceled_parent_never_arms() {
        let (parent, cancel) = with_cancel(&background());
        cancel.cancel();

        let (ctx, _cancel) = with_timeout(&parent, Duration::from_millis(50));
        assert_eq!(ctx.reason(), Some(CancelReason::Canceled));

        // The deadline passing later must not rewrite the reason.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.reason(), Some(CancelReason::Canceled));
    }
}
