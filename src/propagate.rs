//! The propagation engine: cancelable-ancestor discovery, child
//! registration and removal, and the observation race used when a parent
//! cannot be introspected.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::cancel::CancelNode;
use crate::context::{Context, Node};
use crate::error::CancelReason;
use crate::timer::TimerNode;

/// An entry in a cancelable node's child registry.
///
/// Both node kinds that can be canceled directly appear here, compared by
/// `Arc` identity. A timer-backed child must be stored as such so fan-out
/// stops its timer, not just its embedded cancelable node.
#[derive(Clone)]
pub(crate) enum Canceler {
    Cancel(Arc<CancelNode>),
    Timer(Arc<TimerNode>),
}

impl Canceler {
    pub(crate) fn cancel(&self, detach: bool, reason: CancelReason) {
        match self {
            Canceler::Cancel(node) => Arc::clone(node).cancel(detach, reason),
            Canceler::Timer(node) => Arc::clone(node).cancel(detach, reason),
        }
    }

    pub(crate) fn done(&self) -> CancellationToken {
        match self {
            Canceler::Cancel(node) => node.done(),
            Canceler::Timer(node) => node.done(),
        }
    }

    pub(crate) fn same(&self, other: &Canceler) -> bool {
        match (self, other) {
            (Canceler::Cancel(a), Canceler::Cancel(b)) => Arc::ptr_eq(a, b),
            (Canceler::Timer(a), Canceler::Timer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Follows parent references until it finds a node that can hold a child
/// registry.
///
/// Value nodes are tunneled through (they are transparent to
/// cancellation); a timer node is unwrapped to its embedded cancelable
/// node. Roots and foreign nodes end the walk with no ancestor found.
pub(crate) fn cancelable_ancestor(ctx: &Context) -> Option<Arc<CancelNode>> {
    let mut current = ctx.clone();
    loop {
        let parent = match &*current.node {
            Node::Cancel(node) => return Some(Arc::clone(node)),
            Node::Timer(node) => return Some(Arc::clone(node.cancel_node())),
            Node::Value(value) => value.parent.clone(),
            Node::Root(_) | Node::Foreign(_) => return None,
        };
        current = parent;
    }
}

/// Arranges for `child` to be canceled when `parent` is.
///
/// A parent without a done-signal can never cancel, so there is nothing to
/// wire. A parent with a cancelable ancestor gets `child` in that
/// ancestor's registry, unless the ancestor already finished, in which
/// case `child` is canceled here, synchronously, with the ancestor's
/// reason. A parent that is observable but not introspectable (a foreign
/// node somewhere before the first cancelable ancestor) is handled by
/// racing its done-signal against the child's own: only the first
/// resolution is acted on, and no detachment happens on this path since
/// there is no registry to remove the child from.
pub(crate) fn register_child(parent: &Context, child: Canceler) {
    let Some(parent_done) = parent.done() else {
        return;
    };
    match cancelable_ancestor(parent) {
        Some(ancestor) => {
            if let Some(reason) = ancestor.try_register(&child) {
                child.cancel(false, reason);
            }
        }
        None => {
            let child_done = child.done();
            let parent = parent.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = parent_done.cancelled() => {
                        // A conforming context reports a reason once its
                        // done-signal has fired.
                        let reason = parent.reason().unwrap_or(CancelReason::Canceled);
                        trace!(%reason, "foreign parent finished, canceling child");
                        child.cancel(false, reason);
                    }
                    () = child_done.cancelled() => {}
                }
            });
        }
    }
}

/// Removes `child` from its parent's registry, if the parent chain has
/// one. No-op for never-cancelable parents and for registries already
/// cleared by the ancestor's own fan-out.
pub(crate) fn unregister_child(parent: &Context, child: &Canceler) {
    if let Some(ancestor) = cancelable_ancestor(parent) {
        ancestor.unregister(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::with_cancel;
    use crate::context::{background, AnyContext};
    use crate::timer::with_timeout;
    use crate::value::{with_value, ContextValue};
    use std::fmt;
    use std::time::Duration;
    use tokio::time::Instant;

    /// A context type outside this crate's node hierarchy, delegating
    /// everything to a wrapped context.
    struct Opaque(Context);

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(&self.0, f)
        }
    }

    impl AnyContext for Opaque {
        fn deadline(&self) -> Option<Instant> {
            self.0.deadline()
        }
        fn done(&self) -> Option<CancellationToken> {
            self.0.done()
        }
        fn reason(&self) -> Option<CancelReason> {
            self.0.reason()
        }
        fn value(&self, key: &str) -> Option<Arc<dyn ContextValue>> {
            self.0.value(key)
        }
    }

    #[test]
    fn ancestor_tunnels_through_value_nodes() {
        let (parent, _cancel) = with_cancel(&background());
        let wrapped = with_value(&with_value(&parent, "a", 1), "b", 2);

        let found = cancelable_ancestor(&wrapped).expect("ancestor through value nodes");
        let direct = cancelable_ancestor(&parent).unwrap();
        assert!(Arc::ptr_eq(&found, &direct));
    }

    #[test]
    fn ancestor_walk_stops_at_roots_and_foreign_nodes() {
        assert!(cancelable_ancestor(&background()).is_none());

        let (parent, _cancel) = with_cancel(&background());
        let foreign = Context::from_external(Opaque(parent));
        assert!(cancelable_ancestor(&foreign).is_none());
    }

    #[test]
    fn registry_deduplicates_by_identity() {
        let (parent, _cancel) = with_cancel(&background());
        let node = cancelable_ancestor(&parent).unwrap();

        let child = Canceler::Cancel(Arc::new(CancelNode::new(parent.clone())));
        assert!(node.try_register(&child).is_none());
        assert!(node.try_register(&child).is_none());
        assert_eq!(node.child_count(), Some(1));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn parent_finishes_children() {
        // parent -> cancel_child
        // parent -> value_child -> timer_child
        let (parent, cancel) = with_cancel(&background());
        let (cancel_child, _keep1) = with_cancel(&parent);
        let value_child = with_value(&parent, "key", "value");
        let (timer_child, _keep2) = with_timeout(&value_child, Duration::from_secs(36_000));

        let registry = cancelable_ancestor(&parent).unwrap();
        assert_eq!(registry.child_count(), Some(2));

        cancel.cancel();

        // Fan-out cleared the registry and finished every descendant.
        assert_eq!(registry.child_count(), None);
        for ctx in [&parent, &cancel_child, &value_child, &timer_child] {
            assert!(ctx.done().unwrap().is_cancelled(), "{ctx} should be done");
            assert_eq!(ctx.reason(), Some(CancelReason::Canceled));
        }
    }

    #[test]
    fn child_finishing_first_detaches() {
        let (parent, _keep) = with_cancel(&background());
        let (child, child_cancel) = with_cancel(&parent);

        let registry = cancelable_ancestor(&parent).unwrap();
        assert_eq!(registry.child_count(), Some(1));

        child_cancel.cancel();

        assert_eq!(registry.child_count(), Some(0));
        assert_eq!(child.reason(), Some(CancelReason::Canceled));

        // No upward propagation.
        assert!(parent.reason().is_none());
        assert!(!parent.done().unwrap().is_cancelled());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn race_fallback_cancels_child_of_foreign_parent() {
        let (inner, cancel) = with_cancel(&background());
        let foreign = Context::from_external(Opaque(inner));
        let (child, _keep) = with_cancel(&foreign);

        assert!(!child.done().unwrap().is_cancelled());

        cancel.cancel();
        child.done().unwrap().cancelled().await;
        assert_eq!(child.reason(), Some(CancelReason::Canceled));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn race_fallback_child_first_leaves_parent_alone() {
        let (inner, _keep) = with_cancel(&background());
        let foreign = Context::from_external(Opaque(inner.clone()));
        let (child, child_cancel) = with_cancel(&foreign);

        child_cancel.cancel();
        assert_eq!(child.reason(), Some(CancelReason::Canceled));

        // Let the observation race settle on the child branch.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(inner.reason().is_none());
        assert!(!inner.done().unwrap().is_cancelled());
    }
}
