//! Cancelable nodes: the unit that owns a done-signal, a terminal reason,
//! and a registry of cancelable children.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::context::{Context, Node};
use crate::error::CancelReason;
use crate::propagate::{self, Canceler};

/// A directly cancelable context node.
///
/// The done-signal, reason, and child registry are all created lazily so a
/// short-lived node nobody waits on or cancels through never allocates
/// observation machinery. All three live behind one mutex with a
/// single-writer discipline: only [`cancel`](CancelNode::cancel) resolves
/// the signal and records the reason, and it does so at most once.
pub(crate) struct CancelNode {
    parent: Context,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    done: Option<CancellationToken>,
    reason: Option<CancelReason>,
    children: Option<Vec<Canceler>>,
}

impl CancelNode {
    pub(crate) fn new(parent: Context) -> Self {
        Self {
            parent,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn parent(&self) -> &Context {
        &self.parent
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("context state lock poisoned")
    }

    /// Returns the done-signal, creating it on first observation.
    ///
    /// Clones of a `CancellationToken` share one state, so every caller
    /// observes the same signal no matter when it asked.
    pub(crate) fn done(&self) -> CancellationToken {
        self.state()
            .done
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        self.state().reason
    }

    /// Adds `child` to the registry, or reports the reason to cancel it
    /// with instead when this node already finished.
    ///
    /// Check and insert happen under one lock so a concurrent cancel can
    /// never observe the registry between them: a registrant either lands
    /// in the registry before fan-out takes it, or is told to cancel.
    pub(crate) fn try_register(&self, child: &Canceler) -> Option<CancelReason> {
        let mut state = self.state();
        if let Some(reason) = state.reason {
            return Some(reason);
        }
        let children = state.children.get_or_insert_with(Vec::new);
        if !children.iter().any(|existing| existing.same(child)) {
            children.push(child.clone());
        }
        None
    }

    /// Removes `child` from the registry. No-op once fan-out has cleared
    /// the registry or when the child was never registered.
    pub(crate) fn unregister(&self, child: &Canceler) {
        if let Some(children) = self.state().children.as_mut() {
            children.retain(|existing| !existing.same(child));
        }
    }

    /// Cancels this node with `reason`.
    ///
    /// First cancel wins: later calls, whether from a cancel function, a
    /// parent's fan-out, or a timer expiry, are no-ops. The reason is
    /// stored and the done-signal fired before fan-out, and fan-out to
    /// children completes (same reason, verbatim, in registration order)
    /// before this call returns. `detach` removes this node from its
    /// cancelable ancestor's registry; fan-out itself always passes
    /// `detach = false` since the parent is clearing its whole registry.
    pub(crate) fn cancel(self: Arc<Self>, detach: bool, reason: CancelReason) {
        let (token, children) = {
            let mut state = self.state();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            let token = state
                .done
                .get_or_insert_with(CancellationToken::new)
                .clone();
            (token, state.children.take())
        };
        trace!(%reason, "context canceled");
        token.cancel();
        for child in children.into_iter().flatten() {
            child.cancel(false, reason);
        }
        if detach {
            propagate::unregister_child(&self.parent, &Canceler::Cancel(Arc::clone(&self)));
        }
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> Option<usize> {
        self.state().children.as_ref().map(Vec::len)
    }
}

/// The idempotent cancel handle returned by [`with_cancel`],
/// [`with_deadline`](crate::with_deadline), and
/// [`with_timeout`](crate::with_timeout).
///
/// The first call to [`cancel`](CancelFunc::cancel) cancels the context
/// and detaches it from its parent's registry; every later call is a
/// no-op. Canceling never waits for work under the context to stop; it
/// only signals. Call it as soon as the operations running under the
/// context complete so the parent can release the finished subtree.
#[derive(Clone)]
pub struct CancelFunc {
    target: Canceler,
}

impl CancelFunc {
    pub(crate) fn new(target: Canceler) -> Self {
        Self { target }
    }

    /// Tells operations under the context to abandon their work.
    pub fn cancel(&self) {
        self.target.cancel(true, CancelReason::Canceled);
    }
}

impl fmt::Debug for CancelFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelFunc")
    }
}

/// Returns a copy of `parent` with a new done-signal, plus the function
/// that fires it.
///
/// The returned context's done-signal fires when the cancel function is
/// called or when the parent's done-signal fires, whichever happens first.
/// Building on an already-canceled parent yields a context that is already
/// canceled before this call returns.
///
/// ```rust
/// use tokio_context_tree::{background, with_cancel, CancelReason};
///
/// let (parent, cancel) = with_cancel(&background());
/// let (child, _child_cancel) = with_cancel(&parent);
///
/// cancel.cancel();
/// assert_eq!(child.reason(), Some(CancelReason::Canceled));
/// assert!(parent.done().unwrap().is_cancelled());
/// ```
pub fn with_cancel(parent: &Context) -> (Context, CancelFunc) {
    let node = Arc::new(CancelNode::new(parent.clone()));
    propagate::register_child(parent, Canceler::Cancel(Arc::clone(&node)));
    let ctx = Context::from_node(Node::Cancel(Arc::clone(&node)));
    (ctx, CancelFunc::new(Canceler::Cancel(node)))
}
