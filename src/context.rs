//! The `Context` handle, the two root singletons, and the trait that lets
//! externally defined context types join a tree.
//!
//! A `Context` is a cheap clonable handle onto one node of a context tree.
//! Nodes are immutable once built; composition (`with_value`, `with_cancel`,
//! `with_deadline`) always wraps, never mutates. The node kinds form a
//! closed set so the propagation engine can discover a cancelable ancestor
//! by inspection rather than downcasting; anything outside that set enters
//! the tree through [`AnyContext`] and is treated as opaque.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelNode;
use crate::error::CancelReason;
use crate::timer::TimerNode;
use crate::value::{ContextValue, ValueNode};

/// The closed set of node kinds this crate knows how to introspect.
pub(crate) enum Node {
    /// One of the two never-canceled roots; the name is its diagnostic tag.
    Root(&'static str),
    /// A read-only key/value wrapper, transparent to cancellation.
    Value(ValueNode),
    /// A directly cancelable node.
    Cancel(Arc<CancelNode>),
    /// A cancelable node driven by a deadline timer.
    Timer(Arc<TimerNode>),
    /// An externally defined context; observable but not introspectable.
    Foreign(Arc<dyn AnyContext>),
}

/// A node in a context tree.
///
/// `Context` is `Clone` (it wraps an `Arc`); clones are handles onto the
/// same node, so a cancellation observed through one clone is observed
/// through all of them. The read surface never blocks and never fails:
///
/// - [`deadline`](Context::deadline): when work under this context should
///   be abandoned, if a deadline is set
/// - [`done`](Context::done): the done-signal, or `None` for contexts that
///   can never be canceled (treat "no signal" as "never cancels", which is
///   distinct from "already canceled")
/// - [`reason`](Context::reason): why the context finished, once it has
/// - [`value`](Context::value): request-scoped data lookup
///
/// The `Display` impl renders the composition chain for diagnostics, e.g.
/// `context.background.withCancel`.
#[derive(Clone)]
pub struct Context {
    pub(crate) node: Arc<Node>,
}

/// An externally defined context implementation.
///
/// The propagation engine cannot inspect a foreign context for a child
/// registry, so a cancelable node built on top of one is wired up by
/// racing the foreign done-signal against the child's own. Implementations
/// that merely wrap another [`Context`] should delegate every method to it.
///
/// The contract mirrors [`Context`]: `done()` returning `None` means the
/// context can never cancel, and once `done()` has fired, `reason()` must
/// report a non-`None` reason.
pub trait AnyContext: fmt::Display + Send + Sync + 'static {
    /// The time after which work under this context should be abandoned.
    fn deadline(&self) -> Option<Instant>;

    /// The done-signal, or `None` if this context can never be canceled.
    fn done(&self) -> Option<CancellationToken>;

    /// The terminal reason, once the context has finished.
    fn reason(&self) -> Option<CancelReason>;

    /// Request-scoped value lookup.
    fn value(&self, key: &str) -> Option<Arc<dyn ContextValue>>;
}

/// Returns the `background` root context.
///
/// It is never canceled, has no values, and has no deadline. It is
/// typically used by main functions, initialization, tests, and as the
/// top-level context for incoming requests. Every call returns a handle
/// onto the same process-lifetime singleton.
pub fn background() -> Context {
    static BACKGROUND: OnceLock<Context> = OnceLock::new();
    BACKGROUND
        .get_or_init(|| Context::from_node(Node::Root("background")))
        .clone()
}

/// Returns the `TODO` root context.
///
/// Like [`background`] it is never canceled, holds no values, and has no
/// deadline. Use it when it is unclear which context to use or the
/// surrounding code has not yet been extended to accept one.
pub fn todo() -> Context {
    static TODO: OnceLock<Context> = OnceLock::new();
    TODO.get_or_init(|| Context::from_node(Node::Root("TODO")))
        .clone()
}

impl Context {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Wraps an externally defined context implementation in a `Context`
    /// handle so it can parent nodes built by this crate.
    ///
    /// Cancellation still flows downward through it: a cancelable child
    /// observes the foreign done-signal and adopts the foreign reason when
    /// it fires first.
    pub fn from_external(external: impl AnyContext) -> Self {
        Self::from_node(Node::Foreign(Arc::new(external)))
    }

    /// Whether two handles refer to the same node.
    ///
    /// Context nodes are distinguished by identity, not structure; this is
    /// how the two roots are told apart.
    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// The time after which work done on behalf of this context should be
    /// abandoned, or `None` when no deadline is set.
    ///
    /// Successive calls always return the same result.
    pub fn deadline(&self) -> Option<Instant> {
        match &*self.node {
            Node::Root(_) => None,
            Node::Value(value) => value.parent.deadline(),
            Node::Cancel(cancel) => cancel.parent().deadline(),
            Node::Timer(timer) => Some(timer.deadline()),
            Node::Foreign(external) => external.deadline(),
        }
    }

    /// The done-signal for this context, or `None` if it can never be
    /// canceled.
    ///
    /// Every call observes the same underlying signal: the returned tokens
    /// are clones sharing one state, so a waiter holding a token from an
    /// earlier call sees later cancellations. The signal fires exactly
    /// once, when the context is canceled or its deadline passes.
    pub fn done(&self) -> Option<CancellationToken> {
        match &*self.node {
            Node::Root(_) => None,
            Node::Value(value) => value.parent.done(),
            Node::Cancel(cancel) => Some(cancel.done()),
            Node::Timer(timer) => Some(timer.done()),
            Node::Foreign(external) => external.done(),
        }
    }

    /// Why this context finished, or `None` while it is still live.
    ///
    /// Returns [`CancelReason::Canceled`] after an explicit cancellation
    /// and [`CancelReason::DeadlineExceeded`] after a deadline expiry.
    /// Once set, successive calls always return the same reason.
    pub fn reason(&self) -> Option<CancelReason> {
        match &*self.node {
            Node::Root(_) => None,
            Node::Value(value) => value.parent.reason(),
            Node::Cancel(cancel) => cancel.reason(),
            Node::Timer(timer) => timer.reason(),
            Node::Foreign(external) => external.reason(),
        }
    }

    /// Looks up the value associated with `key` in this context chain.
    ///
    /// The nearest node carrying `key` wins, so values added later shadow
    /// values added earlier for the same key. Returns `None` when no node
    /// in the chain carries the key.
    pub fn value(&self, key: &str) -> Option<Arc<dyn ContextValue>> {
        match &*self.node {
            Node::Root(_) => None,
            Node::Value(value) => value.lookup(key),
            Node::Cancel(cancel) => cancel.parent().value(key),
            Node::Timer(timer) => timer.parent().value(key),
            Node::Foreign(external) => external.value(key),
        }
    }

    /// Typed convenience over [`value`](Context::value): downcasts the
    /// stored value to `T` and clones it out.
    ///
    /// ```rust
    /// use tokio_context_tree::{background, with_value};
    ///
    /// let ctx = with_value(&background(), "attempt", 3u32);
    /// assert_eq!(ctx.value_as::<u32>("attempt"), Some(3));
    /// assert_eq!(ctx.value_as::<String>("attempt"), None);
    /// ```
    pub fn value_as<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.value(key)
            .and_then(|value| value.as_ref().as_any().downcast_ref::<T>().cloned())
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.node {
            Node::Root(name) => write!(f, "context.{name}"),
            Node::Value(value) => write!(
                f,
                "{}.withValue({}, {:?})",
                value.parent, value.key, value.value
            ),
            Node::Cancel(cancel) => write!(f, "{}.withCancel", cancel.parent()),
            Node::Timer(timer) => {
                write!(f, "{}.withDeadline({:?})", timer.parent(), timer.deadline())
            }
            Node::Foreign(external) => fmt::Display::fmt(external, f),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
