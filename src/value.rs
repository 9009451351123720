//! Value nodes: read-only key/value wrappers, transparent to cancellation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::{Context, Node};

/// A value storable in a context.
///
/// Blanket-implemented for every `'static` type that is `Debug + Send +
/// Sync`, so callers never implement it by hand. [`as_any`] is the
/// downcast hook used by [`Context::value_as`]; `Debug` feeds the
/// context's diagnostic description.
///
/// [`as_any`]: ContextValue::as_any
pub trait ContextValue: Any + fmt::Debug + Send + Sync {
    /// Returns `self` as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ContextValue for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A context node carrying exactly one key/value pair.
///
/// Everything except a matching-key lookup delegates to the parent, so the
/// node is invisible to deadlines and cancellation. Any number of
/// descendants may share the same parent; the node is never mutated after
/// construction.
pub(crate) struct ValueNode {
    pub(crate) parent: Context,
    pub(crate) key: String,
    pub(crate) value: Arc<dyn ContextValue>,
}

impl ValueNode {
    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<dyn ContextValue>> {
        if self.key == key {
            Some(Arc::clone(&self.value))
        } else {
            self.parent.value(key)
        }
    }
}

/// Returns a copy of `parent` in which the value associated with `key` is
/// `value`.
///
/// Use context values only for request-scoped data that transits processes
/// and APIs, not for passing optional parameters to functions. The nearest
/// node wins on key conflicts, so re-adding a key shadows the older value
/// for descendants without affecting the parent chain.
///
/// ```rust
/// use tokio_context_tree::{background, with_value};
///
/// let c1 = with_value(&background(), "k", "a");
/// let c2 = with_value(&c1, "k", "b");
/// assert_eq!(c1.value_as::<&str>("k"), Some("a"));
/// assert_eq!(c2.value_as::<&str>("k"), Some("b"));
/// ```
///
/// # Panics
///
/// Panics if `key` is empty. An empty key is indistinguishable from "no
/// key" at lookup time, so constructing with one is a usage error reported
/// at the call site.
#[track_caller]
pub fn with_value(parent: &Context, key: impl Into<String>, value: impl ContextValue) -> Context {
    let key = key.into();
    assert!(!key.is_empty(), "with_value: key must not be empty");
    Context::from_node(Node::Value(ValueNode {
        parent: parent.clone(),
        key,
        value: Arc::new(value),
    }))
}
