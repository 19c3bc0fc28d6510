//! The named fetch capability consumed by the prefetch hook.
//!
//! A fetch mapping binds dependency names to asynchronous operations.  The
//! mapping is immutable once built and cheap to clone; its identity (in the
//! sense of "is this the same set of declarations") is the identity of the
//! underlying allocation, exposed through [`FetchMap::same_mapping`], so
//! that two structurally similar mappings built separately still count as
//! distinct declarations.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use indexmap::IndexMap;
use serde_json::Value;

/// Argument lists keyed by dependency name.
///
/// Insertion-ordered; a dependency with no entry here is fetched with no
/// arguments.
pub type Params = IndexMap<String, Vec<Value>>;

/// The future returned by a fetch operation.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Value, FetchError>> + Send>>;

/// Failure of a fetch operation.
///
/// Never propagated as a panic or early return by the hook or the renderer;
/// captured into the owning dependency's `error` field (client) or recorded
/// as an empty hand-off entry (server).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The operation itself failed.
    #[error("{0}")]
    Failed(String),
    /// A required argument was absent from the supplied argument list.
    ///
    /// Argument validation is the operation's own responsibility; this
    /// variant only exists so callers can signal the condition distinctly.
    /// The hook treats every variant identically.
    #[error("missing required argument: {0}")]
    MissingArgument(String),
}

/// A named asynchronous data source.
///
/// Accepts zero or more positional arguments and eventually yields a value
/// or a [`FetchError`].  Implemented for you when building a mapping with
/// closures through [`FetchMapBuilder::op`].
pub trait FetchFn: Send + Sync {
    fn call(&self, args: &[Value]) -> FetchFuture;
}

struct ClosureOp<F>(F);

impl<F, Fut> FetchFn for ClosureOp<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    fn call(&self, args: &[Value]) -> FetchFuture {
        Box::pin((self.0)(args.to_vec()))
    }
}

/// An immutable mapping from dependency name to fetch operation.
///
/// One mapping passed to a single hook invocation may contain multiple
/// dependency names, each bound to its own operation.  Iteration follows
/// declaration order.
#[derive(Clone)]
pub struct FetchMap {
    inner: Arc<IndexMap<String, Arc<dyn FetchFn>>>,
}

impl FetchMap {
    pub fn builder() -> FetchMapBuilder {
        FetchMapBuilder::default()
    }

    /// Dependency names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// The operation bound to `name`, if declared.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FetchFn>> {
        self.inner.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Whether `other` is the very same mapping, by identity rather than
    /// by structure.  Operations compare by reference only.
    pub fn same_mapping(&self, other: &FetchMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FetchMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Builder for [`FetchMap`].
#[derive(Default)]
pub struct FetchMapBuilder {
    inner: IndexMap<String, Arc<dyn FetchFn>>,
}

impl FetchMapBuilder {
    /// Bind `name` to an asynchronous operation.
    ///
    /// The closure receives the positional argument list supplied through
    /// the hook's params for that name (empty when none were supplied).
    /// Re-binding an existing name replaces the previous operation.
    pub fn op<F, Fut>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.inner.insert(name.into(), Arc::new(ClosureOp(op)));
        self
    }

    pub fn build(self) -> FetchMap {
        FetchMap {
            inner: Arc::new(self.inner),
        }
    }
}
