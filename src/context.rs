//! The shared render context: prefetched data, the pending request queue,
//! and the tree-scoped value carrying both.
//!
//! All containers here are handles over shared state, mutated in place for
//! the duration of one render invocation.  `data` writes are single-key
//! inserts (each dependency name is owned by exactly one hook instance per
//! pass) and `requests` writes are append-only, so there are no conflicting
//! concurrent writes to contend with during a pass.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, RwLock},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in the server-to-client hand-off mapping.
///
/// Serializes as `{"data": ...}` for a resolved dependency and as `{}` for
/// one whose fetch failed during the server render; the empty form is what
/// lets the client retry through its normal missing-data path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DataEntry {
    pub fn new(data: Value) -> Self {
        Self { data: Some(data) }
    }

    pub const fn empty() -> Self {
        Self { data: None }
    }
}

/// The prefetched-data mapping handed from server render to client mount.
///
/// A cheap-to-clone handle; every clone reads and writes the same mapping.
/// Note the distinction between an absent entry (the dependency has never
/// been attempted, so SSR will request it) and a present-but-empty entry
/// (attempted and failed, so SSR will not request it again).
#[derive(Clone, Default)]
pub struct PrefetchData {
    inner: Arc<RwLock<IndexMap<String, DataEntry>>>,
}

impl PrefetchData {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the entry for `name`, if present.
    pub fn get(&self, name: &str) -> Option<DataEntry> {
        self.read().get(name).cloned()
    }

    /// The resolved value for `name`, flattening away empty entries.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.read().get(name).and_then(|entry| entry.data.clone())
    }

    /// Whether an entry exists at all, even an empty one.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn insert(&self, name: impl Into<String>, entry: DataEntry) {
        self.write().insert(name.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// An owned copy of the current mapping.
    pub fn snapshot(&self) -> IndexMap<String, DataEntry> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, DataEntry>> {
        self.inner
            .read()
            .expect("internal error: prefetch data lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, DataEntry>> {
        self.inner
            .write()
            .expect("internal error: prefetch data lock poisoned")
    }
}

impl FromIterator<(String, DataEntry)> for PrefetchData {
    fn from_iter<I: IntoIterator<Item = (String, DataEntry)>>(iter: I) -> Self {
        Self {
            inner: Arc::new(RwLock::new(iter.into_iter().collect())),
        }
    }
}

impl From<IndexMap<String, DataEntry>> for PrefetchData {
    fn from(entries: IndexMap<String, DataEntry>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entries)),
        }
    }
}

impl PartialEq for PrefetchData {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || *self.read() == *other.read()
    }
}

impl fmt::Debug for PrefetchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.read().iter()).finish()
    }
}

impl Serialize for PrefetchData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PrefetchData {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IndexMap::<String, DataEntry>::deserialize(deserializer).map(Self::from)
    }
}

/// A deferred fetch-and-store operation queued during an SSR pass.
///
/// Invoking one calls the underlying fetch operation with the arguments
/// captured at render time, awaits it, and writes the outcome into the
/// data mapping the declaring hook observed: `{"data": ...}` on success,
/// an empty entry on failure.
pub struct FetchRequest {
    name: String,
    run: Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>,
}

impl FetchRequest {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// The dependency name this request will resolve.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        (self.run)()
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The pending-request list, present in the context only during SSR.
///
/// Hooks append to it synchronously during the render pass; the renderer
/// drains it immediately after the pass completes.  Client contexts carry
/// no queue at all.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<Vec<FetchRequest>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: FetchRequest) {
        self.lock().push(request);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<FetchRequest> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FetchRequest>> {
        self.inner
            .lock()
            .expect("internal error: request queue lock poisoned")
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// The tree-scoped context value read by the prefetch hook.
///
/// Provided by [`PrefetchProvider`](crate::component::PrefetchProvider).
/// The default (no provider anywhere above) carries neither field; hooks
/// treat that as "no prefetch context" and behave as pure client-side
/// fetchers.
#[derive(Clone, Debug, Default)]
pub struct PrefetchContext {
    pub data: Option<PrefetchData>,
    pub requests: Option<RequestQueue>,
}

impl PrefetchContext {
    pub fn new(data: Option<PrefetchData>, requests: Option<RequestQueue>) -> Self {
        Self { data, requests }
    }

    /// Shallow-merge onto the nearest ancestor value.
    ///
    /// Present fields of `self` win; absent ones inherit the ancestor's.
    /// This is what lets an inner provider contribute additional data
    /// without severing the subtree from ancestor-level request tracking.
    pub fn merged_onto(&self, ancestor: &PrefetchContext) -> PrefetchContext {
        PrefetchContext {
            data: self.data.clone().or_else(|| ancestor.data.clone()),
            requests: self.requests.clone().or_else(|| ancestor.requests.clone()),
        }
    }
}
