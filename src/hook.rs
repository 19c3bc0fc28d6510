//! The per-component prefetch hook.
//!
//! [`use_prefetch`] is the state machine at the heart of the crate: for
//! every name in the supplied fetch mapping it derives an initial state
//! synchronously (from context data, fallbacks, and `lazy`), cooperates
//! with the server-side renderer by appending deferred fetch descriptors
//! to the context's request queue during the render pass, and defers the
//! client-only work (binding `refetch`, the initial fetch or retry of
//! still-loading dependencies, reacting to parameter changes) to effects
//! that never run under SSR.
//!
//! Completion transitions are merged onto whatever the state is at the
//! time a fetch resolves, not onto a snapshot from when it was issued.
//! If several fetches for the same name are in flight, the last one to
//! resolve wins; no generation fencing is performed, so a slow stale
//! fetch can overwrite a fresher result.  This is accepted, documented
//! behavior.

use std::{fmt, sync::Arc};

use futures::future::join_all;
use indexmap::IndexMap;
use leptos::prelude::*;
use serde_json::Value;

use crate::{
    context::{DataEntry, FetchRequest, PrefetchContext, PrefetchData, RequestQueue},
    fetch::{FetchError, FetchFn, FetchMap, Params},
    memo::DeepMemo,
};

/// Reactive state for every dependency declared by one hook invocation,
/// keyed by dependency name in declaration order.
pub type PrefetchState = IndexMap<String, DepState>;

pub(crate) type ParamsFn = Arc<dyn Fn() -> Params + Send + Sync>;

/// The state of one named dependency.
#[derive(Clone, Debug, Default)]
pub struct DepState {
    /// The last successfully fetched value, or a caller-supplied fallback.
    pub data: Option<Value>,
    /// Whether a fetch for this dependency is outstanding.  While `true`,
    /// `data` and `error` hold stale pre-fetch values.
    pub loading: bool,
    /// The last fetch failure.
    pub error: Option<FetchError>,
    /// The argument list used for the most recent fetch.
    pub params: Option<Vec<Value>>,
    /// Re-issues this dependency's fetch.  Bound by the mount task, so it
    /// is absent during the first synchronous render pass.
    pub refetch: Option<Refetch>,
}

impl PartialEq for DepState {
    /// `refetch` carries no comparable state and is ignored.
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.loading == other.loading
            && self.error == other.error
            && self.params == other.params
    }
}

/// Reactive handle to the state of every dependency declared by one
/// [`use_prefetch`] call.
#[derive(Clone)]
pub struct Prefetched {
    state: ArcRwSignal<PrefetchState>,
}

impl Prefetched {
    /// A reactive clone of one dependency's state.
    pub fn get(&self, name: &str) -> Option<DepState> {
        self.state.with(|state| state.get(name).cloned())
    }

    /// A reactive projection of one dependency's state, without cloning.
    pub fn with<U>(&self, name: &str, f: impl FnOnce(Option<&DepState>) -> U) -> U {
        self.state.with(|state| f(state.get(name)))
    }

    /// The backing signal.
    pub fn signal(&self) -> ArcRwSignal<PrefetchState> {
        self.state.clone()
    }
}

impl fmt::Debug for Prefetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.with_untracked(|state| {
            f.debug_struct("Prefetched").field("state", state).finish()
        })
    }
}

/// Re-issues one dependency's fetch with fresh loading/error transitions.
#[derive(Clone)]
pub struct Refetch {
    name: Arc<str>,
    fetcher: Arc<dyn FetchFn>,
    params: Option<ParamsFn>,
    state: ArcRwSignal<PrefetchState>,
}

impl Refetch {
    /// Fire-and-forget [`run`](Refetch::run) on the local executor.  Only
    /// meaningful on a live client.
    pub fn call(&self, args: Option<Vec<Value>>) {
        leptos::task::spawn_local(self.clone().run(args));
    }

    /// Set `loading` (preserving stale `data` and `error`), invoke the
    /// fetch, and apply the completion transition.
    ///
    /// Explicit `args` win; otherwise the arguments recorded for the most
    /// recent fetch are reused, falling back to the hook's params source.
    pub async fn run(self, args: Option<Vec<Value>>) {
        let name = self.name.to_string();
        self.state.try_update(|state| {
            if let Some(dep) = state.get_mut(&name) {
                dep.loading = true;
            }
        });
        let args = args
            .or_else(|| {
                self.state
                    .with_untracked(|state| state.get(&name).and_then(|dep| dep.params.clone()))
            })
            .or_else(|| {
                self.params
                    .as_ref()
                    .map(|source| source().get(&name).cloned().unwrap_or_default())
            })
            .unwrap_or_default();
        let result = self.fetcher.call(&args).await;
        apply_result(&self.state, &name, args, result);
    }
}

impl fmt::Debug for Refetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refetch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configuration for [`use_prefetch`].
#[derive(Clone, Default)]
pub struct PrefetchOptions {
    params: Option<ParamsFn>,
    default_value: Option<Value>,
    initial_value: IndexMap<String, Value>,
    lazy: bool,
}

impl PrefetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static per-dependency argument lists.
    pub fn params(self, params: Params) -> Self {
        self.params_with(move || params.clone())
    }

    /// Reactive per-dependency argument source.
    ///
    /// Signals read inside the closure are tracked; a structurally
    /// different result re-issues every fetch in the mapping with the
    /// new arguments.  A structurally equal result, even from a freshly
    /// constructed value, does not.
    pub fn params_with(mut self, source: impl Fn() -> Params + Send + Sync + 'static) -> Self {
        self.params = Some(Arc::new(source));
        self
    }

    /// Fallback data applied to every dependency lacking context data.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Per-dependency fallback data, taking precedence over
    /// [`default_value`](PrefetchOptions::default_value).
    pub fn initial_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.initial_value.insert(name.into(), value);
        self
    }

    /// Suppress automatic fetching entirely; only an explicit
    /// [`Refetch::call`] fetches a lazy dependency.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub(crate) fn params_now(&self) -> Params {
        self.params.as_ref().map(|source| source()).unwrap_or_default()
    }
}

impl fmt::Debug for PrefetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchOptions")
            .field("params", &self.params.as_ref().map(|_| "…"))
            .field("default_value", &self.default_value)
            .field("initial_value", &self.initial_value)
            .field("lazy", &self.lazy)
            .finish()
    }
}

/// Declare named asynchronous data dependencies for a component.
///
/// For every name in `fetchers`, the returned handle exposes `{data,
/// loading, error, refetch}` state derived as follows: a name already
/// answered in the ambient context data starts resolved with that value
/// and is never fetched; with `lazy` set, a name starts idle and is only
/// fetched through `refetch`; any other name starts loading and is
/// fetched — through the request queue when the server-side renderer is
/// driving the tree, through a mount-time task on a live client.
///
/// Used outside of any [`PrefetchProvider`](crate::component::PrefetchProvider),
/// the hook behaves as a pure client-side fetcher.
pub fn use_prefetch(fetchers: FetchMap, options: PrefetchOptions) -> Prefetched {
    let ctx = use_context::<PrefetchContext>().unwrap_or_default();
    let params_now = options.params_now();

    let initial = initial_state(&fetchers, ctx.data.as_ref(), &options);
    let retry: Vec<String> = initial
        .iter()
        .filter(|(_, dep)| dep.loading)
        .map(|(name, _)| name.clone())
        .collect();
    let state = ArcRwSignal::new(initial);

    // Server-side cooperation.  This must happen here, synchronously,
    // during the render pass: the renderer drains the queue immediately
    // after the pass and effects never run on the server.
    if let (Some(sink), Some(queue), false) =
        (ctx.data.as_ref(), ctx.requests.as_ref(), options.lazy)
    {
        queue_requests(&fetchers, &params_now, sink, queue);
    }

    // Mount task, run once per component instance: binds the refetch
    // callables, then fetches whatever is still loading.  The taken
    // Option is the instance-scoped once-guard.
    let mut mount = Some((
        state.clone(),
        fetchers.clone(),
        options.params.clone(),
        retry,
    ));
    Effect::new(move |_: Option<()>| {
        if let Some((state, fetchers, params, retry)) = mount.take() {
            leptos::task::spawn_local(run_mount_task(state, fetchers, params, retry));
        }
    });

    // Parameter watcher.  The first evaluation primes the memo so that it
    // never overlaps with the mount task's initial fetch; lazy hooks do
    // not react to parameter changes at all.
    if let (Some(source), false) = (options.params.clone(), options.lazy) {
        let state = state.clone();
        let fetchers = fetchers.clone();
        let mut tracker = ParamsTracker::default();
        Effect::new(move |_: Option<()>| {
            let params = source();
            if let ParamsChange::Changed(params) = tracker.observe(params) {
                leptos::task::spawn_local(refetch_all(
                    state.clone(),
                    fetchers.clone(),
                    params,
                ));
            }
        });
    }

    Prefetched { state }
}

/// Synchronous derivation of the initial per-dependency state.
pub(crate) fn initial_state(
    fetchers: &FetchMap,
    data: Option<&PrefetchData>,
    options: &PrefetchOptions,
) -> PrefetchState {
    fetchers
        .names()
        .map(|name| {
            let known = data.and_then(|data| data.value(name));
            let loading = !options.lazy && known.is_none();
            let fallback = options
                .initial_value
                .get(name)
                .cloned()
                .or_else(|| options.default_value.clone());
            let dep = DepState {
                data: known.or(fallback),
                loading,
                ..DepState::default()
            };
            (name.to_owned(), dep)
        })
        .collect()
}

/// Append one deferred descriptor per dependency the server does not know
/// yet.  An entry that exists but is empty (an earlier failed attempt) is
/// not requested again; that retry belongs to the client.
pub(crate) fn queue_requests(
    fetchers: &FetchMap,
    params: &Params,
    sink: &PrefetchData,
    queue: &RequestQueue,
) {
    for name in fetchers.names() {
        if sink.contains(name) {
            continue;
        }
        let fetcher = fetchers
            .get(name)
            .expect("internal error: name missing from its own mapping");
        let args = params.get(name).cloned().unwrap_or_default();
        let sink = sink.clone();
        let name = name.to_owned();
        queue.push(FetchRequest::new(name.clone(), move || {
            Box::pin(async move {
                match fetcher.call(&args).await {
                    Ok(value) => sink.insert(name, DataEntry::new(value)),
                    Err(error) => {
                        tracing::warn!(%name, %error, "prefetch failed during server render");
                        sink.insert(name, DataEntry::empty());
                    }
                }
            })
        }));
    }
}

/// The mount-time task: bind the refetch callables, then fetch every
/// dependency that was still loading after synchronous derivation.  The
/// client-side initial fetch and the retry of dependencies the server
/// failed to resolve share this path.
pub(crate) async fn run_mount_task(
    state: ArcRwSignal<PrefetchState>,
    fetchers: FetchMap,
    params: Option<ParamsFn>,
    retry: Vec<String>,
) {
    state.try_update(|current| {
        for name in fetchers.names() {
            if let Some(dep) = current.get_mut(name) {
                dep.refetch = Some(Refetch {
                    name: name.into(),
                    fetcher: fetchers
                        .get(name)
                        .expect("internal error: name missing from its own mapping"),
                    params: params.clone(),
                    state: state.clone(),
                });
            }
        }
    });
    let current_params = params.as_ref().map(|source| source()).unwrap_or_default();
    join_all(retry.into_iter().filter_map(|name| {
        let fetcher = fetchers.get(&name)?;
        let args = current_params.get(&name).cloned().unwrap_or_default();
        let state = state.clone();
        Some(async move {
            let result = fetcher.call(&args).await;
            apply_result(&state, &name, args, result);
        })
    }))
    .await;
}

/// Parameter-change transition: every dependency in the mapping re-fetches
/// with the new arguments, concurrently.
pub(crate) async fn refetch_all(
    state: ArcRwSignal<PrefetchState>,
    fetchers: FetchMap,
    params: Arc<Params>,
) {
    state.try_update(|current| {
        for name in fetchers.names() {
            if let Some(dep) = current.get_mut(name) {
                dep.loading = true;
            }
        }
    });
    let names: Vec<String> = fetchers.names().map(str::to_owned).collect();
    join_all(names.into_iter().filter_map(|name| {
        let fetcher = fetchers.get(&name)?;
        let args = params.get(&name).cloned().unwrap_or_default();
        let state = state.clone();
        Some(async move {
            let result = fetcher.call(&args).await;
            apply_result(&state, &name, args, result);
        })
    }))
    .await;
}

/// Completion transition, merged onto the state current at resolution
/// time (last write wins).  Success stores the value and clears any old
/// error; failure stores the error and leaves stale data in place.
pub(crate) fn apply_result(
    state: &ArcRwSignal<PrefetchState>,
    name: &str,
    args: Vec<Value>,
    result: Result<Value, FetchError>,
) {
    state.try_update(|current| {
        let dep = current.entry(name.to_owned()).or_default();
        dep.loading = false;
        dep.params = Some(args);
        match result {
            Ok(value) => {
                dep.data = Some(value);
                dep.error = None;
            }
            Err(error) => {
                tracing::warn!(%name, %error, "fetch failed");
                dep.error = Some(error);
            }
        }
    });
}

/// Change detection for the reactive params source.
///
/// The first observation primes the memo; later observations report a
/// change only for a structurally different value, regardless of how many
/// fresh-but-equal values are constructed in between.
#[derive(Default)]
pub(crate) struct ParamsTracker {
    memo: DeepMemo<Params>,
    last: Option<Arc<Params>>,
}

pub(crate) enum ParamsChange {
    First,
    Unchanged,
    Changed(Arc<Params>),
}

impl ParamsTracker {
    pub(crate) fn observe(&mut self, params: Params) -> ParamsChange {
        let stable = self.memo.memoize(params);
        let change = match &self.last {
            None => ParamsChange::First,
            Some(previous) if Arc::ptr_eq(previous, &stable) => ParamsChange::Unchanged,
            Some(_) => ParamsChange::Changed(Arc::clone(&stable)),
        };
        self.last = Some(stable);
        change
    }
}
