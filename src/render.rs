//! The iterative server-side renderer.
//!
//! Available with the `ssr` feature.  [`render_with_data`] drives the
//! re-render loop described in the crate documentation: render the tree
//! synchronously, drain the fetch requests the pass produced, resolve them
//! all concurrently, render again, and stop at the first pass that
//! produces no request.  Termination follows from the hook's request
//! discipline: a descriptor always leaves an entry in the shared data —
//! empty on failure — and the hook never requests a name that has an
//! entry, so the set of outstanding names shrinks every pass.  A bounded
//! pass limit guards against fetch mappings that break that discipline by
//! writing into data that does not survive to the next pass.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use leptos::prelude::*;

use crate::{
    component::PrefetchProvider,
    context::{FetchRequest, PrefetchData, RequestQueue},
};

/// A record of one fetch request issued during [`render_with_data`],
/// tagged with the render pass that issued it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub name: String,
    pub pass: usize,
}

/// Caller-owned bookkeeping for one server render invocation.
///
/// Create one per request, hand it to [`render_with_data`], and serialize
/// [`data`](SsrContext::data) afterwards as the hydration hand-off.  The
/// data mapping is mutated in place across render passes; the request log
/// is an audit trail of every request issued across all passes.
#[derive(Clone, Default)]
pub struct SsrContext {
    data: PrefetchData,
    requests: Arc<Mutex<Vec<RequestRecord>>>,
}

impl SsrContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing data mapping, for example one carried over
    /// from an earlier render of the same request.
    pub fn with_data(data: PrefetchData) -> Self {
        Self {
            data,
            requests: Arc::default(),
        }
    }

    /// Handle to the hand-off data mapping.
    pub fn data(&self) -> PrefetchData {
        self.data.clone()
    }

    /// Snapshot of the request audit trail.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.lock().clone()
    }

    fn record(&self, pass: usize, names: Vec<String>) {
        self.lock()
            .extend(names.into_iter().map(|name| RequestRecord { name, pass }));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RequestRecord>> {
        self.requests
            .lock()
            .expect("internal error: request log lock poisoned")
    }
}

impl std::fmt::Debug for SsrContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsrContext")
            .field("data", &self.data)
            .field("requests", &self.requests())
            .finish()
    }
}

/// Renderer configuration.
#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    /// Upper bound on render passes before giving up with
    /// [`RenderError::PassLimitExceeded`].  Generous by default (32); a
    /// well-behaved tree settles in one pass more than its deepest chain
    /// of data-revealed nesting.
    pub max_passes: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { max_passes: 32 }
    }
}

/// Failure of the render loop itself.
///
/// Individual fetch failures are not render failures: a failed descriptor
/// still resolves, leaving an empty hand-off entry for the client to
/// retry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// The pass limit was reached while passes were still producing
    /// requests.  The offending dependency names are included; the usual
    /// cause is a provider whose data mapping is rebuilt every pass, so
    /// resolved values never survive to the next one.
    #[error("render did not settle after {passes} passes; still requesting {outstanding:?}")]
    PassLimitExceeded {
        passes: usize,
        outstanding: Vec<String>,
    },
}

/// Render `app` to HTML, resolving every prefetch request it produces.
///
/// Renders the tree wrapped in a [`PrefetchProvider`] carrying the
/// context's data and a fresh request queue, repeatedly, until a pass
/// produces no request; the resolved values are left in `context` for
/// serialization.  All requests collected in one pass are resolved
/// concurrently, and a pass only begins after every request of the
/// previous pass has settled.
pub async fn render_with_data<F, V>(app: F, context: &SsrContext) -> Result<String, RenderError>
where
    F: Fn() -> V + Send + Sync + 'static,
    V: IntoView + 'static,
{
    render_with_data_using(app, context, |view| view.to_html(), RenderOptions::default()).await
}

/// [`render_with_data`] with an injected render capability and renderer
/// configuration.
///
/// `render` must be synchronous and pure with respect to the tree's
/// declared output; the default is `AnyView::to_html`.
pub async fn render_with_data_using<F, V, R>(
    app: F,
    context: &SsrContext,
    render: R,
    options: RenderOptions,
) -> Result<String, RenderError>
where
    F: Fn() -> V + Send + Sync + 'static,
    V: IntoView + 'static,
    R: Fn(AnyView) -> String,
{
    let app = Arc::new(app);
    let mut pass = 0;
    loop {
        pass += 1;
        let queue = RequestQueue::new();
        let html = {
            // A fresh owner per pass, so every pass rebuilds the tree's
            // state from the shared data alone, exactly like a fresh
            // request would.
            let owner = Owner::new();
            owner.set();
            let data = context.data();
            let pass_queue = queue.clone();
            let app = Arc::clone(&app);
            let view = view! {
                <PrefetchProvider data=data requests=pass_queue>
                    {(*app)()}
                </PrefetchProvider>
            };
            render(view.into_any())
        };
        let drained = queue.drain();
        if drained.is_empty() {
            tracing::debug!(pass, "render settled");
            return Ok(html);
        }
        let names: Vec<String> = drained
            .iter()
            .map(|request| request.name().to_owned())
            .collect();
        tracing::debug!(pass, requests = names.len(), "resolving prefetch requests");
        if pass >= options.max_passes {
            tracing::warn!(pass, ?names, "render pass limit exceeded");
            return Err(RenderError::PassLimitExceeded {
                passes: pass,
                outstanding: names,
            });
        }
        join_all(drained.into_iter().map(FetchRequest::invoke)).await;
        context.record(pass, names);
    }
}
