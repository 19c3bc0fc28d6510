//! This crate provides named, declarative data prefetching for the Leptos
//! Rust web framework, unifying server-side rendering (SSR) and client-side
//! hydration.  A component declares its asynchronous data dependencies once
//! through the [`use_prefetch`] hook; during SSR the provided iterative
//! renderer collects the fetch requests those declarations produce, resolves
//! them, and re-renders until the view tree settles, while on the client the
//! same declarations reuse the handed-off data without fetching again.
//!
//! ## Use case
//!
//! A component that needs remote data typically cannot have that data by the
//! time the server renders it, because rendering is synchronous and the data
//! is behind an async call.  The usual workarounds either hoist all fetching
//! out of the tree (losing the locality of the declaration) or accept a
//! client-only fetch (losing SSR of the data entirely).
//!
//! Here, the fetch declaration stays inside the component.  The hook reads
//! the nearest [`PrefetchContext`] and decides, per named dependency,
//! whether to reuse server-known data, skip fetching (`lazy`), or fetch.
//! Under SSR it also appends a deferred fetch descriptor to the context's
//! request queue, synchronously, during the render pass; the renderer
//! drains and resolves the queue after each pass and re-renders, so that a
//! pass eventually finds every dependency already answered and the loop
//! terminates.  The accumulated data mapping is then serialized, shipped to
//! the client, and supplied through [`PrefetchProvider`], where the very
//! same hook invocations find their data and start in the resolved state.
//!
//! # Example
//!
//! ```
//! use leptos::prelude::*;
//! use leptos_prefetch::{
//!     use_prefetch, FetchError, FetchMap, Params, PrefetchOptions,
//! };
//! use serde_json::{json, Value};
//!
//! fn news_fetchers() -> FetchMap {
//!     FetchMap::builder()
//!         .op("news", |args: Vec<Value>| async move {
//!             match args.first().and_then(Value::as_u64) {
//!                 Some(id) => Ok(json!({ "story": format!("story #{id}") })),
//!                 None => Err(FetchError::MissingArgument("newsID".into())),
//!             }
//!         })
//!         .build()
//! }
//!
//! #[component]
//! fn NewsStory(news_id: u64) -> impl IntoView {
//!     let params: Params = [("news".to_string(), vec![json!(news_id)])]
//!         .into_iter()
//!         .collect();
//!     let news = use_prefetch(
//!         news_fetchers(),
//!         PrefetchOptions::new().params(params),
//!     );
//!     view! {
//!         <p>
//!             {move || news.with("news", |dep| match dep {
//!                 Some(dep) if dep.loading => "loading".to_string(),
//!                 Some(dep) if dep.error.is_some() => "failed".to_string(),
//!                 Some(dep) => dep
//!                     .data
//!                     .as_ref()
//!                     .and_then(|v| v.get("story"))
//!                     .and_then(Value::as_str)
//!                     .unwrap_or_default()
//!                     .to_string(),
//!                 None => String::new(),
//!             })}
//!         </p>
//!     }
//! }
//! ```
//!
//! On the server, the tree is rendered through [`render_with_data`]
//! (requires the `ssr` feature), which owns the re-render loop and leaves
//! the fetched results in the caller-supplied [`SsrContext`] for
//! serialization.  On the client, deserialize that mapping back into a
//! [`PrefetchData`] and hand it to [`PrefetchProvider`] above the tree;
//! dependencies the server could not resolve are retried through the
//! normal client-side fetch path after mount.
//!
//! [`SsrContext`]: crate::render::SsrContext
//!
//! # Feature Flags
#![cfg_attr(
    feature = "document-features",
    cfg_attr(doc, doc = ::document_features::document_features!())
)]

pub mod component;
mod context;
pub mod fetch;
pub mod hook;
mod memo;
#[cfg(feature = "ssr")]
pub mod render;


pub use component::PrefetchProvider;
pub use context::{
    DataEntry, FetchRequest, PrefetchContext, PrefetchData, RequestQueue,
};
pub use fetch::{
    FetchError, FetchFn, FetchFuture, FetchMap, FetchMapBuilder, Params,
};
pub use hook::{
    use_prefetch, DepState, PrefetchOptions, PrefetchState, Prefetched, Refetch,
};
pub use memo::DeepMemo;
#[cfg(feature = "ssr")]
pub use render::{
    render_with_data, render_with_data_using, RenderError, RenderOptions,
    RequestRecord, SsrContext,
};
