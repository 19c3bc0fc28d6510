use leptos::{
    children::Children,
    component,
    context::{use_context, Provider},
    view, IntoView,
};

use crate::context::{PrefetchContext, PrefetchData, RequestQueue};

/// Provides prefetched data and request tracking to descendant hooks.
///
/// When nested under another `PrefetchProvider`, the value exposed to
/// descendants is this provider's fields shallow-merged on top of the
/// nearest ancestor's: a field supplied here wins, an omitted one is
/// inherited.  An inner subtree can therefore supply additional initial
/// data while its fetch requests keep flowing into the ancestor-level
/// queue.
///
/// On the client, supply the deserialized hand-off mapping as `data` and
/// omit `requests`; the server-side renderer injects both itself.
///
/// ```
/// use leptos::prelude::*;
/// use leptos_prefetch::{PrefetchData, PrefetchProvider};
///
/// #[component]
/// fn App(data: PrefetchData) -> impl IntoView {
///     view! {
///         <PrefetchProvider data=data>
///             <p>"descendants read the merged context here"</p>
///         </PrefetchProvider>
///     }
/// }
/// ```
#[component]
pub fn PrefetchProvider(
    /// Prefetched data entries made visible to descendant hooks.
    #[prop(optional)]
    data: Option<PrefetchData>,
    /// Pending-request list for server-side bookkeeping.
    #[prop(optional)]
    requests: Option<RequestQueue>,
    children: Children,
) -> impl IntoView {
    let ancestor = use_context::<PrefetchContext>().unwrap_or_default();
    let value = PrefetchContext { data, requests }.merged_onto(&ancestor);
    view! { <Provider value=value>{children()}</Provider> }
}
