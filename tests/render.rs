use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use leptos::prelude::*;
use leptos_prefetch::{
    use_prefetch, FetchError, FetchMap, Params, PrefetchData, PrefetchOptions,
    PrefetchProvider, Prefetched,
};
use serde_json::{json, Value};

#[cfg(feature = "ssr")]
mod ssr {
    use leptos::prelude::Owner;

    pub use leptos_prefetch::{
        render_with_data, render_with_data_using, DataEntry, RenderError, RenderOptions,
        SsrContext,
    };

    pub fn init_renderer() -> Owner {
        let _ = any_spawner::Executor::init_tokio();
        let owner = Owner::new();
        owner.set();
        owner
    }
}
#[cfg(feature = "ssr")]
use ssr::*;

const STORY: &str = "this is a story with id: ";
const USER_DATA: &str = "some-mockUserData";
const LOADING: &str = "Loading";
const ERROR: &str = "Error Occured";

fn news_fetchers(calls: Arc<AtomicUsize>) -> FetchMap {
    FetchMap::builder()
        .op("news", move |args: Vec<Value>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match args.first().and_then(Value::as_u64) {
                    Some(id) => Ok(json!({ "story": format!("{STORY}{id}") })),
                    None => Err(FetchError::MissingArgument("newsID".into())),
                }
            }
        })
        .build()
}

fn user_fetchers(calls: Arc<AtomicUsize>) -> FetchMap {
    FetchMap::builder()
        .op("user", move |_args: Vec<Value>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(json!(USER_DATA)) }
        })
        .build()
}

fn news_params(news_id: Option<u64>) -> Params {
    [(
        "news".to_string(),
        news_id.map(|id| vec![json!(id)]).unwrap_or_default(),
    )]
    .into_iter()
    .collect()
}

fn story_text(prefetched: &Prefetched) -> String {
    prefetched.with("news", |dep| match dep {
        Some(dep) if dep.loading => LOADING.to_string(),
        Some(dep) if dep.error.is_some() => ERROR.to_string(),
        Some(dep) => dep
            .data
            .as_ref()
            .and_then(|value| value.get("story"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    })
}

fn plain_text(prefetched: &Prefetched, name: &str) -> String {
    prefetched.with(name, |dep| match dep {
        Some(dep) if dep.loading => LOADING.to_string(),
        Some(dep) if dep.error.is_some() => ERROR.to_string(),
        Some(dep) => dep
            .data
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    })
}

#[component]
fn NewsStory(fetchers: FetchMap, news_id: Option<u64>) -> impl IntoView {
    let news = use_prefetch(
        fetchers,
        PrefetchOptions::new().params(news_params(news_id)),
    );
    view! { <p>{move || story_text(&news)}</p> }
}

#[component]
fn UserInfo(fetchers: FetchMap) -> impl IntoView {
    let user = use_prefetch(fetchers, PrefetchOptions::new());
    view! { <p>{move || plain_text(&user, "user")}</p> }
}

/// Declares both names through two hook calls in one component.
#[component]
fn Dashboard(news: FetchMap, user: FetchMap) -> impl IntoView {
    let news_state =
        use_prefetch(news, PrefetchOptions::new().params(news_params(Some(5))));
    let user_state = use_prefetch(user, PrefetchOptions::new());
    view! {
        <div>
            <p>{move || story_text(&news_state)}</p>
            <p>{move || plain_text(&user_state, "user")}</p>
        </div>
    }
}

/// The inner news component only appears once the gate data resolved, so
/// its request cannot surface before the second pass.
#[component]
fn NewsSection(gate_fetchers: FetchMap, news_fetchers: FetchMap) -> impl IntoView {
    let gate = use_prefetch(gate_fetchers, PrefetchOptions::new());
    let inner = {
        let gate = gate.clone();
        move || {
            gate.with("test", |dep| dep.and_then(|dep| dep.data.clone()))
                .map(|_| {
                    let fetchers = news_fetchers.clone();
                    view! { <NewsStory fetchers=fetchers news_id=Some(5)/> }
                })
        }
    };
    view! {
        <div>
            <p>{move || plain_text(&gate, "test")}</p>
            {inner}
        </div>
    }
}

#[component]
fn BonusInner(fetchers: FetchMap) -> impl IntoView {
    let state = use_prefetch(
        fetchers,
        PrefetchOptions::new().params(news_params(Some(5))),
    );
    view! {
        <p>{
            let state = state.clone();
            move || plain_text(&state, "bonus")
        }</p>
        <p>{move || story_text(&state)}</p>
    }
}

/// An inner provider contributing extra data on top of the ambient one.
#[component]
fn BonusSection(fetchers: FetchMap, extra: PrefetchData) -> impl IntoView {
    view! {
        <PrefetchProvider data=extra>
            <BonusInner fetchers=fetchers/>
        </PrefetchProvider>
    }
}

/// Rebuilds its data mapping every pass, so resolved values never survive
/// to the next pass and the tree can never settle.
#[component]
fn UnstableProvider(fetchers: FetchMap) -> impl IntoView {
    view! {
        <PrefetchProvider data=PrefetchData::new()>
            <NewsStory fetchers=fetchers news_id=Some(5)/>
        </PrefetchProvider>
    }
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn resolves_requests_and_fills_context() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(calls.clone());
    let context = SsrContext::new();

    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=Some(5)/> };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains(&format!("{STORY}5")));
    assert_eq!(
        context.data().value("news"),
        Some(json!({ "story": format!("{STORY}5") })),
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let requests = context.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "news");
    assert_eq!(requests[0].pass, 1);
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn failing_fetch_renders_loading_and_stores_an_empty_entry() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(calls.clone());
    let context = SsrContext::new();

    // no news id: the operation rejects
    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=None/> };
    let html = render_with_data(app, &context).await?;

    // SSR cannot block on the failure; the output reflects the loading
    // state and the empty entry lets the client retry
    assert!(html.contains(LOADING));
    assert_eq!(context.data().get("news"), Some(DataEntry::empty()));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "attempted exactly once");
    assert_eq!(context.requests().len(), 1);
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn populated_context_issues_no_requests() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(calls.clone());
    let data = PrefetchData::from_iter([(
        "news".to_string(),
        DataEntry::new(json!({ "story": "preloaded" })),
    )]);
    let context = SsrContext::with_data(data);

    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=Some(5)/> };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains("preloaded"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(context.requests().is_empty(), "settled in a single pass");
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn sibling_components_resolve_in_one_extra_pass() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let news_calls = Arc::new(AtomicUsize::new(0));
    let user_calls = Arc::new(AtomicUsize::new(0));
    let news = news_fetchers(news_calls.clone());
    let user = user_fetchers(user_calls.clone());
    let context = SsrContext::new();

    let app = move || {
        view! {
            <NewsStory fetchers=news.clone() news_id=Some(5)/>
            <UserInfo fetchers=user.clone()/>
        }
    };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains(&format!("{STORY}5")));
    assert!(html.contains(USER_DATA));
    assert_eq!(news_calls.load(Ordering::SeqCst), 1);
    assert_eq!(user_calls.load(Ordering::SeqCst), 1);
    // both requests surfaced in the first pass and were drained together
    let requests = context.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|record| record.pass == 1));
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn multiple_hooks_in_one_component() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let news_calls = Arc::new(AtomicUsize::new(0));
    let user_calls = Arc::new(AtomicUsize::new(0));
    let news = news_fetchers(news_calls.clone());
    let user = user_fetchers(user_calls.clone());
    let context = SsrContext::new();

    let app = move || view! { <Dashboard news=news.clone() user=user.clone()/> };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains(&format!("{STORY}5")));
    assert!(html.contains(USER_DATA));
    assert_eq!(context.requests().len(), 2);
    assert_eq!(
        context.data().value("user"),
        Some(json!(USER_DATA)),
    );
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn nested_components_request_across_passes() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let gate_calls = Arc::new(AtomicUsize::new(0));
    let news_calls = Arc::new(AtomicUsize::new(0));
    let gate = {
        let calls = gate_calls.clone();
        FetchMap::builder()
            .op("test", move |_args: Vec<Value>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!("somedata")) }
            })
            .build()
    };
    let news = news_fetchers(news_calls.clone());
    let context = SsrContext::new();

    let app =
        move || view! { <NewsSection gate_fetchers=gate.clone() news_fetchers=news.clone()/> };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains("somedata"));
    assert!(html.contains(&format!("{STORY}5")));
    assert_eq!(gate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(news_calls.load(Ordering::SeqCst), 1);
    // the inner request could only surface once the gate data existed
    let requests = context.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!((requests[0].name.as_str(), requests[0].pass), ("test", 1));
    assert_eq!((requests[1].name.as_str(), requests[1].pass), ("news", 2));
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn nested_provider_contributes_data_without_severing_tracking() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let bonus_calls = Arc::new(AtomicUsize::new(0));
    let news_calls = Arc::new(AtomicUsize::new(0));
    let fetchers = {
        let bonus_calls = bonus_calls.clone();
        let news_calls = news_calls.clone();
        FetchMap::builder()
            .op("bonus", move |_args: Vec<Value>| {
                bonus_calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!("fetched-bonus")) }
            })
            .op("news", move |args: Vec<Value>| {
                news_calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    args.first()
                        .and_then(Value::as_u64)
                        .map(|id| json!({ "story": format!("{STORY}{id}") }))
                        .ok_or_else(|| FetchError::MissingArgument("newsID".into()))
                }
            })
            .build()
    };
    // stable across passes: created outside the render closure
    let extra =
        PrefetchData::from_iter([("bonus".to_string(), DataEntry::new(json!("provided-bonus")))]);
    let context = SsrContext::new();

    let app = {
        let extra = extra.clone();
        move || view! { <BonusSection fetchers=fetchers.clone() extra=extra.clone()/> }
    };
    let html = render_with_data(app, &context).await?;

    // the nested provider's data answered "bonus" outright
    assert!(html.contains("provided-bonus"));
    assert_eq!(bonus_calls.load(Ordering::SeqCst), 0);
    // "news" was fetched, and its result landed in the data mapping the
    // declaring hook observed: the nested one
    assert!(html.contains(&format!("{STORY}5")));
    assert_eq!(extra.value("news"), Some(json!({ "story": format!("{STORY}5") })));
    assert!(context.data().is_empty());
    // while request tracking stayed with the ancestor context
    let requests = context.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "news");
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn unstable_data_mapping_hits_the_pass_limit() {
    let _owner = init_renderer();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(calls.clone());
    let context = SsrContext::new();

    let app = move || view! { <UnstableProvider fetchers=fetchers.clone()/> };
    let err = render_with_data_using(
        app,
        &context,
        |view| view.to_html(),
        RenderOptions { max_passes: 3 },
    )
    .await
    .expect_err("the mapping can never settle");

    assert_eq!(
        err,
        RenderError::PassLimitExceeded {
            passes: 3,
            outstanding: vec!["news".to_string()],
        },
    );
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn injected_render_capability_is_used() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let fetchers = news_fetchers(Arc::new(AtomicUsize::new(0)));
    let context = SsrContext::new();

    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=Some(5)/> };
    let html = render_with_data_using(
        app,
        &context,
        |view| format!("<!doctype html>{}", view.to_html()),
        RenderOptions::default(),
    )
    .await?;

    assert!(html.starts_with("<!doctype html>"));
    assert!(html.contains(&format!("{STORY}5")));
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn serialized_hand_off_hydrates_a_second_render_for_free() -> anyhow::Result<()> {
    let _owner = init_renderer();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(first_calls.clone());
    let context = SsrContext::new();
    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=Some(5)/> };
    render_with_data(app, &context).await?;
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);

    // what a server would ship to the client
    let payload = serde_json::to_string(&context.data())?;

    let restored: PrefetchData = serde_json::from_str(&payload)?;
    let second_calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(second_calls.clone());
    let context = SsrContext::with_data(restored);
    let app = move || view! { <NewsStory fetchers=fetchers.clone() news_id=Some(5)/> };
    let html = render_with_data(app, &context).await?;

    assert!(html.contains(&format!("{STORY}5")));
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert!(context.requests().is_empty());
    Ok(())
}

#[cfg(feature = "ssr")]
#[tokio::test]
async fn without_a_provider_the_hook_is_client_only() {
    let _owner = init_renderer();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetchers = news_fetchers(calls.clone());

    // rendered directly, with no provider and no renderer loop
    let html = view! { <NewsStory fetchers=fetchers news_id=Some(5)/> }.to_html();

    assert!(html.contains(LOADING));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "nothing fetched during SSR");
}
