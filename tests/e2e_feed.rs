//! E2E tests for community feed queries, the query cache and the locator

mod common;

use std::sync::atomic::Ordering;

use common::{
    DID, HANDLE, MockNetwork, SECOND_PAGE_CURSOR, TIMELINE_PAGES, post_json, post_uri, quote_json,
};
use community_feed::data::AtUri;
use community_feed::service::{HydrationMemo, ModerationOpts, locate_posts, patch_post};
use tempfile::TempDir;

#[tokio::test]
async fn test_timeline_pages_until_cursor_runs_out() {
    let network = MockNetwork::start().await;
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let query = app.timeline_query().await;

    let first = query.fetch_next_page().await.unwrap();
    assert_eq!(first.entries().count(), TIMELINE_PAGES[0]);
    assert!(first.has_next_page());

    let second = query.fetch_next_page().await.unwrap();
    assert_eq!(second.entries().count(), 42);
    assert!(!second.has_next_page());
    assert_eq!(query.items().await.len(), 42);

    // exhausted: no further request
    query.fetch_next_page().await.unwrap();
    assert_eq!(network.state.timeline_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_page_is_retried_with_the_same_cursor() {
    let network = MockNetwork::start().await;
    *network.state.fail_cursor_once.lock().unwrap() = Some(SECOND_PAGE_CURSOR.to_string());
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let query = app.timeline_query().await;

    query.fetch_next_page().await.unwrap();
    let err = query.fetch_next_page().await.unwrap_err();
    assert!(err.to_string().contains("502"));

    // the failure leaves the loaded page in place
    let data = query.data().await.unwrap();
    assert_eq!(data.pages.len(), 1);
    assert!(data.has_next_page());

    let retried = query.fetch_next_page().await.unwrap();
    assert_eq!(retried.entries().count(), 42);
    assert_eq!(
        retried.page_params,
        vec![None, Some(SECOND_PAGE_CURSOR.to_string())]
    );
    assert_eq!(
        *network.state.timeline_cursors.lock().unwrap(),
        vec![
            None,
            Some(SECOND_PAGE_CURSOR.to_string()),
            Some(SECOND_PAGE_CURSOR.to_string()),
        ]
    );
}

#[tokio::test]
async fn test_refetch_replaces_pages_and_discards_in_flight_page() {
    let network = MockNetwork::start().await;
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let query = app.timeline_query().await;

    query.fetch_next_page().await.unwrap();
    assert_eq!(query.fetch_next_page().await.unwrap().pages.len(), 2);

    let refreshed = query.refetch().await.unwrap();
    assert_eq!(refreshed.pages.len(), 1);
    assert_eq!(refreshed.entries().count(), TIMELINE_PAGES[0]);
    assert!(refreshed.has_next_page());

    // a next-page request still in flight when the refetch starts is dropped
    network.state.timeline_delay_ms.store(150, Ordering::SeqCst);
    let (late, fresh) = tokio::join!(query.fetch_next_page(), async {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        query.refetch().await
    });
    assert_eq!(late.unwrap().pages.len(), 2);
    let fresh = fresh.unwrap();

    let data = query.data().await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&data, &fresh));
    assert_eq!(data.pages.len(), 1);
    assert_eq!(query.items().await.len(), TIMELINE_PAGES[0]);
    assert!(!query.is_fetching().await);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let network = MockNetwork::start().await;
    network.state.timeline_delay_ms.store(100, Ordering::SeqCst);
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let query = app.timeline_query().await;
    let other = app.timeline_query().await;

    let (a, b) = tokio::join!(query.fetch_next_page(), other.fetch_next_page());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(network.state.timeline_requests.load(Ordering::SeqCst), 1);
    assert_eq!(a.entries().count(), TIMELINE_PAGES[0]);
    assert!(std::sync::Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn test_cancelled_fetch_does_not_write_late_result() {
    let network = MockNetwork::start().await;
    network.state.timeline_delay_ms.store(150, Ordering::SeqCst);
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let query = app.timeline_query().await;
    let key = query.key().unwrap();

    let feeds = app.feeds.clone();
    let cancel_key = key.clone();
    let (_late, ()) = tokio::join!(query.fetch_next_page(), async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        feeds.cancel(&cancel_key).await;
    });

    assert!(app.feeds.get(&key).await.is_none());
    assert!(!app.feeds.is_fetching(&key).await);
}

#[tokio::test]
async fn test_locator_finds_post_in_feed_and_timeline() {
    let network = MockNetwork::start().await;
    let target = post_json(DID, HANDLE, "target", "hello community");
    let quoting = quote_json("did:plc:carol", "carol.test", "quote", &target);
    network
        .state
        .actor_feeds
        .lock()
        .unwrap()
        .insert(HANDLE.to_string(), vec![target.clone()]);
    network
        .state
        .timeline_head
        .lock()
        .unwrap()
        .extend([target.clone(), quoting]);

    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    app.feed_query(Some(HANDLE)).await.fetch_next_page().await.unwrap();
    app.timeline_query().await.fetch_next_page().await.unwrap();

    let uri = AtUri::parse(&post_uri(DID, "target")).unwrap();
    let found = locate_posts(&app.feeds, &uri).await;
    // feed entry, timeline entry, then the quoted copy in the timeline
    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|post| post.uri == post_uri(DID, "target")));
    assert!(found.iter().all(|post| post.author.handle == HANDLE));

    // handle-form URIs match too
    let by_handle = AtUri::parse(&format!("at://{HANDLE}/app.bsky.feed.post/target")).unwrap();
    assert_eq!(locate_posts(&app.feeds, &by_handle).await.len(), 3);

    let missing = AtUri::parse(&post_uri(DID, "nope")).unwrap();
    assert!(locate_posts(&app.feeds, &missing).await.is_empty());
}

#[tokio::test]
async fn test_patch_post_updates_every_cached_copy() {
    let network = MockNetwork::start().await;
    let target = post_json(DID, HANDLE, "liked", "like me");
    network
        .state
        .actor_feeds
        .lock()
        .unwrap()
        .insert(HANDLE.to_string(), vec![target.clone()]);
    network.state.timeline_head.lock().unwrap().push(target);

    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let feed = app.feed_query(Some(HANDLE)).await;
    feed.fetch_next_page().await.unwrap();
    app.timeline_query().await.fetch_next_page().await.unwrap();

    let uri = AtUri::parse(&post_uri(DID, "liked")).unwrap();
    let patched = patch_post(&app.feeds, &uri, |post| {
        let mut post = post.clone();
        post.like_count = Some(1);
        post
    })
    .await;
    assert_eq!(patched, 2);

    let found = locate_posts(&app.feeds, &uri).await;
    assert!(found.iter().all(|post| post.like_count == Some(1)));
}

#[tokio::test]
async fn test_hydration_is_memoized_per_data_and_options() {
    let network = MockNetwork::start().await;
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;
    let data = app.timeline_query().await.fetch_next_page().await.unwrap();

    let opts = std::sync::Arc::new(ModerationOpts::default());
    let mut memo = HydrationMemo::new();
    let first = memo.hydrate(&data, Some(&opts));
    let second = memo.hydrate(&data, Some(&opts));

    assert_eq!(first.len(), TIMELINE_PAGES[0]);
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(memo.hydrate(&data, None).is_empty());
}

#[tokio::test]
async fn test_disabled_feed_query_does_not_request() {
    let network = MockNetwork::start().await;
    let temp_dir = TempDir::new().unwrap();
    let app = network.app(&temp_dir).await;

    let query = app.feed_query(Some("")).await;
    assert!(!query.is_enabled());
    assert!(query.fetch_next_page().await.is_err());
}
