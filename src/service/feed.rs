//! Paginated community feed queries
//!
//! A [`FeedQuery`] binds one feed source to the shared page cache. Pages are
//! requested one at a time, each with the previous page's cursor, until a
//! page comes back without one.

use std::sync::Arc;

use crate::api::{self, FeedViewPost, PostView, XrpcClient};
use crate::data::{AtUri, FeedPage, InfiniteData, QueryCache, QueryKey};
use crate::error::{AppError, Result};

use super::locator::did_or_handle_uri_matches;

/// Actor community feeds, keyed `[actor]`
pub const COMMUNITY_FEED_NAMESPACE: &str = "community-feed";
/// Global community timeline, no key params
pub const COMMUNITY_TIMELINE_NAMESPACE: &str = "community-timeline";
/// Single community posts, keyed `[uri]`
pub const COMMUNITY_POST_NAMESPACE: &str = "community-post";

/// Namespaces searched for cached posts, in search order
pub const SEARCHED_NAMESPACES: &[&str] = &[COMMUNITY_FEED_NAMESPACE, COMMUNITY_TIMELINE_NAMESPACE];

/// Default number of entries per page
pub const PAGE_SIZE: u32 = 30;

/// Cache of paginated feeds
pub type FeedCache = QueryCache<InfiniteData<FeedPage>>;

/// Cache of single posts
pub type PostCache = QueryCache<PostView>;

/// Where a feed's pages come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    /// Community feed of one actor (DID or handle)
    Actor(String),
    /// Global community timeline
    Timeline,
}

impl FeedSource {
    pub fn key(&self) -> QueryKey {
        match self {
            FeedSource::Actor(actor) => QueryKey::new(COMMUNITY_FEED_NAMESPACE, [actor.as_str()]),
            FeedSource::Timeline => QueryKey::root(COMMUNITY_TIMELINE_NAMESPACE),
        }
    }

    async fn fetch_page(
        &self,
        client: &XrpcClient,
        limit: u32,
        cursor: Option<&str>,
    ) -> std::result::Result<FeedPage, crate::error::XrpcError> {
        match self {
            FeedSource::Actor(actor) => api::get_community_feed(client, actor, limit, cursor).await,
            FeedSource::Timeline => api::get_community_timeline(client, limit, cursor).await,
        }
    }
}

/// Paginated query over one community feed
pub struct FeedQuery {
    client: XrpcClient,
    cache: FeedCache,
    source: Option<FeedSource>,
    page_size: u32,
}

impl FeedQuery {
    /// Community feed of an actor; disabled while the actor is absent or empty
    pub fn community_feed(client: XrpcClient, cache: FeedCache, actor: Option<&str>) -> Self {
        Self {
            client,
            cache,
            source: actor_source(actor),
            page_size: PAGE_SIZE,
        }
    }

    /// Global community timeline
    pub fn community_timeline(client: XrpcClient, cache: FeedCache, enabled: bool) -> Self {
        Self {
            client,
            cache,
            source: enabled.then_some(FeedSource::Timeline),
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn source(&self) -> Option<&FeedSource> {
        self.source.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    fn enabled_source(&self) -> Result<&FeedSource> {
        self.source
            .as_ref()
            .ok_or_else(|| AppError::Validation("feed query is disabled".to_string()))
    }

    /// Cache key of this query
    ///
    /// # Errors
    /// Returns `AppError::Validation` if the query is disabled
    pub fn key(&self) -> Result<QueryKey> {
        Ok(self.enabled_source()?.key())
    }

    /// Fetch the next page and append it
    ///
    /// The first call requests without a cursor. Once a page omits its cursor
    /// further calls return the current data without a request. A failure
    /// leaves the cached pages untouched; calling again retries the same
    /// cursor.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if the query is disabled, or the remote
    /// error of the page request
    pub async fn fetch_next_page(&self) -> Result<Arc<InfiniteData<FeedPage>>> {
        let source = self.enabled_source()?.clone();
        let key = source.key();

        if let Some(data) = self.cache.get(&key).await {
            if !data.has_next_page() {
                return Ok(data);
            }
        }

        let client = self.client.clone();
        let limit = self.page_size;
        let label = key.clone();
        self.cache
            .fetch(&key, move |current| async move {
                let current = current.map(|data| (*data).clone()).unwrap_or_default();
                if !current.has_next_page() {
                    return Ok(current);
                }

                let cursor = current.next_page_param().map(str::to_string);
                let page = source.fetch_page(&client, limit, cursor.as_deref()).await?;
                tracing::debug!(
                    key = %label,
                    entries = page.feed.len(),
                    has_cursor = page.cursor.is_some(),
                    "Fetched community page"
                );
                Ok(current.appended(cursor, page))
            })
            .await
            .map_err(|err| {
                tracing::warn!(key = %key, error = %err, "Failed to fetch community page");
                AppError::from(err).record()
            })
    }

    /// Drop loaded pages and reload the first one
    pub async fn refetch(&self) -> Result<Arc<InfiniteData<FeedPage>>> {
        let source = self.enabled_source()?.clone();
        let key = source.key();
        self.cache.cancel(&key).await;

        let client = self.client.clone();
        let limit = self.page_size;
        self.cache
            .fetch(&key, move |_| async move {
                let page = source.fetch_page(&client, limit, None).await?;
                Ok(InfiniteData::first(page))
            })
            .await
            .map_err(|err| AppError::from(err).record())
    }

    /// Current pages, if any were loaded
    pub async fn data(&self) -> Option<Arc<InfiniteData<FeedPage>>> {
        match &self.source {
            Some(source) => self.cache.get(&source.key()).await,
            None => None,
        }
    }

    /// Feed entries of every loaded page, in order
    pub async fn items(&self) -> Vec<FeedViewPost> {
        self.data()
            .await
            .map(|data| data.entries().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether another page can be requested
    pub async fn has_next_page(&self) -> bool {
        match self.data().await {
            Some(data) => data.has_next_page(),
            None => self.is_enabled(),
        }
    }

    /// Whether a page request is in flight
    pub async fn is_fetching(&self) -> bool {
        match &self.source {
            Some(source) => self.cache.is_fetching(&source.key()).await,
            None => false,
        }
    }

    /// Switch an actor feed to another actor
    ///
    /// A request still in flight for the previous actor is cancelled and its
    /// result discarded.
    pub async fn set_subject(&mut self, actor: Option<&str>) {
        if matches!(self.source, Some(FeedSource::Timeline)) {
            return;
        }
        let next = actor_source(actor);
        if next == self.source {
            return;
        }
        if let Some(previous) = self.source.take() {
            self.cache.cancel(&previous.key()).await;
            tracing::debug!(key = %previous.key(), "Cancelled previous feed subject");
        }
        self.source = next;
    }
}

fn actor_source(actor: Option<&str>) -> Option<FeedSource> {
    actor
        .filter(|actor| !actor.is_empty())
        .map(|actor| FeedSource::Actor(actor.to_string()))
}

/// Apply `f` to every cached top-level occurrence of a post
///
/// Pages without a match are shared with the previous value.
///
/// # Returns
/// Number of entries patched
pub async fn patch_post<F>(cache: &FeedCache, uri: &AtUri, f: F) -> usize
where
    F: Fn(&PostView) -> PostView,
{
    let is_target =
        |post: &PostView| did_or_handle_uri_matches(uri, &post.uri, &post.author.handle);
    let mut patched = 0usize;

    for namespace in SEARCHED_NAMESPACES {
        for key in cache.keys_in_namespace(namespace).await {
            cache
                .update(&key, |data| {
                    let mut changed = 0usize;
                    let pages = data
                        .pages
                        .iter()
                        .map(|page| {
                            let hit = page
                                .feed
                                .iter()
                                .any(|entry| entry.post.as_ref().is_some_and(is_target));
                            if !hit {
                                return Arc::clone(page);
                            }
                            let mut next = (**page).clone();
                            for post in next.feed.iter_mut().filter_map(|e| e.post.as_mut()) {
                                if is_target(&*post) {
                                    *post = f(&*post);
                                    changed += 1;
                                }
                            }
                            Arc::new(next)
                        })
                        .collect();
                    patched += changed;
                    (changed > 0).then(|| InfiniteData {
                        pages,
                        page_params: data.page_params.clone(),
                    })
                })
                .await;
        }
    }

    tracing::debug!(uri = %uri, patched, "Patched cached posts");
    patched
}

/// Single community post, cached under `community-post/[uri]`
///
/// # Errors
/// Returns `AppError::Validation` if `uri` is absent or empty
pub async fn community_post(
    client: &XrpcClient,
    cache: &PostCache,
    uri: Option<&str>,
) -> Result<Arc<PostView>> {
    let uri = uri
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| AppError::Validation("post query is disabled".to_string()))?
        .to_string();
    let key = QueryKey::new(COMMUNITY_POST_NAMESPACE, [uri.as_str()]);

    let client = client.clone();
    cache
        .fetch(&key, move |_| async move {
            api::get_community_post(&client, &uri).await
        })
        .await
        .map_err(|err| AppError::from(err).record())
}
