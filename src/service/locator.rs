//! Cross-cache post locator
//!
//! Finds every cached occurrence of a post, top-level or quoted, across the
//! community feed queries. Used to patch cached posts after a mutation.

use std::borrow::Cow;
use std::sync::Arc;

use crate::api::{EmbedView, EmbeddedRecord, FeedViewPost, PostView, ViewRecord};
use crate::data::{AtUri, FeedPage, InfiniteData, QueryCache, QueryKey};

use super::feed::SEARCHED_NAMESPACES;

/// Cached feed queries, grouped by namespace in search order
pub type FeedSnapshot = [(QueryKey, Arc<InfiniteData<FeedPage>>)];

/// Whether a post URI and author identify the target
///
/// A DID authority must match the full URI. A handle authority must match
/// the author's handle and the collection/rkey path.
pub fn did_or_handle_uri_matches(target: &AtUri, uri: &str, author_handle: &str) -> bool {
    if target.is_did_authority() {
        return uri == target.to_string();
    }
    target.host().eq_ignore_ascii_case(author_handle)
        && AtUri::parse(uri).is_ok_and(|candidate| candidate.path() == target.path())
}

/// Quoted record of a record or record-with-media embed
pub fn get_embedded_post(embed: Option<&EmbedView>) -> Option<&ViewRecord> {
    let record = match embed? {
        EmbedView::Record(view) => &view.record,
        EmbedView::RecordWithMedia(view) => &view.record.record,
        _ => return None,
    };
    match record {
        EmbeddedRecord::ViewRecord(view) => Some(view),
        _ => None,
    }
}

/// Rebuild a post view from a quoted record
pub fn embed_view_record_to_post_view(view: &ViewRecord) -> PostView {
    PostView {
        uri: view.uri.clone(),
        cid: view.cid.clone(),
        author: view.author.clone(),
        record: view.value.clone(),
        embed: view.embeds.first().cloned(),
        reply_count: view.reply_count,
        repost_count: view.repost_count,
        like_count: view.like_count,
        quote_count: view.quote_count,
        indexed_at: view.indexed_at.clone(),
        viewer: None,
        labels: view.labels.clone(),
    }
}

/// Iterator over cached occurrences of one post
///
/// Top-level posts are borrowed from the snapshot; quoted posts are rebuilt.
#[derive(Clone)]
pub struct FindPosts<'a> {
    snapshot: &'a FeedSnapshot,
    target: AtUri,
    query: usize,
    page: usize,
    entry: usize,
    pending: Option<PostView>,
}

impl<'a> FindPosts<'a> {
    fn next_entry(&mut self) -> Option<&'a FeedViewPost> {
        let snapshot = self.snapshot;
        loop {
            let (_, data) = snapshot.get(self.query)?;
            let Some(page) = data.pages.get(self.page) else {
                self.query += 1;
                self.page = 0;
                self.entry = 0;
                continue;
            };
            let Some(entry) = page.feed.get(self.entry) else {
                self.page += 1;
                self.entry = 0;
                continue;
            };
            self.entry += 1;
            return Some(entry);
        }
    }

    fn matches(&self, uri: &str, handle: &str) -> bool {
        did_or_handle_uri_matches(&self.target, uri, handle)
    }
}

impl<'a> Iterator for FindPosts<'a> {
    type Item = Cow<'a, PostView>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(quoted) = self.pending.take() {
            return Some(Cow::Owned(quoted));
        }

        while let Some(entry) = self.next_entry() {
            let Some(post) = entry.post.as_ref() else {
                continue;
            };

            let quoted = get_embedded_post(post.embed.as_ref())
                .filter(|view| self.matches(&view.uri, &view.author.handle))
                .map(embed_view_record_to_post_view);

            if self.matches(&post.uri, &post.author.handle) {
                self.pending = quoted;
                return Some(Cow::Borrowed(post));
            }
            if let Some(quoted) = quoted {
                return Some(Cow::Owned(quoted));
            }
        }
        None
    }
}

/// Every cached occurrence of `uri` in a snapshot
///
/// Scans queries, pages and entries in order; for each entry the post comes
/// before its quoted post.
pub fn find_all_posts_in_query_data<'a>(snapshot: &'a FeedSnapshot, uri: &AtUri) -> FindPosts<'a> {
    FindPosts {
        snapshot,
        target: uri.clone(),
        query: 0,
        page: 0,
        entry: 0,
        pending: None,
    }
}

/// Snapshot of the community feed queries in search order
pub async fn snapshot_feeds(
    cache: &QueryCache<InfiniteData<FeedPage>>,
) -> Vec<(QueryKey, Arc<InfiniteData<FeedPage>>)> {
    cache.snapshot_namespaces(SEARCHED_NAMESPACES).await
}

/// Owned copies of every cached occurrence of `uri`
pub async fn locate_posts(
    cache: &QueryCache<InfiniteData<FeedPage>>,
    uri: &AtUri,
) -> Vec<PostView> {
    let snapshot = snapshot_feeds(cache).await;
    find_all_posts_in_query_data(&snapshot, uri)
        .map(Cow::into_owned)
        .collect()
}
