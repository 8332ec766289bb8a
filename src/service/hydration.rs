//! Hydration layer
//!
//! Turns server-hydrated feed entries into display-ready posts with a
//! decoded record and a moderation decision.

use std::sync::Arc;

use super::moderation::{ModerationDecision, ModerationOpts, moderate_post};
use crate::api::{FeedViewPost, PostRecord, PostView};
use crate::data::{FeedPage, InfiniteData};

/// Post ready for display
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedPost {
    pub post: PostView,
    pub record: PostRecord,
    pub moderation: ModerationDecision,
}

/// Hydrate feed entries against one moderation snapshot
///
/// Entries without a post are dropped. Returns nothing until moderation
/// options are available.
pub fn hydrate<'a, I>(entries: I, opts: Option<&ModerationOpts>) -> Vec<HydratedPost>
where
    I: IntoIterator<Item = &'a FeedViewPost>,
{
    let Some(opts) = opts else {
        return Vec::new();
    };

    entries
        .into_iter()
        .filter_map(|entry| entry.post.as_ref())
        .map(|post| HydratedPost {
            record: PostRecord::from_value(&post.record),
            moderation: moderate_post(post, opts),
            post: post.clone(),
        })
        .collect()
}

/// Memoized hydration of a paginated feed
///
/// The result is reused while both the feed value and the options are the
/// same allocations; either one being replaced triggers recomputation.
#[derive(Default)]
pub struct HydrationMemo {
    last: Option<MemoEntry>,
}

struct MemoEntry {
    data: Arc<InfiniteData<FeedPage>>,
    opts: Option<Arc<ModerationOpts>>,
    result: Arc<Vec<HydratedPost>>,
}

impl HydrationMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrated posts of every page, recomputed only when an input changed
    pub fn hydrate(
        &mut self,
        data: &Arc<InfiniteData<FeedPage>>,
        opts: Option<&Arc<ModerationOpts>>,
    ) -> Arc<Vec<HydratedPost>> {
        if let Some(last) = &self.last {
            let same_opts = match (&last.opts, opts) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if Arc::ptr_eq(&last.data, data) && same_opts {
                return Arc::clone(&last.result);
            }
        }

        let result = Arc::new(hydrate(data.entries(), opts.map(Arc::as_ref)));
        tracing::debug!(posts = result.len(), "Hydrated feed");
        self.last = Some(MemoEntry {
            data: Arc::clone(data),
            opts: opts.cloned(),
            result: Arc::clone(&result),
        });
        result
    }
}
