//! Service layer
//!
//! Query logic on top of the API and data layers: paginated feeds,
//! hydration and moderation, the cross-cache locator, trends and
//! Open Collective linking.

pub mod feed;
pub mod hydration;
pub mod locator;
pub mod moderation;
mod open_collective;
mod trending;

pub use feed::{FeedCache, FeedQuery, FeedSource, PostCache, community_post, patch_post};
pub use hydration::{HydratedPost, HydrationMemo, hydrate};
pub use locator::{FindPosts, find_all_posts_in_query_data, locate_posts};
pub use moderation::{
    LabelVisibility, ModerationCause, ModerationDecision, ModerationOpts, ModerationPrefs,
    has_muted_word, moderate_post,
};
pub use open_collective::{OC_LINK_STATUS_NAMESPACE, OpenCollectiveService};
pub use trending::{TRENDING_TOPICS_NAMESPACE, TRENDS_NAMESPACE, TrendingService};
