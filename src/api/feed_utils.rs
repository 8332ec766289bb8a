//! Feed request helpers

use super::dto::{GetPreferencesOutput, PreferenceItem};

/// Header carrying the viewer's interests to the appview
pub const TOPICS_HEADER: &str = "X-Bsky-Topics";

/// `X-Bsky-Topics` header; a non-empty debug override wins over interests
pub fn create_topics_header(
    debug_topics: Option<&str>,
    user_interests: Option<&str>,
) -> (&'static str, String) {
    let value = debug_topics
        .filter(|topics| !topics.is_empty())
        .or(user_interests)
        .unwrap_or_default();
    (TOPICS_HEADER, value.to_string())
}

/// Comma-joined interest tags from the viewer's preferences
pub fn aggregate_user_interests(preferences: Option<&GetPreferencesOutput>) -> String {
    preferences
        .into_iter()
        .flat_map(|prefs| prefs.preferences.iter())
        .find_map(|item| match item {
            PreferenceItem::Interests { tags } => Some(tags.join(",")),
            _ => None,
        })
        .unwrap_or_default()
}
