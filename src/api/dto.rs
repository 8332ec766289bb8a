//! Lexicon DTOs
//!
//! Wire types for the `app.bsky.*`, `com.atproto.*` and community
//! endpoints this client reads. Union members are tagged by `$type`;
//! shapes this client does not understand decode as `Unknown`/`Other`
//! instead of failing the whole response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};

/// Decode an optional field, treating a malformed value as absent
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

/// Decode a list, dropping members that fail to decode
pub(crate) fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}

// =============================================================================
// Actors
// =============================================================================

/// `app.bsky.actor.defs#profileViewBasic`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileViewBasic {
    pub did: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub viewer: Option<ActorViewerState>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub labels: Vec<Label>,
}

/// `app.bsky.actor.defs#viewerState`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorViewerState {
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub blocked_by: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followed_by: Option<String>,
}

/// `com.atproto.label.defs#label`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(default)]
    pub neg: bool,
    #[serde(default)]
    pub cts: String,
}

// =============================================================================
// Posts
// =============================================================================

/// `app.bsky.feed.defs#postView`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: ProfileViewBasic,
    /// Raw `app.bsky.feed.post` record
    #[serde(default)]
    pub record: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub embed: Option<EmbedView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_count: Option<i64>,
    #[serde(default)]
    pub indexed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub viewer: Option<PostViewerState>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub labels: Vec<Label>,
}

/// `app.bsky.feed.defs#viewerState`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostViewerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost: Option<String>,
    #[serde(default)]
    pub thread_muted: bool,
}

/// `app.bsky.feed.post` record, decoded from `PostView::record`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostRecord {
    pub text: String,
    pub created_at: String,
    pub langs: Vec<String>,
    pub tags: Vec<String>,
    pub facets: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<serde_json::Value>,
}

impl PostRecord {
    /// Decode a raw record, falling back to an empty record
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Tags from the record itself and from `#tag` facets
    pub fn all_tags(&self) -> Vec<String> {
        let facet_tags = self
            .facets
            .iter()
            .filter_map(|facet| facet.get("features")?.as_array())
            .flatten()
            .filter(|feature| {
                feature.get("$type").and_then(|t| t.as_str())
                    == Some("app.bsky.richtext.facet#tag")
            })
            .filter_map(|feature| feature.get("tag")?.as_str().map(str::to_string));

        self.tags.iter().cloned().chain(facet_tags).collect()
    }
}

// =============================================================================
// Embeds
// =============================================================================

/// Embed view attached to a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum EmbedView {
    #[serde(rename = "app.bsky.embed.record#view")]
    Record(RecordEmbedView),
    #[serde(rename = "app.bsky.embed.recordWithMedia#view")]
    RecordWithMedia(RecordWithMediaView),
    #[serde(rename = "app.bsky.embed.images#view")]
    Images(ImagesView),
    #[serde(rename = "app.bsky.embed.external#view")]
    External(ExternalView),
    #[serde(other)]
    Unknown,
}

/// `app.bsky.embed.record#view`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEmbedView {
    pub record: EmbeddedRecord,
}

/// `app.bsky.embed.recordWithMedia#view`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordWithMediaView {
    pub record: RecordEmbedView,
    #[serde(default)]
    pub media: serde_json::Value,
}

/// Record referenced by a record embed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum EmbeddedRecord {
    #[serde(rename = "app.bsky.embed.record#viewRecord")]
    ViewRecord(Box<ViewRecord>),
    #[serde(rename = "app.bsky.embed.record#viewNotFound")]
    NotFound { uri: String },
    #[serde(rename = "app.bsky.embed.record#viewBlocked")]
    Blocked { uri: String },
    #[serde(rename = "app.bsky.embed.record#viewDetached")]
    Detached { uri: String },
    #[serde(other)]
    Other,
}

/// `app.bsky.embed.record#viewRecord`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRecord {
    pub uri: String,
    pub cid: String,
    pub author: ProfileViewBasic,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repost_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub embeds: Vec<EmbedView>,
    #[serde(default)]
    pub indexed_at: String,
}

/// `app.bsky.embed.images#view`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesView {
    #[serde(default)]
    pub images: Vec<serde_json::Value>,
}

/// `app.bsky.embed.external#view`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalView {
    pub external: serde_json::Value,
}

// =============================================================================
// Feeds
// =============================================================================

/// `app.bsky.feed.defs#feedViewPost`
///
/// `post` is optional so that an entry with a missing or malformed post
/// decodes and is filtered later instead of failing the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedViewPost {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub post: Option<PostView>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient")]
    pub reason: Option<FeedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_context: Option<String>,
}

/// `app.bsky.feed.defs#replyRef`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub root: serde_json::Value,
    pub parent: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grandparent_author: Option<ProfileViewBasic>,
}

/// Why an entry appears in a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FeedReason {
    #[serde(rename = "app.bsky.feed.defs#reasonRepost")]
    Repost(ReasonRepost),
    #[serde(rename = "app.bsky.feed.defs#reasonPin")]
    Pin,
    #[serde(other)]
    Other,
}

/// `app.bsky.feed.defs#reasonRepost`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonRepost {
    pub by: ProfileViewBasic,
    #[serde(default)]
    pub indexed_at: String,
}

/// `community.blacksky.feed.getCommunityPost` output
#[derive(Debug, Clone, Deserialize)]
pub struct CommunityPostResponse {
    pub post: PostView,
}

// =============================================================================
// Sessions
// =============================================================================

/// `com.atproto.server.getSession` output
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSessionOutput {
    pub handle: String,
    pub did: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed: Option<bool>,
    #[serde(default)]
    pub email_auth_factor: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

// =============================================================================
// Preferences
// =============================================================================

/// `app.bsky.actor.getPreferences` output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetPreferencesOutput {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub preferences: Vec<PreferenceItem>,
}

/// One member of the preferences union
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "$type")]
pub enum PreferenceItem {
    #[serde(rename = "app.bsky.actor.defs#adultContentPref")]
    AdultContent { enabled: bool },
    #[serde(rename = "app.bsky.actor.defs#contentLabelPref", rename_all = "camelCase")]
    ContentLabel {
        #[serde(default)]
        labeler_did: Option<String>,
        label: String,
        visibility: String,
    },
    #[serde(rename = "app.bsky.actor.defs#mutedWordsPref")]
    MutedWords {
        #[serde(default, deserialize_with = "lenient_vec")]
        items: Vec<MutedWord>,
    },
    #[serde(rename = "app.bsky.actor.defs#hiddenPostsPref")]
    HiddenPosts {
        #[serde(default)]
        items: Vec<String>,
    },
    #[serde(rename = "app.bsky.actor.defs#interestsPref")]
    Interests {
        #[serde(default)]
        tags: Vec<String>,
    },
    #[serde(rename = "app.bsky.actor.defs#labelersPref")]
    Labelers {
        #[serde(default)]
        labelers: Vec<LabelerPrefItem>,
    },
    #[serde(other)]
    Other,
}

/// `app.bsky.actor.defs#labelerPrefItem`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabelerPrefItem {
    pub did: String,
}

/// `app.bsky.actor.defs#mutedWord`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutedWord {
    pub value: String,
    /// "content" and/or "tag"
    #[serde(default)]
    pub targets: Vec<String>,
    /// "all" or "exclude-following"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MutedWord {
    /// Mute applying to content and tags, without expiry
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            targets: vec!["content".to_string(), "tag".to_string()],
            actor_target: None,
            expires_at: None,
        }
    }
}

// =============================================================================
// Trends
// =============================================================================

/// `app.bsky.unspecced.getTrends` output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetTrendsOutput {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub trends: Vec<TrendView>,
}

/// `app.bsky.unspecced.defs#trendView`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendView {
    pub topic: String,
    pub display_name: String,
    pub link: String,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub post_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// `app.bsky.unspecced.defs#trendingTopic`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingTopic {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub link: String,
}

/// `app.bsky.unspecced.getTrendingTopics` output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendingTopicsOutput {
    #[serde(default, deserialize_with = "lenient_vec")]
    pub topics: Vec<TrendingTopic>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub suggested: Vec<TrendingTopic>,
}

// =============================================================================
// Open Collective
// =============================================================================

/// `GET /api/oc/link-status` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcLinkStatus {
    pub linked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Link state reported by the Open Collective endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcLinkState {
    Linked,
    VerificationNeeded,
}

/// `POST /api/oc/init-link` and `/api/oc/verify-email` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcLinkResponse {
    pub status: OcLinkState,
}
