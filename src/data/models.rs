//! Data models
//!
//! Normalized feed pages, paginated query data and persisted accounts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{FeedViewPost, lenient_vec};

// =============================================================================
// Community feed pages
// =============================================================================

/// Raw record from the legacy `posts` page format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPostRecord {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub creator: String,
    pub text: String,
    pub created_at: String,
    pub indexed_at: String,
}

/// Page exactly as the community endpoints return it
#[derive(Debug, Clone, Default, Deserialize)]
struct CommunityFeedPageWire {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default, deserialize_with = "optional_feed")]
    feed: Option<Vec<FeedViewPost>>,
    #[serde(default, deserialize_with = "optional_legacy")]
    posts: Option<Vec<LegacyPostRecord>>,
}

fn optional_feed<'de, D>(deserializer: D) -> Result<Option<Vec<FeedViewPost>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    lenient_vec(deserializer).map(Some)
}

fn optional_legacy<'de, D>(deserializer: D) -> Result<Option<Vec<LegacyPostRecord>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    lenient_vec(deserializer).map(Some)
}

/// Shape of a community page, decided once at the decoding boundary
#[derive(Debug, Clone, PartialEq)]
pub enum RawPage {
    /// Server-hydrated `feedViewPost` entries
    Hydrated {
        cursor: Option<String>,
        feed: Vec<FeedViewPost>,
    },
    /// Pre-hydration deployment format
    Legacy {
        cursor: Option<String>,
        posts: Vec<LegacyPostRecord>,
    },
    /// Neither array present
    Empty { cursor: Option<String> },
}

impl From<CommunityFeedPageWire> for RawPage {
    fn from(wire: CommunityFeedPageWire) -> Self {
        let cursor = wire.cursor.filter(|cursor| !cursor.is_empty());
        match (wire.feed, wire.posts) {
            (Some(feed), _) => RawPage::Hydrated { cursor, feed },
            (None, Some(posts)) => RawPage::Legacy { cursor, posts },
            (None, None) => RawPage::Empty { cursor },
        }
    }
}

impl RawPage {
    /// Decode a page body
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value::<CommunityFeedPageWire>(value).map(RawPage::from)
    }
}

/// Normalized community feed page
///
/// `cursor == None` means end of stream. Entries may still lack a post;
/// hydration and the locator skip those.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "CommunityFeedPageWire")]
pub struct FeedPage {
    pub cursor: Option<String>,
    pub feed: Vec<FeedViewPost>,
    /// Legacy records, kept for inspection only
    pub legacy: Vec<LegacyPostRecord>,
}

impl From<RawPage> for FeedPage {
    fn from(raw: RawPage) -> Self {
        match raw {
            RawPage::Hydrated { cursor, feed } => Self {
                cursor,
                feed,
                legacy: Vec::new(),
            },
            RawPage::Legacy { cursor, posts } => {
                tracing::debug!(
                    count = posts.len(),
                    "Received legacy community page; records are not hydrated"
                );
                Self {
                    cursor,
                    feed: Vec::new(),
                    legacy: posts,
                }
            }
            RawPage::Empty { cursor } => Self {
                cursor,
                ..Self::default()
            },
        }
    }
}

impl From<CommunityFeedPageWire> for FeedPage {
    fn from(wire: CommunityFeedPageWire) -> Self {
        RawPage::from(wire).into()
    }
}

/// Page type that carries a continuation cursor
pub trait Paginated {
    fn next_cursor(&self) -> Option<&str>;
}

impl Paginated for FeedPage {
    fn next_cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}

// =============================================================================
// Paginated query data
// =============================================================================

/// All pages fetched so far for one query key
///
/// Values are replaced whole in the cache; pages are shared between
/// successive values through `Arc`.
#[derive(Debug, PartialEq)]
pub struct InfiniteData<P> {
    pub pages: Vec<Arc<P>>,
    /// Cursor each page was requested with (`None` for the first page)
    pub page_params: Vec<Option<String>>,
}

impl<P> Clone for InfiniteData<P> {
    fn clone(&self) -> Self {
        Self {
            pages: self.pages.clone(),
            page_params: self.page_params.clone(),
        }
    }
}

impl<P> Default for InfiniteData<P> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<P: Paginated> InfiniteData<P> {
    /// Single first page
    pub fn first(page: P) -> Self {
        Self {
            pages: vec![Arc::new(page)],
            page_params: vec![None],
        }
    }

    /// Cursor for the next request, if the stream continues
    pub fn next_page_param(&self) -> Option<&str> {
        self.pages.last().and_then(|page| page.next_cursor())
    }

    /// False once the last page omitted its cursor
    pub fn has_next_page(&self) -> bool {
        self.pages.is_empty() || self.next_page_param().is_some()
    }

    /// New value with one more page
    pub fn appended(&self, param: Option<String>, page: P) -> Self {
        let mut next = self.clone();
        next.pages.push(Arc::new(page));
        next.page_params.push(param);
        next
    }
}

impl InfiniteData<FeedPage> {
    /// Feed entries of every page, in order
    pub fn entries(&self) -> impl Iterator<Item = &FeedViewPost> {
        self.pages.iter().flat_map(|page| page.feed.iter())
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// Authenticated identity persisted on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionAccount {
    pub did: String,
    pub handle: String,
    /// Issuer / entryway the account signed in through
    pub service: String,
    /// Personal data server the account's tokens are bound to
    pub pds_url: Option<String>,
    pub email: Option<String>,
    pub email_confirmed: Option<bool>,
    pub email_auth_factor: Option<bool>,
    pub active: Option<bool>,
    pub status: Option<String>,
    pub is_self_hosted: bool,
    pub is_oauth_session: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionAccount {
    /// Service calls should be dispatched to
    pub fn dispatch_url(&self) -> &str {
        self.pds_url.as_deref().unwrap_or(&self.service)
    }
}

/// OAuth token set persisted per account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OAuthTokenSet {
    /// Account the tokens were issued to (`sub`)
    pub did: String,
    /// Authorization server issuer
    pub issuer: String,
    /// Resource server the tokens are bound to (`aud`)
    pub pds_url: String,
    pub token_endpoint: String,
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// PKCS#8 DPoP key the tokens are bound to, base64url encoded
    pub dpop_key: String,
}

impl OAuthTokenSet {
    /// Whether the access token is expired, with a small leeway
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now() + chrono::Duration::seconds(30))
    }
}

impl std::fmt::Debug for OAuthTokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenSet")
            .field("did", &self.did)
            .field("issuer", &self.issuer)
            .field("pds_url", &self.pds_url)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Authorization started but not yet completed
///
/// Keyed by `state`; consumed exactly once by the callback.
#[derive(Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub issuer: String,
    pub token_endpoint: String,
    pub redirect_uri: String,
    /// Account expected to complete the flow, when known up front
    pub did: Option<String>,
    pub pds_url: Option<String>,
    /// DPoP key used for the pushed request; the token request must reuse it
    pub dpop_key: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("issuer", &self.issuer)
            .field("redirect_uri", &self.redirect_uri)
            .field("did", &self.did)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
