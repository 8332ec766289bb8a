//! community-feed - data layer of an atproto community feed client
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Auth Layer                               │
//! │  - OAuth client identity and PKCE flow                      │
//! │  - Session establishment and lifecycle                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Paginated feed queries, hydration, moderation            │
//! │  - Cross-cache post locator                                 │
//! │  - Trends and Open Collective linking                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  API + Data Layer                            │
//! │  - XRPC client and wire types                               │
//! │  - Query cache with single-flight fetches                   │
//! │  - Device storage (SQLite via sqlx)                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: XRPC client, community endpoints and wire types
//! - `data`: AT URIs, page models, query cache and device storage
//! - `service`: Feed queries, hydration, moderation, locator, trends
//! - `auth`: atproto OAuth and sessions
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus metrics

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use api::XrpcClient;
use auth::{AuthContext, OAuthClient, SessionManager, StaticFeatureGates};
use data::AccountStore;
use service::{FeedCache, FeedQuery, OpenCollectiveService, PostCache, TrendingService};

/// Application state shared by every command
///
/// Cloning is cheap; caches and the store are shared handles.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// HTTP client shared by every XRPC client
    pub http_client: Arc<reqwest::Client>,

    /// Device storage
    pub store: AccountStore,

    /// Community feed and timeline pages
    pub feeds: FeedCache,

    /// Single community posts
    pub posts: PostCache,

    pub trending: TrendingService,

    pub open_collective: OpenCollectiveService,

    /// Current session
    pub sessions: SessionManager,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Build the HTTP client
    /// 2. Create the caches and services
    /// 3. Wire the OAuth client into session management
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        config: config::AppConfig,
        store: AccountStore,
        oauth_metadata: auth::OAuthClientMetadata,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(config.service.user_agent.as_str())
                .timeout(config.timeout())
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let oauth = Arc::new(auth::PkceOAuthClient::new(
            Arc::clone(&http_client),
            oauth_metadata,
            &config.oauth,
            store.clone(),
        ));

        let state = Self::with_oauth(config, http_client, store, oauth);
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble state around an existing store and OAuth client
    pub fn with_oauth(
        config: config::AppConfig,
        http_client: Arc<reqwest::Client>,
        store: AccountStore,
        oauth: Arc<dyn OAuthClient>,
    ) -> Self {
        let feeds = FeedCache::new();
        let posts = PostCache::new();
        let trending = TrendingService::new(Arc::clone(&http_client), &config);
        let open_collective = OpenCollectiveService::new(std::time::Duration::from_secs(
            config.cache.link_status_stale_seconds,
        ));

        let ctx = AuthContext::new(
            Arc::clone(&http_client),
            &config,
            oauth,
            Arc::new(StaticFeatureGates::from_config(&config.features)),
            store.clone(),
        );
        let sessions = SessionManager::new(ctx, feeds.clone(), posts.clone(), open_collective.clone());

        Self {
            config: Arc::new(config),
            http_client,
            store,
            feeds,
            posts,
            trending,
            open_collective,
            sessions,
        }
    }

    /// Unauthenticated client for the public appview
    pub fn public_client(&self) -> XrpcClient {
        XrpcClient::new(Arc::clone(&self.http_client), &self.config.service.public_api)
    }

    /// Client of the current session, or the public client when signed out
    pub async fn client(&self) -> XrpcClient {
        match self.sessions.current().await {
            Some(established) => established.agent.client().clone(),
            None => self.public_client(),
        }
    }

    /// Community feed query of an actor
    pub async fn feed_query(&self, actor: Option<&str>) -> FeedQuery {
        FeedQuery::community_feed(self.client().await, self.feeds.clone(), actor)
            .with_page_size(self.config.cache.feed_page_size)
    }

    /// Community timeline query
    pub async fn timeline_query(&self) -> FeedQuery {
        FeedQuery::community_timeline(self.client().await, self.feeds.clone(), true)
            .with_page_size(self.config.cache.feed_page_size)
    }
}
