//! Current session management
//!
//! Owns the established session of the signed-in account and the caches
//! holding that account's data.

use std::sync::Arc;

use tokio::sync::RwLock;
use url::Url;

use super::agent::{
    AuthContext, EstablishedSession, LoginOutcome, finish_oauth_callback, oauth_resume_session,
};
use super::oauth::CallbackParams;
use crate::data::SessionAccount;
use crate::error::Result;
use crate::service::{FeedCache, OpenCollectiveService, PostCache};

/// Session lifecycle of one device
#[derive(Clone)]
pub struct SessionManager {
    ctx: AuthContext,
    current: Arc<RwLock<Option<EstablishedSession>>>,
    feeds: FeedCache,
    posts: PostCache,
    open_collective: OpenCollectiveService,
}

impl SessionManager {
    pub fn new(
        ctx: AuthContext,
        feeds: FeedCache,
        posts: PostCache,
        open_collective: OpenCollectiveService,
    ) -> Self {
        Self {
            ctx,
            current: Arc::new(RwLock::new(None)),
            feeds,
            posts,
            open_collective,
        }
    }

    pub fn context(&self) -> &AuthContext {
        &self.ctx
    }

    /// Start signing in; returns the URL to open in a browser
    pub async fn sign_in(&self, identifier: &str) -> Result<Url> {
        self.ctx.oauth.sign_in(identifier).await
    }

    /// Complete an OAuth redirect and adopt its outcome
    pub async fn complete_sign_in(&self, params: &CallbackParams) -> Option<EstablishedSession> {
        let outcome = finish_oauth_callback(params, &self.ctx).await;
        self.login(outcome).await
    }

    /// Adopt a login outcome
    ///
    /// A previous account's cached data is dropped when the account changes.
    pub async fn login(&self, outcome: LoginOutcome) -> Option<EstablishedSession> {
        let LoginOutcome::LoggedIn(established) = outcome else {
            return None;
        };

        let previous = self
            .current
            .write()
            .await
            .replace((*established).clone());
        if previous.is_some_and(|previous| previous.account.did != established.account.did) {
            self.clear_caches().await;
        }
        Some(*established)
    }

    pub async fn current(&self) -> Option<EstablishedSession> {
        self.current.read().await.clone()
    }

    pub async fn accounts(&self) -> Result<Vec<SessionAccount>> {
        self.ctx.store.list_accounts().await
    }

    /// Resume the account stored as current, if any
    ///
    /// # Errors
    /// Returns the restore error; the stored account is kept so a later
    /// attempt can succeed
    pub async fn resume_current(&self) -> Result<Option<EstablishedSession>> {
        let Some(account) = self.ctx.store.current_account().await? else {
            return Ok(None);
        };

        let established = oauth_resume_session(&account, &self.ctx)
            .await
            .map_err(|err| {
                tracing::warn!(did = %account.did, error = %err, "Failed to resume session");
                err
            })?;
        *self.current.write().await = Some(established.clone());
        tracing::info!(did = %account.did, "Resumed session");
        Ok(Some(established))
    }

    /// Sign the current account out
    ///
    /// Tokens are revoked on a best-effort basis; the account is removed from
    /// the device and all account data is dropped from the caches.
    pub async fn logout(&self) -> Result<()> {
        let did = match self.current.write().await.take() {
            Some(established) => Some(established.account.did),
            None => self
                .ctx
                .store
                .current_account()
                .await?
                .map(|account| account.did),
        };

        if let Some(did) = did {
            if let Err(err) = self.ctx.oauth.revoke(&did).await {
                tracing::warn!(did = %did, error = %err, "Failed to revoke session");
            }
            self.ctx.store.remove_account(&did).await?;
            tracing::info!(did = %did, "Signed out");
        }

        self.clear_caches().await;
        Ok(())
    }

    async fn clear_caches(&self) {
        self.feeds.clear().await;
        self.posts.clear().await;
        self.open_collective.clear().await;
    }
}
