//! Session establishment from OAuth
//!
//! Turns an authorized [`OAuthSession`] into a ready-to-use [`Agent`]: the
//! account is derived from `com.atproto.server.getSession`, then moderation
//! preferences and feature gates are loaded concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::oauth::{CallbackParams, OAuthClient, OAuthSession};
use crate::api::{GetPreferencesOutput, GetSessionOutput, XrpcClient, XrpcRequest};
use crate::config::{AppConfig, FeatureConfig};
use crate::data::{AccountStore, SessionAccount};
use crate::error::{AppError, Result, XrpcError};
use crate::metrics::LOGIN_OUTCOMES_TOTAL;
use crate::service::{ModerationOpts, ModerationPrefs};

pub const GET_SESSION: &str = "com.atproto.server.getSession";
pub const GET_PREFERENCES: &str = "app.bsky.actor.getPreferences";

// =============================================================================
// Feature gates
// =============================================================================

/// Feature gate provider, initialized per account
#[async_trait]
pub trait FeatureGates: Send + Sync {
    /// Load gate values for an account
    async fn initialize(&self, account: &SessionAccount) -> Result<()>;

    /// Whether a gate is on
    fn check(&self, gate: &str) -> bool;
}

/// Gates fixed by configuration
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureGates {
    enabled: BTreeSet<String>,
}

impl StaticFeatureGates {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &FeatureConfig) -> Self {
        Self::new(config.enabled.iter().cloned())
    }
}

#[async_trait]
impl FeatureGates for StaticFeatureGates {
    async fn initialize(&self, account: &SessionAccount) -> Result<()> {
        tracing::debug!(did = %account.did, gates = self.enabled.len(), "Feature gates ready");
        Ok(())
    }

    fn check(&self, gate: &str) -> bool {
        self.enabled.contains(gate)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything session establishment depends on
#[derive(Clone)]
pub struct AuthContext {
    pub http: Arc<reqwest::Client>,
    pub oauth: Arc<dyn OAuthClient>,
    pub gates: Arc<dyn FeatureGates>,
    pub store: AccountStore,
    /// Entryway; accounts issued elsewhere are self-hosted
    pub default_service: String,
    /// `atproto-proxy` value attached to appview calls
    pub appview_proxy: String,
}

impl AuthContext {
    pub fn new(
        http: Arc<reqwest::Client>,
        config: &AppConfig,
        oauth: Arc<dyn OAuthClient>,
        gates: Arc<dyn FeatureGates>,
        store: AccountStore,
    ) -> Self {
        Self {
            http,
            oauth,
            gates,
            store,
            default_service: config.service.default_service.clone(),
            appview_proxy: config.service.appview_proxy.clone(),
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Authenticated client for one account
#[derive(Clone)]
pub struct Agent {
    client: XrpcClient,
    account: Option<SessionAccount>,
    moderation: Arc<ModerationOpts>,
    preferences: Option<Arc<GetPreferencesOutput>>,
}

impl Agent {
    /// Agent bound to the session's resource server
    pub fn new(http: Arc<reqwest::Client>, session: &OAuthSession) -> Self {
        Self {
            client: XrpcClient::new(http, session.audience()).with_auth(session.auth()),
            account: None,
            moderation: Arc::new(ModerationOpts {
                user_did: Some(session.did.clone()),
                prefs: ModerationPrefs::default(),
            }),
            preferences: None,
        }
    }

    pub fn client(&self) -> &XrpcClient {
        &self.client
    }

    pub fn account(&self) -> Option<&SessionAccount> {
        self.account.as_ref()
    }

    pub fn did(&self) -> Option<&str> {
        self.account.as_ref().map(|account| account.did.as_str())
    }

    /// Service calls are dispatched to
    pub fn dispatch_url(&self) -> &str {
        self.client.service()
    }

    pub fn moderation_opts(&self) -> Arc<ModerationOpts> {
        Arc::clone(&self.moderation)
    }

    /// Preferences loaded during preparation, if that succeeded
    pub fn preferences(&self) -> Option<&Arc<GetPreferencesOutput>> {
        self.preferences.as_ref()
    }

    pub async fn get_session(&self) -> std::result::Result<GetSessionOutput, XrpcError> {
        self.client.send(XrpcRequest::query(GET_SESSION)).await
    }

    /// Bind the agent to an account and load its per-account state
    async fn prepare(
        mut self,
        account: SessionAccount,
        gates: &dyn FeatureGates,
        appview_proxy: &str,
    ) -> EstablishedSession {
        self.client = self
            .client
            .with_service(account.dispatch_url())
            .with_proxy(appview_proxy);

        let (gates_result, (moderation, preferences)) = tokio::join!(
            gates.initialize(&account),
            configure_moderation(&self.client, &account)
        );
        if let Err(err) = gates_result {
            tracing::warn!(did = %account.did, error = %err, "Feature gates unavailable");
        }

        self.moderation = Arc::new(moderation);
        self.preferences = preferences.map(Arc::new);
        self.account = Some(account.clone());
        EstablishedSession {
            account,
            agent: self,
        }
    }
}

/// Authenticated account with its prepared agent
#[derive(Clone)]
pub struct EstablishedSession {
    pub account: SessionAccount,
    pub agent: Agent,
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("did", &self.account.did)
            .field("handle", &self.account.handle)
            .field("dispatch_url", &self.agent.dispatch_url())
            .finish()
    }
}

/// Result of completing an OAuth redirect
#[derive(Debug)]
pub enum LoginOutcome {
    LoggedIn(Box<EstablishedSession>),
    /// Continue unauthenticated
    LoggedOut,
}

impl LoginOutcome {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, LoginOutcome::LoggedIn(_))
    }
}

/// Moderation options for an account; failures fall back to defaults
async fn configure_moderation(
    client: &XrpcClient,
    account: &SessionAccount,
) -> (ModerationOpts, Option<GetPreferencesOutput>) {
    match client
        .send::<GetPreferencesOutput>(XrpcRequest::query(GET_PREFERENCES))
        .await
    {
        Ok(preferences) => {
            let prefs = ModerationPrefs::from_preferences(&preferences);
            tracing::debug!(
                did = %account.did,
                labelers = prefs.labelers.len(),
                muted_words = prefs.muted_words.len(),
                "Configured moderation"
            );
            (
                ModerationOpts {
                    user_did: Some(account.did.clone()),
                    prefs,
                },
                Some(preferences),
            )
        }
        Err(err) => {
            tracing::warn!(did = %account.did, error = %err, "Using default moderation preferences");
            (
                ModerationOpts {
                    user_did: Some(account.did.clone()),
                    prefs: ModerationPrefs::default(),
                },
                None,
            )
        }
    }
}

// =============================================================================
// Establishment
// =============================================================================

/// Derive the account of an OAuth session
///
/// # Returns
/// None if `getSession` fails for any reason; the failure is logged
pub async fn session_account_from_oauth(
    agent: &Agent,
    session: &OAuthSession,
    default_service: &str,
) -> Option<SessionAccount> {
    let data = match agent.get_session().await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(did = %session.did, error = %err, "Failed to load session info");
            return None;
        }
    };

    let issuer = session.issuer();
    Some(SessionAccount {
        did: session.did.clone(),
        handle: data.handle,
        service: issuer.to_string(),
        pds_url: Some(session.audience().to_string()),
        email: data.email,
        email_confirmed: data.email_confirmed,
        email_auth_factor: data.email_auth_factor,
        active: data.active,
        status: data.status,
        is_self_hosted: !issuer.starts_with(default_service),
        is_oauth_session: true,
        created_at: chrono::Utc::now(),
    })
}

/// Build a prepared agent for an OAuth session
///
/// # Errors
/// Returns `AppError::Unauthorized` if the account cannot be derived
pub async fn oauth_create_agent(session: OAuthSession, ctx: &AuthContext) -> Result<EstablishedSession> {
    let agent = Agent::new(Arc::clone(&ctx.http), &session);
    let account = session_account_from_oauth(&agent, &session, &ctx.default_service)
        .await
        .ok_or_else(|| AppError::Unauthorized("Expected an active session".to_string()))?;

    Ok(agent
        .prepare(account, ctx.gates.as_ref(), &ctx.appview_proxy)
        .await)
}

/// Restore a stored account's session
pub async fn oauth_resume_session(account: &SessionAccount, ctx: &AuthContext) -> Result<EstablishedSession> {
    let session = ctx.oauth.restore(&account.did).await?;
    oauth_create_agent(session, ctx).await
}

/// Complete an OAuth redirect
///
/// Every failure is logged and ends logged out; on success the account is
/// stored and becomes current.
pub async fn finish_oauth_callback(params: &CallbackParams, ctx: &AuthContext) -> LoginOutcome {
    let outcome = match complete_login(params, ctx).await {
        Ok(Some(established)) => LoginOutcome::LoggedIn(Box::new(established)),
        Ok(None) => LoginOutcome::LoggedOut,
        Err(err) => {
            tracing::error!(error = %err.record(), "OAuth callback failed");
            LoginOutcome::LoggedOut
        }
    };

    let label = if outcome.is_logged_in() { "logged_in" } else { "logged_out" };
    LOGIN_OUTCOMES_TOTAL.with_label_values(&[label]).inc();
    outcome
}

async fn complete_login(params: &CallbackParams, ctx: &AuthContext) -> Result<Option<EstablishedSession>> {
    let Some(session) = ctx.oauth.callback(params).await? else {
        return Ok(None);
    };
    let established = oauth_create_agent(session, ctx).await?;

    ctx.store.upsert_account(&established.account).await?;
    ctx.store.set_current_account(&established.account.did).await?;
    tracing::info!(
        did = %established.account.did,
        handle = %established.account.handle,
        "Signed in"
    );
    Ok(Some(established))
}
