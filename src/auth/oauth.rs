//! atproto OAuth client
//!
//! Authorization code flow with PKCE (S256) against the account's
//! authorization server:
//! 1. Resolve the identifier to a DID and its PDS
//! 2. Discover the authorization server from the PDS
//! 3. Push the authorization request when supported, then redirect
//! 4. Validate `state` and `iss` on callback and exchange the code
//!
//! Every authorization gets its own DPoP key. Requests to the authorization
//! server carry proofs signed with it, and the issued tokens stay bound to
//! it. Tokens, keys and pending authorizations are kept in the device store.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use rand::RngCore;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::api::xrpc::{fetch_json, fetch_json_with_dpop, send_with_dpop};
use crate::api::{Auth, DpopKey};
use crate::config::{OAuthConfig, is_loopback_host};
use crate::data::{AccountStore, OAuthTokenSet, PendingAuthorization};
use crate::error::{AppError, Result};

// =============================================================================
// Client metadata
// =============================================================================

/// OAuth client metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    pub redirect_uris: Vec<String>,
    pub scope: String,
    pub token_endpoint_auth_method: String,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    pub application_type: String,
    pub dpop_bound_access_tokens: bool,
}

impl OAuthClientMetadata {
    /// Client identity for the host the app is served from
    ///
    /// Loopback hosts get a loopback client id carrying the redirect URI and
    /// scope, since the authorization server applies fixed metadata to
    /// `http://localhost` clients and would otherwise grant only `atproto`.
    /// Any other host uses the hosted metadata document under `base_url`.
    pub fn for_environment(config: &OAuthConfig, host: &str, port: Option<u16>) -> Self {
        if is_loopback_host(host) {
            let port = port.map(|p| format!(":{p}")).unwrap_or_default();
            let redirect_uri = format!("http://127.0.0.1{port}/");
            let client_id = format!(
                "http://localhost?redirect_uri={}&scope={}",
                urlencoding::encode(&redirect_uri),
                urlencoding::encode(&config.scope)
            );
            Self::base(client_id, redirect_uri, &config.scope)
        } else {
            let base_url = config.base_url.trim_end_matches('/');
            Self {
                client_name: Some(config.client_name.clone()),
                client_uri: Some(base_url.to_string()),
                ..Self::base(
                    format!("{base_url}/oauth-client-metadata.json"),
                    format!("{base_url}/auth/web/callback"),
                    &config.scope,
                )
            }
        }
    }

    fn base(client_id: String, redirect_uri: String, scope: &str) -> Self {
        Self {
            client_id,
            client_name: None,
            client_uri: None,
            redirect_uris: vec![redirect_uri],
            scope: scope.to_string(),
            token_endpoint_auth_method: "none".to_string(),
            response_types: vec!["code".to_string()],
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            application_type: "web".to_string(),
            dpop_bound_access_tokens: true,
        }
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

// =============================================================================
// Sessions and callback parameters
// =============================================================================

/// Authenticated OAuth session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSession {
    pub did: String,
    pub tokens: OAuthTokenSet,
    /// Key the tokens are bound to
    pub dpop: Arc<DpopKey>,
}

impl OAuthSession {
    /// Session over stored tokens and the key they are bound to
    ///
    /// # Errors
    /// Returns `AppError::OAuth` if the stored key cannot be decoded
    pub fn from_tokens(tokens: OAuthTokenSet) -> Result<Self> {
        let dpop = DpopKey::from_encoded(&tokens.dpop_key)?;
        Ok(Self::bound(tokens, Arc::new(dpop)))
    }

    fn bound(tokens: OAuthTokenSet, dpop: Arc<DpopKey>) -> Self {
        Self {
            did: tokens.did.clone(),
            tokens,
            dpop,
        }
    }

    /// Authorization server issuer
    pub fn issuer(&self) -> &str {
        &self.tokens.issuer
    }

    /// Resource server the tokens are bound to
    pub fn audience(&self) -> &str {
        &self.tokens.pds_url
    }

    /// Credentials for XRPC calls
    pub fn auth(&self) -> Auth {
        Auth::OAuth {
            token_type: self.tokens.token_type.clone(),
            access_token: self.tokens.access_token.clone(),
            dpop: Some(Arc::clone(&self.dpop)),
        }
    }
}

/// Query parameters of the authorization redirect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Whether the redirect carries an authorization response at all
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.state.is_none() && self.error.is_none()
    }
}

// =============================================================================
// Client trait
// =============================================================================

/// OAuth client used to establish and restore sessions
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Start authorization; returns the URL to open in a browser
    async fn sign_in(&self, identifier: &str) -> Result<Url>;

    /// Complete authorization from redirect parameters
    ///
    /// # Returns
    /// None if the parameters carry no authorization response
    async fn callback(&self, params: &CallbackParams) -> Result<Option<OAuthSession>>;

    /// Session for a previously authorized account, refreshed if expired
    async fn restore(&self, did: &str) -> Result<OAuthSession>;

    /// Revoke and forget an account's tokens
    async fn revoke(&self, did: &str) -> Result<()>;
}

// =============================================================================
// Discovery documents
// =============================================================================

#[derive(Debug, Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    service_endpoint: serde_json::Value,
}

impl DidDocument {
    fn pds_endpoint(&self) -> Option<String> {
        self.service
            .iter()
            .find(|service| {
                service.id.ends_with("#atproto_pds") && service.kind == "AtprotoPersonalDataServer"
            })
            .and_then(|service| service.service_endpoint.as_str())
            .map(|endpoint| endpoint.trim_end_matches('/').to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Authorization server metadata (RFC 8414)
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default)]
    pub require_pushed_authorization_requests: bool,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParResponse {
    request_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    sub: String,
}

/// Account resolved from a sign-in identifier
#[derive(Debug, Clone)]
struct ResolvedIdentity {
    did: Option<String>,
    pds_url: String,
}

// =============================================================================
// PKCE
// =============================================================================

/// Random URL-safe token of 32 bytes
fn random_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a verifier
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

// =============================================================================
// PKCE OAuth client
// =============================================================================

/// OAuth client for public (browserless-secret) clients
pub struct PkceOAuthClient {
    http: Arc<reqwest::Client>,
    metadata: OAuthClientMetadata,
    handle_resolver: String,
    plc_directory: String,
    store: AccountStore,
}

impl PkceOAuthClient {
    pub fn new(
        http: Arc<reqwest::Client>,
        metadata: OAuthClientMetadata,
        config: &OAuthConfig,
        store: AccountStore,
    ) -> Self {
        Self {
            http,
            metadata,
            handle_resolver: config.handle_resolver.trim_end_matches('/').to_string(),
            plc_directory: config.plc_directory.trim_end_matches('/').to_string(),
            store,
        }
    }

    pub fn metadata(&self) -> &OAuthClientMetadata {
        &self.metadata
    }

    /// Resolve a handle, DID or service URL to an account and its PDS
    async fn resolve_identity(&self, identifier: &str) -> Result<ResolvedIdentity> {
        let identifier = identifier.trim().trim_start_matches('@');
        if identifier.starts_with("https://") || identifier.starts_with("http://") {
            return Ok(ResolvedIdentity {
                did: None,
                pds_url: identifier.trim_end_matches('/').to_string(),
            });
        }

        let did = if identifier.starts_with("did:") {
            identifier.to_string()
        } else {
            let request = self
                .http
                .get(format!(
                    "{}/xrpc/com.atproto.identity.resolveHandle",
                    self.handle_resolver
                ))
                .query(&[("handle", identifier.to_ascii_lowercase())]);
            fetch_json::<ResolveHandleOutput>("com.atproto.identity.resolveHandle", request)
                .await?
                .did
        };

        let pds_url = self.resolve_pds(&did).await?;
        tracing::debug!(did = %did, pds = %pds_url, "Resolved identity");
        Ok(ResolvedIdentity {
            did: Some(did),
            pds_url,
        })
    }

    /// PDS endpoint from the DID document
    async fn resolve_pds(&self, did: &str) -> Result<String> {
        let document_url = if did.starts_with("did:plc:") {
            format!("{}/{}", self.plc_directory, did)
        } else if let Some(host) = did.strip_prefix("did:web:") {
            format!("https://{}/.well-known/did.json", host.replace("%3A", ":"))
        } else {
            return Err(AppError::OAuth(format!("Unsupported DID method: {did}")));
        };

        let document: DidDocument = fetch_json("did.resolve", self.http.get(document_url)).await?;
        document
            .pds_endpoint()
            .ok_or_else(|| AppError::OAuth(format!("No PDS in DID document of {did}")))
    }

    /// Authorization server protecting a PDS
    async fn discover_authorization_server(&self, pds_url: &str) -> Result<AuthorizationServerMetadata> {
        let resource: std::result::Result<ProtectedResourceMetadata, _> = fetch_json(
            "oauth.protectedResource",
            self.http
                .get(format!("{pds_url}/.well-known/oauth-protected-resource")),
        )
        .await;

        // An entryway serves authorization server metadata directly
        let issuer = match resource {
            Ok(resource) => resource
                .authorization_servers
                .into_iter()
                .next()
                .ok_or_else(|| AppError::OAuth("No authorization server advertised".to_string()))?,
            Err(err) => {
                tracing::debug!(pds = %pds_url, error = %err, "No protected resource metadata");
                pds_url.to_string()
            }
        };

        self.authorization_server_metadata(&issuer).await
    }

    async fn authorization_server_metadata(&self, issuer: &str) -> Result<AuthorizationServerMetadata> {
        let issuer = issuer.trim_end_matches('/');
        let metadata: AuthorizationServerMetadata = fetch_json(
            "oauth.authorizationServer",
            self.http
                .get(format!("{issuer}/.well-known/oauth-authorization-server")),
        )
        .await?;

        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(AppError::OAuth(format!(
                "Issuer mismatch: expected {issuer}, got {}",
                metadata.issuer
            )));
        }
        Ok(metadata)
    }

    /// Exchange a grant at the token endpoint and persist the result
    async fn request_tokens(
        &self,
        token_endpoint: &str,
        issuer: &str,
        dpop: &DpopKey,
        form: &[(&str, &str)],
        expected_did: Option<&str>,
        pds_url: Option<&str>,
    ) -> Result<OAuthTokenSet> {
        let response: TokenResponse = fetch_json_with_dpop(
            "oauth.token",
            &self.http,
            Method::POST,
            token_endpoint,
            dpop,
            None,
            |builder| builder.form(form),
        )
        .await?;

        if !response.token_type.eq_ignore_ascii_case("DPoP") {
            return Err(AppError::OAuth(format!(
                "Expected a DPoP-bound token, got {}",
                response.token_type
            )));
        }

        if !response.sub.starts_with("did:") {
            return Err(AppError::OAuth("Token subject is not a DID".to_string()));
        }
        if let Some(expected) = expected_did {
            if expected != response.sub {
                return Err(AppError::OAuth(format!(
                    "Token subject mismatch: expected {expected}, got {}",
                    response.sub
                )));
            }
        }

        let pds_url = match pds_url {
            Some(pds_url) => pds_url.to_string(),
            None => self.resolve_pds(&response.sub).await?,
        };

        let tokens = OAuthTokenSet {
            did: response.sub,
            issuer: issuer.to_string(),
            pds_url,
            token_endpoint: token_endpoint.to_string(),
            token_type: response.token_type,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            scope: response.scope.unwrap_or_else(|| self.metadata.scope.clone()),
            expires_at: response
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            dpop_key: dpop.encoded(),
        };
        self.store.save_oauth_tokens(&tokens).await?;
        Ok(tokens)
    }

    async fn refresh(&self, tokens: &OAuthTokenSet, dpop: &DpopKey) -> Result<OAuthTokenSet> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| AppError::Unauthorized("Session expired".to_string()))?;

        tracing::info!(did = %tokens.did, "Refreshing OAuth tokens");
        self.request_tokens(
            &tokens.token_endpoint,
            &tokens.issuer,
            dpop,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.metadata.client_id.as_str()),
            ],
            Some(&tokens.did),
            Some(&tokens.pds_url),
        )
        .await
    }
}

#[async_trait]
impl OAuthClient for PkceOAuthClient {
    async fn sign_in(&self, identifier: &str) -> Result<Url> {
        let identity = self.resolve_identity(identifier).await?;
        let server = self.discover_authorization_server(&identity.pds_url).await?;

        let state = random_token();
        let verifier = random_token();
        let challenge = pkce_challenge(&verifier);
        let dpop = DpopKey::generate()?;

        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.metadata.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", self.metadata.redirect_uri()),
            ("scope", self.metadata.scope.as_str()),
            ("state", state.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        let login_hint = identifier.trim().trim_start_matches('@');
        if identity.did.is_some() {
            params.push(("login_hint", login_hint));
        }

        let mut authorize_url = Url::parse(&server.authorization_endpoint)
            .map_err(|e| AppError::OAuth(format!("Invalid authorization endpoint: {e}")))?;
        match &server.pushed_authorization_request_endpoint {
            Some(par_endpoint) => {
                let par: ParResponse = fetch_json_with_dpop(
                    "oauth.par",
                    &self.http,
                    Method::POST,
                    par_endpoint,
                    &dpop,
                    None,
                    |builder| builder.form(&params),
                )
                .await?;
                authorize_url
                    .query_pairs_mut()
                    .append_pair("client_id", self.metadata.client_id.as_str())
                    .append_pair("request_uri", &par.request_uri);
            }
            None if server.require_pushed_authorization_requests => {
                return Err(AppError::OAuth(
                    "Server requires pushed authorization requests but has no endpoint".to_string(),
                ));
            }
            None => {
                authorize_url.query_pairs_mut().extend_pairs(params.iter());
            }
        }

        self.store
            .save_pending_authorization(&PendingAuthorization {
                state: state.clone(),
                code_verifier: verifier,
                issuer: server.issuer.clone(),
                token_endpoint: server.token_endpoint.clone(),
                redirect_uri: self.metadata.redirect_uri().to_string(),
                did: identity.did.clone(),
                pds_url: identity.did.as_ref().map(|_| identity.pds_url.clone()),
                dpop_key: dpop.encoded(),
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(issuer = %server.issuer, "Started OAuth authorization");
        Ok(authorize_url)
    }

    async fn callback(&self, params: &CallbackParams) -> Result<Option<OAuthSession>> {
        if params.is_empty() {
            return Ok(None);
        }
        if let Some(error) = &params.error {
            return Err(AppError::OAuth(match &params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            }));
        }

        let state = params
            .state
            .as_deref()
            .ok_or_else(|| AppError::OAuth("Missing state parameter".to_string()))?;
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| AppError::OAuth("Missing code parameter".to_string()))?;
        let pending = self
            .store
            .take_pending_authorization(state)
            .await?
            .ok_or_else(|| AppError::OAuth("Unknown or expired authorization state".to_string()))?;

        if let Some(iss) = &params.iss {
            if iss.trim_end_matches('/') != pending.issuer.trim_end_matches('/') {
                return Err(AppError::OAuth(format!(
                    "Issuer mismatch: expected {}, got {iss}",
                    pending.issuer
                )));
            }
        }

        let dpop = Arc::new(DpopKey::from_encoded(&pending.dpop_key)?);
        let tokens = self
            .request_tokens(
                &pending.token_endpoint,
                &pending.issuer,
                &dpop,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", pending.redirect_uri.as_str()),
                    ("client_id", self.metadata.client_id.as_str()),
                    ("code_verifier", pending.code_verifier.as_str()),
                ],
                pending.did.as_deref(),
                pending.pds_url.as_deref(),
            )
            .await?;

        tracing::info!(did = %tokens.did, "Completed OAuth authorization");
        Ok(Some(OAuthSession::bound(tokens, dpop)))
    }

    async fn restore(&self, did: &str) -> Result<OAuthSession> {
        let tokens = self
            .store
            .get_oauth_tokens(did)
            .await?
            .ok_or_else(|| AppError::Unauthorized(format!("No stored session for {did}")))?;

        let dpop = Arc::new(DpopKey::from_encoded(&tokens.dpop_key)?);
        let tokens = if tokens.is_expired() {
            self.refresh(&tokens, &dpop).await?
        } else {
            tokens
        };

        Ok(OAuthSession::bound(tokens, dpop))
    }

    async fn revoke(&self, did: &str) -> Result<()> {
        let Some(tokens) = self.store.get_oauth_tokens(did).await? else {
            return Ok(());
        };

        match self.authorization_server_metadata(&tokens.issuer).await {
            Ok(AuthorizationServerMetadata {
                revocation_endpoint: Some(endpoint),
                ..
            }) => {
                let form = [
                    ("token", tokens.access_token.as_str()),
                    ("client_id", self.metadata.client_id.as_str()),
                ];
                let revoked = match DpopKey::from_encoded(&tokens.dpop_key) {
                    Ok(dpop) => send_with_dpop(
                        "oauth.revoke",
                        &self.http,
                        Method::POST,
                        &endpoint,
                        &dpop,
                        None,
                        |builder| builder.form(&form),
                    )
                    .await
                    .map(|_| ())
                    .map_err(AppError::from),
                    Err(err) => Err(err),
                };
                if let Err(err) = revoked {
                    tracing::warn!(did = %did, error = %err, "Token revocation failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(did = %did, error = %err, "Could not discover revocation endpoint");
            }
        }

        self.store.delete_oauth_tokens(did).await
    }
}
