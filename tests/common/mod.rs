//! Common test utilities for E2E tests
//!
//! [`MockNetwork`] serves every remote party the client talks to from one
//! ephemeral port: the appview and PDS XRPC endpoints, the PLC directory and
//! the OAuth authorization server. The authorization server and the PDS only
//! accept requests carrying a valid DPoP proof.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use community_feed::{
    AppState,
    auth::{OAuthClientMetadata, pkce_challenge},
    config,
    data::AccountStore,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const DID: &str = "did:plc:alice";
pub const HANDLE: &str = "alice.test";
pub const AUTH_CODE: &str = "auth-code";

/// Number of posts on the first and second timeline page
pub const TIMELINE_PAGES: [usize; 2] = [30, 12];

/// Cursor returned with the first timeline page
pub const SECOND_PAGE_CURSOR: &str = "page-2";

/// Nonce the authorization server requires in proofs
pub const AS_NONCE: &str = "as-nonce-1";

/// Shared, inspectable state of the mock network
pub struct MockState {
    pub base: String,
    pub timeline_requests: AtomicUsize,
    /// Cursor of every timeline request, in order
    pub timeline_cursors: Mutex<Vec<Option<String>>>,
    /// Timeline cursor whose next request fails with a 502
    pub fail_cursor_once: Mutex<Option<String>>,
    /// Delay applied to timeline responses
    pub timeline_delay_ms: AtomicU64,
    /// Posts per actor for `getCommunityFeed`
    pub actor_feeds: Mutex<HashMap<String, Vec<Value>>>,
    /// Posts served on the first timeline page before the generated ones
    pub timeline_head: Mutex<Vec<Value>>,
    pub session_fails: AtomicBool,
    pub par_requests: Mutex<Vec<HashMap<String, String>>>,
    pub token_requests: Mutex<Vec<HashMap<String, String>>>,
    pub refreshes: AtomicUsize,
    pub revocations: AtomicUsize,
    /// Requests answered with `use_dpop_nonce`
    pub nonce_challenges: AtomicUsize,
    /// Requests rejected for a missing or invalid proof
    pub rejected_proofs: AtomicUsize,
    /// Public key of the pushed request's proof
    pub par_jwk: Mutex<Option<Value>>,
    /// Public key the issued tokens are bound to
    pub bound_jwk: Mutex<Option<Value>>,
    /// `expires_in` of issued tokens
    pub expires_in: AtomicI64,
    access_token: Mutex<String>,
    token_serial: AtomicUsize,
}

impl MockState {
    fn new(base: String) -> Self {
        Self {
            base,
            timeline_requests: AtomicUsize::new(0),
            timeline_cursors: Mutex::new(Vec::new()),
            fail_cursor_once: Mutex::new(None),
            timeline_delay_ms: AtomicU64::new(0),
            actor_feeds: Mutex::new(HashMap::new()),
            timeline_head: Mutex::new(Vec::new()),
            session_fails: AtomicBool::new(false),
            par_requests: Mutex::new(Vec::new()),
            token_requests: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
            revocations: AtomicUsize::new(0),
            nonce_challenges: AtomicUsize::new(0),
            rejected_proofs: AtomicUsize::new(0),
            par_jwk: Mutex::new(None),
            bound_jwk: Mutex::new(None),
            expires_in: AtomicI64::new(3600),
            access_token: Mutex::new(String::new()),
            token_serial: AtomicUsize::new(0),
        }
    }

    /// Most recent pushed authorization request
    pub fn last_par(&self) -> HashMap<String, String> {
        self.par_requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn current_access_token(&self) -> String {
        self.access_token.lock().unwrap().clone()
    }

    fn issue_tokens(&self) -> Value {
        let serial = self.token_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let access_token = format!("access-{serial}");
        *self.access_token.lock().unwrap() = access_token.clone();
        json!({
            "access_token": access_token,
            "token_type": "DPoP",
            "refresh_token": format!("refresh-{serial}"),
            "scope": "atproto transition:generic",
            "expires_in": self.expires_in.load(Ordering::SeqCst),
            "sub": DID
        })
    }
}

/// Mock appview, PDS, PLC directory and authorization server
pub struct MockNetwork {
    pub base: String,
    pub state: Arc<MockState>,
}

impl MockNetwork {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(MockState::new(base.clone()));

        let app = Router::new()
            // Community appview
            .route(
                "/xrpc/community.blacksky.feed.getCommunityTimeline",
                get(community_timeline),
            )
            .route("/xrpc/community.blacksky.feed.getCommunityFeed", get(community_feed))
            .route("/xrpc/community.blacksky.feed.getCommunityPost", get(community_post))
            .route("/xrpc/app.bsky.unspecced.getTrendingTopics", get(trending_topics))
            // PDS
            .route("/xrpc/com.atproto.server.getSession", get(get_session))
            .route("/xrpc/app.bsky.actor.getPreferences", get(get_preferences))
            .route("/xrpc/com.atproto.identity.resolveHandle", get(resolve_handle))
            .route("/api/oc/link-status", get(oc_link_status))
            .route("/.well-known/oauth-protected-resource", get(protected_resource))
            // PLC directory
            .route("/plc/:did", get(did_document))
            // Authorization server
            .route("/.well-known/oauth-authorization-server", get(authorization_server))
            .route("/oauth/par", post(par))
            .route("/oauth/token", post(token))
            .route("/oauth/revoke", post(revoke))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    /// Configuration pointing every endpoint at the mock network
    pub fn config(&self, temp_dir: &TempDir) -> config::AppConfig {
        config::AppConfig {
            service: config::ServiceConfig {
                default_service: "https://bsky.social".to_string(),
                public_api: self.base.clone(),
                appview_proxy: "did:web:api.blacksky.community#bsky_appview".to_string(),
                debug_topics: None,
                content_languages: "en".to_string(),
                user_agent: "community-feed-e2e".to_string(),
                timeout_seconds: 10,
            },
            oauth: config::OAuthConfig {
                base_url: "https://blacksky.community".to_string(),
                client_name: "Blacksky Community".to_string(),
                scope: config::DEFAULT_OAUTH_SCOPE.to_string(),
                handle_resolver: self.base.clone(),
                plc_directory: format!("{}/plc", self.base),
                loopback_port: 0,
            },
            cache: config::CacheConfig {
                trending_stale_seconds: 180,
                link_status_stale_seconds: 300,
                feed_page_size: 30,
            },
            storage: config::StorageConfig {
                path: temp_dir.path().join("device.db"),
            },
            features: config::FeatureConfig::default(),
            logging: config::LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Application state over a fresh store in `temp_dir`
    pub async fn app(&self, temp_dir: &TempDir) -> AppState {
        let config = self.config(temp_dir);
        let store = AccountStore::connect(&config.storage.path).await.unwrap();
        self.app_with_store(temp_dir, store)
    }

    /// Application state over an existing store
    pub fn app_with_store(&self, temp_dir: &TempDir, store: AccountStore) -> AppState {
        let config = self.config(temp_dir);
        let metadata = OAuthClientMetadata::for_environment(&config.oauth, "127.0.0.1", Some(8081));
        AppState::new(config, store, metadata).unwrap()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn post_uri(did: &str, rkey: &str) -> String {
    format!("at://{did}/app.bsky.feed.post/{rkey}")
}

pub fn post_json(did: &str, handle: &str, rkey: &str, text: &str) -> Value {
    json!({
        "uri": post_uri(did, rkey),
        "cid": format!("bafy{rkey}"),
        "author": {"did": did, "handle": handle},
        "record": {
            "$type": "app.bsky.feed.post",
            "text": text,
            "createdAt": "2024-01-01T00:00:00Z"
        },
        "likeCount": 0,
        "indexedAt": "2024-01-01T00:00:00Z",
        "labels": []
    })
}

/// Post quoting `quoted`
pub fn quote_json(did: &str, handle: &str, rkey: &str, quoted: &Value) -> Value {
    let mut post = post_json(did, handle, rkey, "quoting");
    post["embed"] = json!({
        "$type": "app.bsky.embed.record#view",
        "record": {
            "$type": "app.bsky.embed.record#viewRecord",
            "uri": quoted["uri"],
            "cid": quoted["cid"],
            "author": quoted["author"],
            "value": quoted["record"],
            "indexedAt": quoted["indexedAt"]
        }
    });
    post
}

fn feed_entries(posts: Vec<Value>) -> Vec<Value> {
    posts.into_iter().map(|post| json!({"post": post})).collect()
}

// =============================================================================
// Handlers
// =============================================================================

type Shared = State<Arc<MockState>>;

async fn community_timeline(
    State(state): Shared,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.timeline_requests.fetch_add(1, Ordering::SeqCst);
    let requested = params.get("cursor").cloned();
    state.timeline_cursors.lock().unwrap().push(requested.clone());
    let delay = state.timeline_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    {
        let mut fail = state.fail_cursor_once.lock().unwrap();
        if fail.is_some() && *fail == requested {
            *fail = None;
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "UpstreamFailure", "message": "appview unavailable"})),
            )
                .into_response();
        }
    }

    let (page, count, cursor) = match requested.as_deref() {
        None => (1, TIMELINE_PAGES[0], Some(SECOND_PAGE_CURSOR)),
        Some(SECOND_PAGE_CURSOR) => (2, TIMELINE_PAGES[1], None),
        Some(_) => (3, 0, None),
    };

    let mut posts = if page == 1 {
        state.timeline_head.lock().unwrap().clone()
    } else {
        Vec::new()
    };
    let generated = count.saturating_sub(posts.len());
    posts.extend((0..generated).map(|i| {
        post_json("did:plc:bob", "bob.test", &format!("p{page}-{i}"), &format!("post {page}-{i}"))
    }));

    Json(json!({"cursor": cursor, "feed": feed_entries(posts)})).into_response()
}

async fn community_feed(
    State(state): Shared,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let actor = params.get("actor").cloned().unwrap_or_default();
    let posts = state
        .actor_feeds
        .lock()
        .unwrap()
        .get(&actor)
        .cloned()
        .unwrap_or_default();
    Json(json!({"feed": feed_entries(posts)}))
}

async fn community_post(Query(params): Query<HashMap<String, String>>) -> Response {
    let uri = params.get("uri").cloned().unwrap_or_default();
    match uri.rsplit('/').next() {
        Some(rkey) if uri.starts_with("at://") => {
            Json(json!({"post": post_json(DID, HANDLE, rkey, "single post")})).into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn trending_topics() -> Json<Value> {
    Json(json!({
        "topics": [
            {"topic": "rust", "link": "/search?q=rust"},
            {"topic": "elections", "displayName": "Elections", "link": "/search?q=elections"}
        ],
        "suggested": [{"topic": "art", "link": "/search?q=art"}]
    }))
}

/// Claims and public key of a valid proof for `method` on `url`
fn verify_dpop(headers: &HeaderMap, method: &str, url: &str) -> Option<(Value, Value)> {
    let proof = headers.get("dpop")?.to_str().ok()?;
    let header = jsonwebtoken::decode_header(proof).ok()?;
    if header.typ.as_deref() != Some("dpop+jwt") || header.alg != Algorithm::ES256 {
        return None;
    }
    let jwk = header.jwk?;
    let key = DecodingKey::from_jwk(&jwk).ok()?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    let claims = jsonwebtoken::decode::<Value>(proof, &key, &validation).ok()?.claims;

    let matches = claims["htm"] == method && claims["htu"] == url && claims["jti"].is_string();
    matches.then(|| (claims, serde_json::to_value(&jwk).unwrap_or_default()))
}

fn invalid_proof(state: &MockState) -> Response {
    state.rejected_proofs.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid_dpop_proof"})),
    )
        .into_response()
}

/// Authorization server proof check; demands [`AS_NONCE`] first
fn check_as_proof(state: &MockState, headers: &HeaderMap, path: &str) -> Result<Value, Response> {
    let url = format!("{}{path}", state.base);
    let Some((claims, jwk)) = verify_dpop(headers, "POST", &url) else {
        return Err(invalid_proof(state));
    };
    if claims["nonce"] != AS_NONCE {
        state.nonce_challenges.fetch_add(1, Ordering::SeqCst);
        return Err((
            StatusCode::BAD_REQUEST,
            [("DPoP-Nonce", AS_NONCE)],
            Json(json!({"error": "use_dpop_nonce"})),
        )
            .into_response());
    }
    Ok(jwk)
}

/// Resource server check of a DPoP-bound access token
fn authorized(state: &MockState, headers: &HeaderMap, method: &str) -> bool {
    let token = state.current_access_token();
    let expected = format!("DPoP {token}");
    if headers.get("authorization").and_then(|value| value.to_str().ok()) != Some(expected.as_str()) {
        return false;
    }

    let url = format!("{}/xrpc/{method}", state.base);
    let Some((claims, jwk)) = verify_dpop(headers, "GET", &url) else {
        state.rejected_proofs.fetch_add(1, Ordering::SeqCst);
        return false;
    };
    let ath = URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()));
    claims["ath"] == ath.as_str() && state.bound_jwk.lock().unwrap().as_ref() == Some(&jwk)
}

async fn get_session(State(state): Shared, headers: HeaderMap) -> Response {
    if state.session_fails.load(Ordering::SeqCst)
        || !authorized(&state, &headers, "com.atproto.server.getSession")
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "AuthenticationRequired", "message": "Invalid token"})),
        )
            .into_response();
    }
    Json(json!({
        "did": DID,
        "handle": HANDLE,
        "email": "alice@example.com",
        "emailConfirmed": true,
        "active": true
    }))
    .into_response()
}

async fn get_preferences(State(state): Shared, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers, "app.bsky.actor.getPreferences") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "preferences": [
            {"$type": "app.bsky.actor.defs#interestsPref", "tags": ["art"]},
            {"$type": "app.bsky.actor.defs#mutedWordsPref", "items": [
                {"value": "elections", "targets": ["content", "tag"]}
            ]}
        ]
    }))
    .into_response()
}

async fn resolve_handle(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("handle").map(String::as_str) {
        Some(HANDLE) => Json(json!({"did": DID})).into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "InvalidRequest", "message": "Unable to resolve handle"})),
        )
            .into_response(),
    }
}

async fn oc_link_status(State(state): Shared, headers: HeaderMap) -> Response {
    let expected = format!("Bearer {}", state.current_access_token());
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"linked": true, "email": "alice@example.com"})).into_response()
}

async fn protected_resource(State(state): Shared) -> Json<Value> {
    Json(json!({
        "resource": state.base,
        "authorization_servers": [state.base]
    }))
}

async fn did_document(State(state): Shared, Path(did): Path<String>) -> Response {
    if did != DID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "id": DID,
        "alsoKnownAs": [format!("at://{HANDLE}")],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": state.base
        }]
    }))
    .into_response()
}

async fn authorization_server(State(state): Shared) -> Json<Value> {
    let base = &state.base;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "pushed_authorization_request_endpoint": format!("{base}/oauth/par"),
        "require_pushed_authorization_requests": true,
        "revocation_endpoint": format!("{base}/oauth/revoke"),
        "code_challenge_methods_supported": ["S256"]
    }))
}

async fn par(
    State(state): Shared,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let jwk = match check_as_proof(&state, &headers, "/oauth/par") {
        Ok(jwk) => jwk,
        Err(response) => return response,
    };
    *state.par_jwk.lock().unwrap() = Some(jwk);

    let mut requests = state.par_requests.lock().unwrap();
    requests.push(form);
    (
        StatusCode::CREATED,
        Json(json!({
            "request_uri": format!("urn:ietf:params:oauth:request_uri:req-{}", requests.len()),
            "expires_in": 299
        })),
    )
        .into_response()
}

async fn token(
    State(state): Shared,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let jwk = match check_as_proof(&state, &headers, "/oauth/token") {
        Ok(jwk) => jwk,
        Err(response) => return response,
    };
    state.token_requests.lock().unwrap().push(form.clone());
    let invalid_grant = || {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response()
    };

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            let challenge = state.last_par().get("code_challenge").cloned();
            let verifier = form.get("code_verifier").map(|v| pkce_challenge(v));
            let same_key = state.par_jwk.lock().unwrap().as_ref() == Some(&jwk);
            if form.get("code").map(String::as_str) != Some(AUTH_CODE) || challenge != verifier || !same_key {
                return invalid_grant();
            }
            *state.bound_jwk.lock().unwrap() = Some(jwk);
            Json(state.issue_tokens()).into_response()
        }
        Some("refresh_token") => {
            let serial = state.token_serial.load(Ordering::SeqCst);
            let same_key = state.bound_jwk.lock().unwrap().as_ref() == Some(&jwk);
            if form.get("refresh_token") != Some(&format!("refresh-{serial}")) || !same_key {
                return invalid_grant();
            }
            state.refreshes.fetch_add(1, Ordering::SeqCst);
            Json(state.issue_tokens()).into_response()
        }
        _ => invalid_grant(),
    }
}

async fn revoke(State(state): Shared, headers: HeaderMap) -> Response {
    if let Err(response) = check_as_proof(&state, &headers, "/oauth/revoke") {
        return response;
    }
    state.revocations.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK.into_response()
}
