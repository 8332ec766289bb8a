//! XRPC client
//!
//! Thin wrapper over `reqwest` that issues `GET/POST /xrpc/{method}` calls
//! with routing and auth headers, and maps failures to [`XrpcError`].
//! Sessions holding a DPoP key sign every call with it.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use super::dpop::{DPOP_HEADER, DpopKey};
use crate::error::XrpcError;
use crate::metrics::{XRPC_REQUEST_DURATION_SECONDS, XRPC_REQUESTS_TOTAL};

/// Header used to route a call through the PDS to another service
pub const PROXY_HEADER: &str = "atproto-proxy";

/// Credentials attached to every call of a client
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Legacy app-password or service token
    Bearer(String),
    /// OAuth access token, sent with its token type
    OAuth {
        token_type: String,
        access_token: String,
        /// Key the token is bound to; calls carry a proof signed with it
        dpop: Option<Arc<DpopKey>>,
    },
}

impl Auth {
    fn header_value(&self) -> String {
        match self {
            Auth::Bearer(token) => format!("Bearer {}", token),
            Auth::OAuth {
                token_type,
                access_token,
                ..
            } => format!("{} {}", token_type, access_token),
        }
    }

    /// Raw access token
    pub fn token(&self) -> &str {
        match self {
            Auth::Bearer(token) => token,
            Auth::OAuth { access_token, .. } => access_token,
        }
    }

    /// DPoP key of a bound token
    pub fn dpop(&self) -> Option<&DpopKey> {
        match self {
            Auth::OAuth {
                dpop: Some(key), ..
            } => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Bearer(_) => f.write_str("Auth::Bearer(..)"),
            Auth::OAuth { token_type, .. } => write!(f, "Auth::OAuth({token_type}, ..)"),
        }
    }
}

/// XRPC error body
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// A single XRPC call
#[derive(Debug, Clone)]
pub struct XrpcRequest {
    method: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl XrpcRequest {
    /// Query (GET) call
    pub fn query(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Procedure (POST) call; becomes a POST once a body is attached
    pub fn procedure(method: impl Into<String>) -> Self {
        Self::query(method)
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn opt_param(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// Route the call with an explicit `atproto-proxy` value
    pub fn proxy(self, value: impl Into<String>) -> Self {
        self.header(PROXY_HEADER, value)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, XrpcError> {
        let value = serde_json::to_value(body).map_err(|e| XrpcError::decode(&self.method, e))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn http_method(&self) -> Method {
        if self.body.is_some() {
            Method::POST
        } else {
            Method::GET
        }
    }

    /// Path and query string, e.g. `/xrpc/app.bsky.feed.getTimeline?limit=30`
    pub fn path(&self) -> String {
        let mut path = format!("/xrpc/{}", self.method);
        if !self.params.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            path.push('?');
            path.push_str(&query);
        }
        path
    }
}

/// Client bound to one service origin
#[derive(Clone)]
pub struct XrpcClient {
    http: Arc<reqwest::Client>,
    service: String,
    auth: Option<Auth>,
    proxy: Option<String>,
}

impl XrpcClient {
    /// Create a client for a service origin (e.g. a PDS URL)
    pub fn new(http: Arc<reqwest::Client>, service: impl Into<String>) -> Self {
        Self {
            http,
            service: service.into().trim_end_matches('/').to_string(),
            auth: None,
            proxy: None,
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Default `atproto-proxy` header for calls that do not set one
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Rebind to another service origin, keeping auth and proxy
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into().trim_end_matches('/').to_string();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn http(&self) -> &Arc<reqwest::Client> {
        &self.http
    }

    /// Issue an XRPC call and decode the JSON output
    pub async fn send<T: DeserializeOwned>(&self, request: XrpcRequest) -> Result<T, XrpcError> {
        let url = format!("{}{}", self.service, request.path());
        let method = request.http_method();
        let decorate = |builder: RequestBuilder| self.decorate(builder, &request);

        let bound = self
            .auth
            .as_ref()
            .and_then(|auth| auth.dpop().map(|key| (key, auth.token())));
        let response = match bound {
            Some((dpop, token)) => {
                send_with_dpop(&request.method, &self.http, method, &url, dpop, Some(token), decorate)
                    .await?
            }
            None => dispatch(&request.method, decorate(self.http.request(method, &url)), None).await?,
        };

        decode(&request.method, response).await
    }

    /// Routing, auth and body of a call
    fn decorate(&self, mut builder: RequestBuilder, request: &XrpcRequest) -> RequestBuilder {
        let has_proxy = request
            .headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(PROXY_HEADER));
        if !has_proxy {
            if let Some(proxy) = &self.proxy {
                builder = builder.header(PROXY_HEADER, proxy);
            }
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.header_value());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

/// Send a request and decode a JSON body, mapping failures to [`XrpcError`]
///
/// Shared by XRPC calls and plain JSON endpoints. `label` names the call in
/// errors, logs and metrics.
pub async fn fetch_json<T: DeserializeOwned>(
    label: &str,
    builder: RequestBuilder,
) -> Result<T, XrpcError> {
    decode(label, dispatch(label, builder, None).await?).await
}

/// Send a request with a DPoP proof and decode a JSON body
///
/// `decorate` adds everything but the proof; it runs again when the request
/// is retried.
pub async fn fetch_json_with_dpop<T, F>(
    label: &str,
    http: &reqwest::Client,
    method: Method,
    url: &str,
    dpop: &DpopKey,
    access_token: Option<&str>,
    decorate: F,
) -> Result<T, XrpcError>
where
    T: DeserializeOwned,
    F: Fn(RequestBuilder) -> RequestBuilder,
{
    let response = send_with_dpop(label, http, method, url, dpop, access_token, decorate).await?;
    decode(label, response).await
}

/// Send a request with a DPoP proof, retrying once when the server demands
/// a fresh nonce
///
/// # Errors
/// Returns the mapped error of any non-2xx response
pub async fn send_with_dpop<F>(
    label: &str,
    http: &reqwest::Client,
    method: Method,
    url: &str,
    dpop: &DpopKey,
    access_token: Option<&str>,
    decorate: F,
) -> Result<Response, XrpcError>
where
    F: Fn(RequestBuilder) -> RequestBuilder,
{
    let url = Url::parse(url).map_err(|e| XrpcError::signing(label, e))?;
    let mut retried = false;

    loop {
        let proof = dpop.proof(label, &method, &url, access_token)?;
        let builder = decorate(http.request(method.clone(), url.clone())).header(DPOP_HEADER, proof);
        match dispatch(label, builder, Some(dpop)).await {
            Err(err) if !retried && err.is_nonce_challenge() => {
                tracing::debug!(method = %label, "Retrying with server-issued DPoP nonce");
                retried = true;
            }
            result => return result,
        }
    }
}

/// Send a request, record metrics and map transport and status failures
async fn dispatch(
    label: &str,
    builder: RequestBuilder,
    dpop: Option<&DpopKey>,
) -> Result<Response, XrpcError> {
    let started = Instant::now();
    let observe = |status: &str| {
        XRPC_REQUESTS_TOTAL
            .with_label_values(&[label, status])
            .inc();
        XRPC_REQUEST_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());
    };

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            observe("transport");
            tracing::debug!(method = %label, error = %err, "Request failed before a response");
            return Err(XrpcError::transport(label, err));
        }
    };

    let status = response.status();
    observe(status.as_str());
    tracing::debug!(method = %label, status = status.as_u16(), "Request completed");

    if let Some(dpop) = dpop {
        dpop.remember_nonce(response.url(), response.headers());
    }
    if !status.is_success() {
        return Err(status_error(label, status, response).await);
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(label: &str, response: Response) -> Result<T, XrpcError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| XrpcError::transport(label, err))?;
    serde_json::from_slice(&bytes).map_err(|err| XrpcError::decode(label, err))
}

async fn status_error(label: &str, status: StatusCode, response: Response) -> XrpcError {
    // Resource servers may report the error only in the challenge
    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(challenge_error);
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    XrpcError::Status {
        method: label.to_string(),
        status: status.as_u16(),
        error: body.error.or(challenge),
        message: body.message,
    }
}

/// `error` parameter of a `WWW-Authenticate` challenge
fn challenge_error(challenge: &str) -> Option<String> {
    let (_, rest) = challenge.split_once("error=\"")?;
    let (error, _) = rest.split_once('"')?;
    Some(error.to_string())
}
