//! Open Collective account linking
//!
//! Plain JSON endpoints on the account's service, authenticated with the
//! session access token.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::api::xrpc::fetch_json;
use crate::api::{OcLinkResponse, OcLinkStatus, XrpcClient};
use crate::data::{QueryCache, QueryKey};
use crate::error::{AppError, Result, XrpcError};

pub const OC_LINK_STATUS_NAMESPACE: &str = "oc-link-status";

#[derive(Serialize)]
struct InitLinkBody<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct VerifyEmailBody<'a> {
    email: &'a str,
    code: &'a str,
}

/// Link status queries and link mutations
#[derive(Clone)]
pub struct OpenCollectiveService {
    cache: QueryCache<OcLinkStatus>,
    stale_time: Duration,
}

impl OpenCollectiveService {
    pub fn new(stale_time: Duration) -> Self {
        Self {
            cache: QueryCache::new(),
            stale_time,
        }
    }

    fn key(did: &str) -> QueryKey {
        QueryKey::new(OC_LINK_STATUS_NAMESPACE, [did])
    }

    /// Link status of an account, cached per DID
    ///
    /// # Errors
    /// Returns `AppError::Validation` without a DID, `AppError::Unauthorized`
    /// without an access token, or the remote error
    pub async fn link_status(&self, client: &XrpcClient, did: Option<&str>) -> Result<Arc<OcLinkStatus>> {
        let did = did
            .filter(|did| !did.is_empty())
            .ok_or_else(|| AppError::Validation("link status query is disabled".to_string()))?;
        let request = client
            .http()
            .get(format!("{}/api/oc/link-status", client.service()))
            .bearer_auth(access_token(client)?);

        self.cache
            .get_or_fetch(&Self::key(did), self.stale_time, move |_| async move {
                fetch_json::<OcLinkStatus>("oc.linkStatus", request)
                    .await
                    .map_err(|err| with_message(err, "Failed to fetch OC link status"))
            })
            .await
            .map_err(|err| AppError::from(err).record())
    }

    /// Start linking an email address
    ///
    /// On success the current account's link status is invalidated.
    pub async fn init_link(
        &self,
        client: &XrpcClient,
        current_did: Option<&str>,
        email: &str,
    ) -> Result<OcLinkResponse> {
        let request = client
            .http()
            .post(format!("{}/api/oc/init-link", client.service()))
            .bearer_auth(access_token(client)?)
            .json(&InitLinkBody { email });

        let response = fetch_json::<OcLinkResponse>("oc.initLink", request)
            .await
            .map_err(|err| AppError::from(with_message(err, "Failed to initiate OC link")).record())?;
        self.invalidate(current_did).await;
        tracing::info!(status = ?response, "Initiated Open Collective link");
        Ok(response)
    }

    /// Confirm an email address with the code sent to it
    pub async fn verify_email(
        &self,
        client: &XrpcClient,
        current_did: Option<&str>,
        email: &str,
        code: &str,
    ) -> Result<OcLinkResponse> {
        let request = client
            .http()
            .post(format!("{}/api/oc/verify-email", client.service()))
            .bearer_auth(access_token(client)?)
            .json(&VerifyEmailBody { email, code });

        let response = fetch_json::<OcLinkResponse>("oc.verifyEmail", request)
            .await
            .map_err(|err| AppError::from(with_message(err, "Failed to verify email")).record())?;
        self.invalidate(current_did).await;
        Ok(response)
    }

    /// Drop every cached link status
    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    async fn invalidate(&self, current_did: Option<&str>) {
        if let Some(did) = current_did.filter(|did| !did.is_empty()) {
            self.cache.invalidate(&Self::key(did)).await;
        }
    }
}

fn access_token(client: &XrpcClient) -> Result<&str> {
    client
        .auth()
        .map(|auth| auth.token())
        .ok_or_else(|| AppError::Unauthorized("Expected an active session".to_string()))
}

fn with_message(err: XrpcError, message: &str) -> XrpcError {
    match err {
        XrpcError::Status {
            method,
            status,
            error,
            ..
        } => XrpcError::Status {
            method,
            status,
            error,
            message: Some(message.to_string()),
        },
        other => other,
    }
}
