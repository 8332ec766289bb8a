//! Community XRPC helpers
//!
//! `community.blacksky.feed.*` calls go through the PDS, which checks the
//! session and forwards them to the appview named by the client's
//! `atproto-proxy` header.

use super::dto::{CommunityPostResponse, PostView};
use super::xrpc::{XrpcClient, XrpcRequest};
use crate::data::FeedPage;
use crate::error::XrpcError;

pub const GET_COMMUNITY_FEED: &str = "community.blacksky.feed.getCommunityFeed";
pub const GET_COMMUNITY_TIMELINE: &str = "community.blacksky.feed.getCommunityTimeline";
pub const GET_COMMUNITY_POST: &str = "community.blacksky.feed.getCommunityPost";

/// One page of an actor's community feed
///
/// # Arguments
/// * `actor` - DID or handle of the feed owner
/// * `limit` - Page size
/// * `cursor` - Cursor returned by the previous page, if any
pub async fn get_community_feed(
    client: &XrpcClient,
    actor: &str,
    limit: u32,
    cursor: Option<&str>,
) -> Result<FeedPage, XrpcError> {
    let request = XrpcRequest::query(GET_COMMUNITY_FEED)
        .param("actor", actor)
        .param("limit", limit)
        .opt_param("cursor", cursor.filter(|c| !c.is_empty()));
    client.send(request).await
}

/// One page of the global community timeline
pub async fn get_community_timeline(
    client: &XrpcClient,
    limit: u32,
    cursor: Option<&str>,
) -> Result<FeedPage, XrpcError> {
    let request = XrpcRequest::query(GET_COMMUNITY_TIMELINE)
        .param("limit", limit)
        .opt_param("cursor", cursor.filter(|c| !c.is_empty()));
    client.send(request).await
}

/// A single community post
pub async fn get_community_post(client: &XrpcClient, uri: &str) -> Result<PostView, XrpcError> {
    let request = XrpcRequest::query(GET_COMMUNITY_POST).param("uri", uri);
    let response: CommunityPostResponse = client.send(request).await?;
    Ok(response.post)
}
