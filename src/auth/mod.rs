//! atproto OAuth authentication
//!
//! Handles:
//! - OAuth client identity and the PKCE authorization flow
//! - Session establishment from an authorized OAuth session
//! - Current session lifecycle
//! - Loopback redirect receiver for the command line

pub mod agent;
mod callback;
pub mod oauth;
mod session;

pub use agent::{
    Agent, AuthContext, EstablishedSession, FeatureGates, LoginOutcome, StaticFeatureGates,
    finish_oauth_callback, oauth_create_agent, oauth_resume_session, session_account_from_oauth,
};
pub use callback::CallbackListener;
pub use oauth::{
    AuthorizationServerMetadata, CallbackParams, OAuthClient, OAuthClientMetadata, OAuthSession,
    PkceOAuthClient, pkce_challenge,
};
pub use session::SessionManager;
