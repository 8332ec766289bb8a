//! API layer
//!
//! Remote calls made by the client:
//! - XRPC transport and DPoP proofs
//! - Community feed endpoints
//! - Lexicon wire types

mod community;
pub mod dpop;
mod dto;
mod feed_utils;
pub mod xrpc;

pub use community::*;
pub use dpop::DpopKey;
pub use dto::*;
pub use feed_utils::*;
pub use xrpc::{Auth, XrpcClient, XrpcRequest};

pub(crate) use dto::lenient_vec;
