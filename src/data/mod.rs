//! Data layer module
//!
//! - Query cache (volatile, process-wide)
//! - Normalized feed pages and AT URIs
//! - Device storage (SQLite)

mod cache;
mod models;
mod store;
mod uri;

pub use cache::{CacheStats, QueryCache, QueryKey};
pub use models::*;
pub use store::AccountStore;
pub use uri::AtUri;
