//! AT URIs
//!
//! `at://{authority}/{collection}/{rkey}` where the authority is a DID or a
//! handle.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Parsed AT URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    host: String,
    collection: Option<String>,
    rkey: Option<String>,
}

impl AtUri {
    /// Parse an AT URI
    ///
    /// # Errors
    /// Returns `AppError::InvalidUri` if the scheme or authority is missing
    pub fn parse(uri: &str) -> Result<Self, AppError> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| AppError::InvalidUri(uri.to_string()))?;
        // Fragments and query strings are not part of record identity
        let rest = rest.split(['#', '?']).next().unwrap_or_default();

        let mut parts = rest.split('/');
        let host = parts
            .next()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| AppError::InvalidUri(uri.to_string()))?;
        let collection = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let rkey = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        if parts.next().is_some_and(|s| !s.is_empty()) {
            return Err(AppError::InvalidUri(uri.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            collection,
            rkey,
        })
    }

    /// Authority: a DID or a handle
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn rkey(&self) -> Option<&str> {
        self.rkey.as_deref()
    }

    /// `/{collection}/{rkey}` (empty for authority-only URIs)
    pub fn path(&self) -> String {
        match (&self.collection, &self.rkey) {
            (Some(collection), Some(rkey)) => format!("/{collection}/{rkey}"),
            (Some(collection), None) => format!("/{collection}"),
            _ => String::new(),
        }
    }

    pub fn is_did_authority(&self) -> bool {
        self.host.starts_with("did:")
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}{}", self.host, self.path())
    }
}

impl FromStr for AtUri {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
