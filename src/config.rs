//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub oauth: OAuthConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    pub logging: LoggingConfig,
}

/// Remote service endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Default entryway (e.g., "https://bsky.social")
    ///
    /// Accounts whose issuer does not start with this are self-hosted.
    pub default_service: String,
    /// Unauthenticated appview used for trends
    pub public_api: String,
    /// `atproto-proxy` header value used for appview and community calls
    pub appview_proxy: String,
    /// Override for the `X-Bsky-Topics` header
    #[serde(default)]
    pub debug_topics: Option<String>,
    /// Comma separated content languages sent as `Accept-Language`
    pub content_languages: String,
    pub user_agent: String,
    /// Transport-level timeout in seconds
    pub timeout_seconds: u64,
}

/// OAuth client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Public origin hosting `oauth-client-metadata.json`
    pub base_url: String,
    pub client_name: String,
    pub scope: String,
    /// Service used to resolve handles to DIDs
    pub handle_resolver: String,
    pub plc_directory: String,
    /// Port for the loopback callback listener (0 picks a free port)
    pub loopback_port: u16,
}

/// Query cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Stale time for trends queries (default: 180)
    pub trending_stale_seconds: u64,
    /// Stale time for Open Collective link status (default: 300)
    pub link_status_stale_seconds: u64,
    /// Page size for community feed requests (default: 30)
    pub feed_page_size: u32,
}

/// Device storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Static feature gates evaluated at session establishment
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeatureConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (COMMUNITY_FEED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("service.default_service", "https://bsky.social")?
            .set_default("service.public_api", "https://public.api.bsky.app")?
            .set_default("service.appview_proxy", "did:web:api.bsky.app#bsky_appview")?
            .set_default("service.content_languages", "en")?
            .set_default("service.user_agent", "community-feed/0.1.0")?
            .set_default("service.timeout_seconds", 30)?
            .set_default("oauth.base_url", "https://blacksky.community")?
            .set_default("oauth.client_name", "Blacksky Community")?
            .set_default("oauth.scope", DEFAULT_OAUTH_SCOPE)?
            .set_default("oauth.handle_resolver", "https://bsky.social")?
            .set_default("oauth.plc_directory", "https://plc.directory")?
            .set_default("oauth.loopback_port", 0)?
            .set_default("cache.trending_stale_seconds", 180)?
            .set_default("cache.link_status_stale_seconds", 300)?
            .set_default("cache.feed_page_size", 30)?
            .set_default("storage.path", "data/community-feed.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("COMMUNITY_FEED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Transport timeout as a duration
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.service.timeout_seconds.max(1))
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !(1..=100).contains(&self.cache.feed_page_size) {
            return Err(AppError::Config(
                "cache.feed_page_size must be between 1 and 100".to_string(),
            ));
        }

        for (name, value) in [
            ("service.default_service", &self.service.default_service),
            ("service.public_api", &self.service.public_api),
            ("oauth.handle_resolver", &self.oauth.handle_resolver),
            ("oauth.plc_directory", &self.oauth.plc_directory),
        ] {
            url::Url::parse(value)
                .map_err(|e| AppError::Config(format!("{name} is not a valid URL: {e}")))?;
        }

        let base = url::Url::parse(&self.oauth.base_url)
            .map_err(|e| AppError::Config(format!("oauth.base_url is not a valid URL: {e}")))?;
        let host = base.host_str().unwrap_or_default();
        if is_loopback_host(host) {
            tracing::warn!(
                host = %host,
                "OAuth base URL is a loopback host; using loopback client metadata"
            );
        } else if base.scheme() != "https" {
            return Err(AppError::Config(
                "oauth.base_url must be https for non-loopback hosts".to_string(),
            ));
        }

        Ok(())
    }
}

/// Scope requested by the OAuth client
pub const DEFAULT_OAUTH_SCOPE: &str =
    "atproto transition:generic transition:email transition:chat.bsky";

/// Whether a host is treated as a loopback development host
///
/// The authorization server applies hardcoded metadata to these clients.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        service: ServiceConfig {
            default_service: "https://bsky.social".to_string(),
            public_api: "https://public.api.bsky.app".to_string(),
            appview_proxy: "did:web:api.bsky.app#bsky_appview".to_string(),
            debug_topics: None,
            content_languages: "en".to_string(),
            user_agent: "community-feed-test".to_string(),
            timeout_seconds: 5,
        },
        oauth: OAuthConfig {
            base_url: "https://blacksky.community".to_string(),
            client_name: "Blacksky Community".to_string(),
            scope: DEFAULT_OAUTH_SCOPE.to_string(),
            handle_resolver: "https://bsky.social".to_string(),
            plc_directory: "https://plc.directory".to_string(),
            loopback_port: 0,
        },
        cache: CacheConfig {
            trending_stale_seconds: 180,
            link_status_stale_seconds: 300,
            feed_page_size: 30,
        },
        storage: StorageConfig {
            path: PathBuf::from("/tmp/community-feed-test.db"),
        },
        features: FeatureConfig::default(),
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_oversized_page() {
        let mut config = test_config();
        config.cache.feed_page_size = 500;

        let error = config
            .validate()
            .expect_err("page sizes above 100 must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("feed_page_size")
        ));
    }

    #[test]
    fn validate_rejects_http_for_public_oauth_origin() {
        let mut config = test_config();
        config.oauth.base_url = "http://community.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public OAuth origins must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("oauth.base_url must be https")
        ));
    }

    #[test]
    fn validate_allows_http_loopback_origin() {
        let mut config = test_config();
        config.oauth.base_url = "http://127.0.0.1:8081".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loopback_hosts() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("[::1]"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("blacksky.community"));
        assert!(!is_loopback_host("10.0.0.1"));
    }
}
