//! Device storage
//!
//! SQLite persistence for accounts, OAuth tokens, pending authorizations
//! and settings. Uses SQLx with embedded migrations.

use std::path::Path;

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};

use super::models::{OAuthTokenSet, PendingAuthorization, SessionAccount};
use crate::error::AppError;

/// Setting key holding the DID of the current account
const CURRENT_ACCOUNT_KEY: &str = "current_account";

/// Pending authorizations older than this are rejected
const PENDING_AUTHORIZATION_TTL_MINUTES: i64 = 10;

/// Connection pool wrapper for device storage
#[derive(Clone)]
pub struct AccountStore {
    pool: Pool<Sqlite>,
}

impl AccountStore {
    /// Connect to the store file
    ///
    /// Creates the file and its parent directory if missing and runs pending
    /// migrations.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;
        Self::migrate(pool).await
    }

    /// In-memory store, for tests and throwaway sessions
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        // Each connection of an in-memory database is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: Pool<Sqlite>) -> Result<Self, AppError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::from(e)
            })?;

        tracing::info!("Device storage connected and migrated");
        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create or update an account
    pub async fn upsert_account(&self, account: &SessionAccount) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                did, handle, service, pds_url, email, email_confirmed,
                email_auth_factor, active, status, is_self_hosted,
                is_oauth_session, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(did) DO UPDATE SET
                handle = excluded.handle,
                service = excluded.service,
                pds_url = excluded.pds_url,
                email = excluded.email,
                email_confirmed = excluded.email_confirmed,
                email_auth_factor = excluded.email_auth_factor,
                active = excluded.active,
                status = excluded.status,
                is_self_hosted = excluded.is_self_hosted,
                is_oauth_session = excluded.is_oauth_session
            "#,
        )
        .bind(&account.did)
        .bind(&account.handle)
        .bind(&account.service)
        .bind(&account.pds_url)
        .bind(&account.email)
        .bind(account.email_confirmed)
        .bind(account.email_auth_factor)
        .bind(account.active)
        .bind(&account.status)
        .bind(account.is_self_hosted)
        .bind(account.is_oauth_session)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get an account by DID
    pub async fn get_account(&self, did: &str) -> Result<Option<SessionAccount>, AppError> {
        let account = sqlx::query_as::<_, SessionAccount>("SELECT * FROM accounts WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// All accounts, oldest first
    pub async fn list_accounts(&self) -> Result<Vec<SessionAccount>, AppError> {
        let accounts =
            sqlx::query_as::<_, SessionAccount>("SELECT * FROM accounts ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(accounts)
    }

    /// Remove an account with its tokens
    ///
    /// Clears the current-account pointer if it referenced this account.
    pub async fn remove_account(&self, did: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM accounts WHERE did = ?")
            .bind(did)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM oauth_tokens WHERE did = ?")
            .bind(did)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM settings WHERE key = ? AND value = ?")
            .bind(CURRENT_ACCOUNT_KEY)
            .bind(did)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark an account as the current one
    pub async fn set_current_account(&self, did: &str) -> Result<(), AppError> {
        self.set_setting(CURRENT_ACCOUNT_KEY, did).await
    }

    /// Current account, if one is set and still stored
    pub async fn current_account(&self) -> Result<Option<SessionAccount>, AppError> {
        match self.get_setting(CURRENT_ACCOUNT_KEY).await? {
            Some(did) => self.get_account(&did).await,
            None => Ok(None),
        }
    }

    // =========================================================================
    // OAuth tokens
    // =========================================================================

    /// Store the token set of an account, replacing any previous one
    pub async fn save_oauth_tokens(&self, tokens: &OAuthTokenSet) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO oauth_tokens (
                did, issuer, pds_url, token_endpoint, token_type,
                access_token, refresh_token, scope, expires_at, dpop_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tokens.did)
        .bind(&tokens.issuer)
        .bind(&tokens.pds_url)
        .bind(&tokens.token_endpoint)
        .bind(&tokens.token_type)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(&tokens.scope)
        .bind(tokens.expires_at)
        .bind(&tokens.dpop_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_oauth_tokens(&self, did: &str) -> Result<Option<OAuthTokenSet>, AppError> {
        let tokens = sqlx::query_as::<_, OAuthTokenSet>("SELECT * FROM oauth_tokens WHERE did = ?")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(tokens)
    }

    pub async fn delete_oauth_tokens(&self, did: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM oauth_tokens WHERE did = ?")
            .bind(did)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Pending authorizations
    // =========================================================================

    /// Remember an authorization until its callback arrives
    pub async fn save_pending_authorization(
        &self,
        pending: &PendingAuthorization,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO pending_authorizations (
                state, code_verifier, issuer, token_endpoint, redirect_uri,
                did, pds_url, dpop_key, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pending.state)
        .bind(&pending.code_verifier)
        .bind(&pending.issuer)
        .bind(&pending.token_endpoint)
        .bind(&pending.redirect_uri)
        .bind(&pending.did)
        .bind(&pending.pds_url)
        .bind(&pending.dpop_key)
        .bind(pending.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Consume a pending authorization
    ///
    /// # Returns
    /// The authorization, or None if the state is unknown, already used or
    /// expired
    pub async fn take_pending_authorization(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorization>, AppError> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query_as::<_, PendingAuthorization>(
            "SELECT * FROM pending_authorizations WHERE state = ?",
        )
        .bind(state)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pending_authorizations WHERE state = ?")
            .bind(state)
            .execute(&mut *tx)
            .await?;

        let cutoff = Utc::now() - Duration::minutes(PENDING_AUTHORIZATION_TTL_MINUTES);
        sqlx::query("DELETE FROM pending_authorizations WHERE created_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(pending.filter(|pending| {
            let fresh = pending.created_at >= cutoff;
            if !fresh {
                tracing::warn!(state = %pending.state, "Pending authorization expired");
            }
            fresh
        }))
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Get setting value
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Set setting value
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Helper to create a test store
    async fn create_test_store() -> (AccountStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = AccountStore::connect(&db_path).await.unwrap();
        (store, temp_dir)
    }

    fn account(did: &str, handle: &str) -> SessionAccount {
        SessionAccount {
            did: did.to_string(),
            handle: handle.to_string(),
            service: "https://bsky.social".to_string(),
            pds_url: Some("https://pds.example.com".to_string()),
            email: Some("alice@example.com".to_string()),
            email_confirmed: Some(true),
            email_auth_factor: Some(false),
            active: Some(true),
            status: None,
            is_self_hosted: false,
            is_oauth_session: true,
            created_at: Utc::now(),
        }
    }

    fn tokens(did: &str) -> OAuthTokenSet {
        OAuthTokenSet {
            did: did.to_string(),
            issuer: "https://bsky.social".to_string(),
            pds_url: "https://pds.example.com".to_string(),
            token_endpoint: "https://bsky.social/oauth/token".to_string(),
            token_type: "DPoP".to_string(),
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            scope: "atproto".to_string(),
            expires_at: None,
            dpop_key: "key".to_string(),
        }
    }

    fn pending(state: &str, created_at: chrono::DateTime<Utc>) -> PendingAuthorization {
        PendingAuthorization {
            state: state.to_string(),
            code_verifier: "verifier".to_string(),
            issuer: "https://bsky.social".to_string(),
            token_endpoint: "https://bsky.social/oauth/token".to_string(),
            redirect_uri: "http://127.0.0.1/".to_string(),
            did: None,
            pds_url: None,
            dpop_key: "key".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_account_roundtrip_and_current() {
        let (store, _temp_dir) = create_test_store().await;
        let alice = account("did:plc:alice", "alice.test");

        store.upsert_account(&alice).await.unwrap();
        store.set_current_account(&alice.did).await.unwrap();

        let current = store.current_account().await.unwrap().unwrap();
        assert_eq!(current.handle, "alice.test");
        assert_eq!(current.email_confirmed, Some(true));
        assert!(current.is_oauth_session);

        let renamed = SessionAccount {
            handle: "alice2.test".to_string(),
            ..alice.clone()
        };
        store.upsert_account(&renamed).await.unwrap();
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
        assert_eq!(
            store.get_account(&alice.did).await.unwrap().unwrap().handle,
            "alice2.test"
        );
    }

    #[tokio::test]
    async fn test_remove_account_drops_tokens_and_current() {
        let store = AccountStore::connect_in_memory().await.unwrap();
        let alice = account("did:plc:alice", "alice.test");
        store.upsert_account(&alice).await.unwrap();
        store.save_oauth_tokens(&tokens(&alice.did)).await.unwrap();
        store.set_current_account(&alice.did).await.unwrap();

        store.remove_account(&alice.did).await.unwrap();

        assert!(store.get_account(&alice.did).await.unwrap().is_none());
        assert!(store.get_oauth_tokens(&alice.did).await.unwrap().is_none());
        assert!(store.current_account().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oauth_tokens_replace() {
        let store = AccountStore::connect_in_memory().await.unwrap();
        store.save_oauth_tokens(&tokens("did:plc:alice")).await.unwrap();

        let refreshed = OAuthTokenSet {
            access_token: "access2".to_string(),
            ..tokens("did:plc:alice")
        };
        store.save_oauth_tokens(&refreshed).await.unwrap();

        let stored = store.get_oauth_tokens("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access2");

        store.delete_oauth_tokens("did:plc:alice").await.unwrap();
        assert!(store.get_oauth_tokens("did:plc:alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_authorization_is_single_use() {
        let store = AccountStore::connect_in_memory().await.unwrap();
        store
            .save_pending_authorization(&pending("s1", Utc::now()))
            .await
            .unwrap();

        let taken = store.take_pending_authorization("s1").await.unwrap();
        assert_eq!(taken.unwrap().code_verifier, "verifier");
        assert!(store.take_pending_authorization("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_authorization_expires() {
        let store = AccountStore::connect_in_memory().await.unwrap();
        store
            .save_pending_authorization(&pending("old", Utc::now() - Duration::minutes(11)))
            .await
            .unwrap();

        assert!(store.take_pending_authorization("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings() {
        let store = AccountStore::connect_in_memory().await.unwrap();
        assert!(store.get_setting("theme").await.unwrap().is_none());
        store.set_setting("theme", "dim").await.unwrap();
        store.set_setting("theme", "dark").await.unwrap();
        assert_eq!(store.get_setting("theme").await.unwrap().as_deref(), Some("dark"));
    }
}
