//! Token Resolver (§4.2)
//!
//! Exposes `get_token_for_account` and `get_project_for_account`, each
//! backed by its own cache. The token cache is time-boxed
//! (`TOKEN_REFRESH_INTERVAL_MILLIS`); the project cache has no TTL and is
//! only cleared by an authentication failure or an explicit admin reset.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::constants::{DEFAULT_PROJECT_ID, TOKEN_REFRESH_INTERVAL_MILLIS};
use crate::credentials::{Account, CredentialSource};
use crate::error::{Error, Result};
use crate::{database, project, token};

struct TokenCacheEntry {
    token: String,
    extracted_at: u64,
}

/// Per-account token and project caches, shared across requests.
pub struct TokenResolver {
    http_client: reqwest::Client,
    token_cache: RwLock<HashMap<String, TokenCacheEntry>>,
    project_cache: RwLock<HashMap<String, String>>,
}

impl TokenResolver {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            token_cache: RwLock::new(HashMap::new()),
            project_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a usable access token for `account`.
    ///
    /// On an `oauth` refresh failure, returns `AUTH_INVALID`-shaped error
    /// (`Error::InvalidCredentials`) naming the email; callers are expected
    /// to mark the account invalid on this specific variant.
    pub async fn get_token_for_account(&self, account: &Account) -> Result<String> {
        let now = common::now_millis();

        if let Some(entry) = self.token_cache.read().await.get(&account.email)
            && now.saturating_sub(entry.extracted_at) < TOKEN_REFRESH_INTERVAL_MILLIS
        {
            return Ok(entry.token.clone());
        }

        let resolved = match account.source {
            CredentialSource::Manual => account
                .credential
                .api_key
                .clone()
                .ok_or_else(|| Error::InvalidCredentials(format!(
                    "{} has source=manual but no api_key configured",
                    account.email
                )))?,
            CredentialSource::Oauth => {
                let refresh = account.credential.refresh_token.as_deref().ok_or_else(|| {
                    Error::InvalidCredentials(format!(
                        "{} has source=oauth but no refresh_token configured",
                        account.email
                    ))
                })?;
                match token::refresh_token(&self.http_client, refresh).await {
                    Ok(response) => response.access_token,
                    Err(e) => {
                        warn!(email = %account.email, error = %e, "oauth token refresh failed");
                        return Err(Error::InvalidCredentials(format!(
                            "{}: token refresh failed: {e}",
                            account.email
                        )));
                    }
                }
            }
            CredentialSource::Database => {
                let path = account.credential.database_path.as_deref().ok_or_else(|| {
                    Error::InvalidCredentials(format!(
                        "{} has source=database but no database_path configured",
                        account.email
                    ))
                })?;
                database::extract_access_token(path, &account.email)
                    .await
                    .map_err(|e| Error::InvalidCredentials(format!("{}: {e}", account.email)))?
            }
        };

        self.token_cache.write().await.insert(
            account.email.clone(),
            TokenCacheEntry {
                token: resolved.clone(),
                extracted_at: now,
            },
        );
        info!(email = %account.email, "resolved access token");
        Ok(resolved)
    }

    /// Resolve a project id for `account`, given its (already resolved)
    /// access token.
    pub async fn get_project_for_account(&self, account: &Account, access_token: &str) -> String {
        if let Some(cached) = self.project_cache.read().await.get(&account.email) {
            return cached.clone();
        }

        if let Some(project_id) = &account.project_id {
            self.project_cache
                .write()
                .await
                .insert(account.email.clone(), project_id.clone());
            return project_id.clone();
        }

        let discovered = project::discover_project(&self.http_client, access_token).await;
        let resolved = discovered.unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
        self.project_cache
            .write()
            .await
            .insert(account.email.clone(), resolved.clone());
        resolved
    }

    /// Clear the token cache for one account, or every account if `email`
    /// is `None`. Called on authentication failure.
    pub async fn clear_token_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.token_cache.write().await.remove(email);
            }
            None => self.token_cache.write().await.clear(),
        }
    }

    /// Clear the project cache for one account, or every account if `email`
    /// is `None`. Called on authentication failure.
    pub async fn clear_project_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.project_cache.write().await.remove(email);
            }
            None => self.project_cache.write().await.clear(),
        }
    }
}
