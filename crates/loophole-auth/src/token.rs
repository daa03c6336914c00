//! OAuth token storage and refresh
//!
//! Persists the access/refresh token pair as `~/.loophole/tokens.json` and
//! refreshes it against the token endpoint when the registration API rejects
//! the access token.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::AuthError;

/// OAuth token endpoint.
pub const TOKEN_URL: &str = "https://loophole.eu.auth0.com/oauth/token";
/// Device-authorization endpoint.
pub const DEVICE_CODE_URL: &str = "https://loophole.eu.auth0.com/oauth/device/code";
/// OAuth client id of the CLI.
pub const CLIENT_ID: &str = "f9lLqkCeBnHVkCwiHv1nEW2K9UIdH1vB";
/// Audience requested for access tokens.
pub const AUDIENCE: &str = "https://api.loophole.cloud";

/// The persisted token document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Error body returned by the token endpoint on 4xx responses.
#[derive(Debug, Deserialize)]
struct OauthErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// On-disk token store at a stable per-user location.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    token_url: String,
    client_id: String,
    http: reqwest::Client,
}

impl TokenStore {
    /// Open the store at `~/.loophole/tokens.json`.
    pub fn new() -> Result<Self, AuthError> {
        let home = dirs::home_dir().ok_or_else(|| {
            AuthError::IdentityUnavailable("cannot determine home directory".to_string())
        })?;
        Ok(Self::with_path(home.join(".loophole").join("tokens.json")))
    }

    /// Open the store at a custom path (used by tests).
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            token_url: TOKEN_URL.to_string(),
            client_id: CLIENT_ID.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the token endpoint (used by tests).
    pub fn with_token_url(mut self, url: String) -> Self {
        self.token_url = url;
        self
    }

    /// True iff a token document exists on disk.
    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Atomically overwrite the token document, mode `0644`.
    pub fn save(&self, pair: &TokenPair) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(pair)
            .map_err(|e| AuthError::UnexpectedResponse(format!("cannot serialize tokens: {}", e)))?;

        // Write-then-rename so a crash never leaves a torn document.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Saved tokens to {}", self.path.display());
        Ok(())
    }

    fn read(&self) -> Result<TokenPair, AuthError> {
        if !self.is_present() {
            return Err(AuthError::NotLoggedIn);
        }
        let json = fs::read_to_string(&self.path)?;
        serde_json::from_str(&json)
            .map_err(|e| AuthError::UnexpectedResponse(format!("corrupt token file: {}", e)))
    }

    /// The current access token.
    pub fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.read()?.access_token)
    }

    /// The current refresh token.
    pub fn refresh_token(&self) -> Result<String, AuthError> {
        Ok(self.read()?.refresh_token)
    }

    /// Remove the token document. Failure to remove an existing file is an
    /// error; a missing file is not.
    pub fn delete(&self) -> Result<(), AuthError> {
        if self.is_present() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Exchange the refresh token for a fresh token pair and persist it.
    ///
    /// The stored refresh token is merged into the response when the issuer
    /// omits it, so a refresh never discards the ability to refresh again.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let prior = self.read()?;
        info!("Refreshing access token...");

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", prior.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let mut fresh: TokenPair = response.json().await?;
            if fresh.refresh_token.is_empty() {
                fresh.refresh_token = prior.refresh_token;
            }
            self.save(&fresh)?;
            info!("Access token refreshed");
            return Ok(());
        }

        if status.is_client_error() {
            let body: OauthErrorBody = response.json().await.unwrap_or(OauthErrorBody {
                error: String::new(),
                error_description: None,
            });
            // Some deployments spell this error `invalid_grand`; treat it as
            // `invalid_grant` and note the encounter.
            if body.error == "invalid_grand" {
                warn!("Token endpoint returned misspelled error code `invalid_grand`");
            }
            return match body.error.as_str() {
                "expired_token" | "invalid_grant" | "invalid_grand" | "access_denied" => {
                    Err(AuthError::LoginRequired)
                }
                other => Err(AuthError::UnexpectedResponse(format!(
                    "{} ({})",
                    status,
                    body.error_description.unwrap_or_else(|| other.to_string())
                ))),
            };
        }

        Err(AuthError::UnexpectedResponse(status.to_string()))
    }
}
