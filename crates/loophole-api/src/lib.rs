//! Registration API client
//!
//! Claims (or reclaims) a public hostname bound to the tunnel's public key.
//! Authentication failures trigger a single token refresh and one retry;
//! every other non-success result code maps to a fatal, user-readable error.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use loophole_auth::{AuthError, TokenStore};

/// Registration API errors, classified by result code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(
        "the requested hostname was rejected: it must start with a letter and \
         contain only lowercase letters and digits (at least 6 characters \
         unless your plan allows shorter names)"
    )]
    HostnameRejected,

    #[error("authentication failed, please log in again with `loophole login`")]
    Unauthorized,

    #[error("you don't have permission to use the requested parameters")]
    Forbidden,

    #[error("the given hostname is already taken by another user, please pick a different one")]
    HostnameTaken,

    #[error("unexpected response from the registration API: {0}")]
    Unexpected(String),

    #[error("registration request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// The outcome of a successful registration: the assigned site identifier
/// plus the result code the gateway reported.
///
/// The identifier is sticky: the supervisor presents the same one on every
/// reconnect so the public hostname stays bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSpecification {
    pub host: String,
    pub result_code: u16,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RegisterResponse {
    #[serde(rename = "siteId")]
    site_id: String,
    #[serde(rename = "resultCode")]
    result_code: u16,
    error: Option<String>,
}

impl Default for RegisterResponse {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            result_code: 0,
            error: None,
        }
    }
}

/// Client for the hostname registration endpoint.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    api_url: String,
    tokens: TokenStore,
    http: reqwest::Client,
}

impl RegistrationClient {
    pub fn new(api_url: String, tokens: TokenStore) -> Self {
        Self {
            api_url,
            tokens,
            http: reqwest::Client::new(),
        }
    }

    /// Claim `requested_hostname` (or let the gateway assign one) for
    /// `public_key`.
    ///
    /// On a 401 the access token is refreshed and the request retried exactly
    /// once; a second 401 is fatal.
    pub async fn register(
        &self,
        public_key: &str,
        requested_hostname: Option<&str>,
    ) -> Result<SiteSpecification, ApiError> {
        if !self.tokens.is_present() {
            return Err(ApiError::Auth(AuthError::NotLoggedIn));
        }

        let mut refreshed = false;
        loop {
            let access_token = self.tokens.access_token()?;
            let response = self
                .http
                .post(format!("{}/api/site", self.api_url))
                .bearer_auth(access_token)
                .json(&RegisterRequest {
                    key: public_key,
                    id: requested_hostname,
                })
                .send()
                .await?;

            let status = response.status().as_u16();
            debug!("Registration endpoint answered {}", status);
            match status {
                200..=299 => {
                    let body: RegisterResponse = response.json().await?;
                    if body.site_id.is_empty() {
                        return Err(ApiError::Unexpected(
                            "response carried no site identifier".to_string(),
                        ));
                    }
                    return Ok(SiteSpecification {
                        host: body.site_id,
                        result_code: if body.result_code != 0 {
                            body.result_code
                        } else {
                            status
                        },
                        error: body.error,
                    });
                }
                400 => return Err(ApiError::HostnameRejected),
                401 => {
                    if refreshed {
                        return Err(ApiError::Unauthorized);
                    }
                    info!("Access token rejected, refreshing and retrying once");
                    self.tokens.refresh().await?;
                    refreshed = true;
                }
                403 => return Err(ApiError::Forbidden),
                409 => return Err(ApiError::HostnameTaken),
                600 | 601 => return Err(ApiError::Auth(AuthError::NotLoggedIn)),
                other => return Err(ApiError::Unexpected(format!("status {}", other))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_omits_absent_hostname() {
        let body = serde_json::to_value(RegisterRequest {
            key: "ssh-ed25519 AAAA",
            id: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"key": "ssh-ed25519 AAAA"}));
    }

    #[test]
    fn register_response_tolerates_missing_fields() {
        let body: RegisterResponse = serde_json::from_str(r#"{"siteId": "abc123"}"#).unwrap();
        assert_eq!(body.site_id, "abc123");
        assert_eq!(body.result_code, 0);
        assert!(body.error.is_none());
    }
}
