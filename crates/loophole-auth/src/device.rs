//! Device-authorization login flow
//!
//! Obtains the initial token pair: requests a device code, points the
//! operator at the verification URL, then polls the token endpoint until
//! the grant is approved or expires.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::token::{AUDIENCE, CLIENT_ID, DEVICE_CODE_URL, TOKEN_URL};
use crate::{AuthError, TokenPair, TokenStore};

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri_complete: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct PollErrorBody {
    #[serde(default)]
    error: String,
}

/// Run the device-authorization flow and persist the resulting tokens.
pub async fn login(store: &TokenStore) -> Result<(), AuthError> {
    let http = reqwest::Client::new();

    let device: DeviceCodeResponse = http
        .post(DEVICE_CODE_URL)
        .form(&[
            ("client_id", CLIENT_ID),
            ("scope", "openid offline_access"),
            ("audience", AUDIENCE),
        ])
        .send()
        .await?
        .error_for_status()
        .map_err(|e| AuthError::LoginFailed(format!("device code request rejected: {}", e)))?
        .json()
        .await?;

    println!("To log in, open the following URL in your browser:");
    println!();
    println!("  {}", device.verification_uri_complete);
    println!();
    println!("and confirm that it shows this code: {}", device.user_code);

    let mut interval = device.interval.max(1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(AuthError::LoginFailed(
                "the device code expired before the login was confirmed".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;

        let response = http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device.device_code.as_str()),
                ("client_id", CLIENT_ID),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            let pair: TokenPair = response.json().await?;
            store.save(&pair)?;
            return Ok(());
        }

        let body: PollErrorBody = response.json().await.unwrap_or(PollErrorBody {
            error: String::new(),
        });
        match body.error.as_str() {
            "authorization_pending" => {
                debug!("Authorization pending, polling again in {}s", interval);
            }
            "slow_down" => {
                interval += 5;
                debug!("Token endpoint asked to slow down, interval now {}s", interval);
            }
            "expired_token" => {
                return Err(AuthError::LoginFailed(
                    "the device code expired before the login was confirmed".to_string(),
                ))
            }
            "access_denied" => {
                return Err(AuthError::LoginFailed("the login was denied".to_string()))
            }
            other => {
                return Err(AuthError::UnexpectedResponse(format!(
                    "device flow returned `{}`",
                    other
                )))
            }
        }
    }
}
