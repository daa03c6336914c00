//! Authentication for the tunnel client
//!
//! Covers the SSH identity used to authenticate against the gateway, the
//! OAuth token pair used against the registration API, and the
//! device-authorization login flow that obtains that pair.

pub mod device;
pub mod identity;
pub mod terminal;
pub mod token;

pub use identity::Identity;
pub use token::{TokenPair, TokenStore};

use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("not logged in, please run `loophole login` first")]
    NotLoggedIn,

    #[error("session expired, please log in again with `loophole login`")]
    LoginRequired,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("unexpected response from the token endpoint: {0}")]
    UnexpectedResponse(String),

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token store error: {0}")]
    Io(#[from] std::io::Error),
}
