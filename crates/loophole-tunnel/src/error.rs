//! Tunnel error taxonomy
//!
//! Everything here is fatal to the process except the session drop, which is
//! represented as `None` from the gateway accept and drives reconnection
//! instead of surfacing as an error.

use thiserror::Error;

use loophole_api::ApiError;
use loophole_auth::AuthError;
use loophole_cert::CertError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Dialing SSH Gateway at {addr} failed: {reason}")]
    GatewayDial { addr: String, reason: String },

    #[error("the gateway refused the remote listener: {0}")]
    RemoteListener(String),

    #[error("local TLS proxy failed: {0}")]
    LocalProxy(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("SSH transport error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
