//! Gateway session
//!
//! An authenticated SSH session to the gateway carrying a remote listener:
//! the gateway accepts public connections on its side and hands them back
//! through the session as forwarded-tcpip channels.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelStream, Disconnect};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use loophole_auth::Identity;

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Gateway-side bind address of the remote listener. The gateway maps the
/// site's public hostname traffic onto this logical listener.
const REMOTE_FORWARD_HOST: &str = "127.0.0.1";
const REMOTE_FORWARD_PORT: u32 = 80;

/// Dial attempts before giving up.
pub const DIAL_ATTEMPTS: u32 = 5;
/// Pause between dial attempts.
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(10);

struct GatewayHandler {
    incoming: mpsc::UnboundedSender<Channel<Msg>>,
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    // TODO: pin the gateway host key once the registration API serves it;
    // until then any presented key is accepted.
    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Incoming public connection {}:{} -> {}:{}",
            originator_address, originator_port, connected_address, connected_port
        );
        if self.incoming.send(channel).is_err() {
            debug!("Session is shutting down, dropping incoming connection");
        }
        Ok(())
    }
}

/// An established gateway session with its remote listener.
pub struct GatewaySession {
    handle: client::Handle<GatewayHandler>,
    incoming: mpsc::UnboundedReceiver<Channel<Msg>>,
}

impl GatewaySession {
    /// Dial the gateway and open the remote listener, retrying up to
    /// [`DIAL_ATTEMPTS`] times at [`DIAL_RETRY_INTERVAL`].
    pub async fn connect(
        config: &TunnelConfig,
        identity: &Identity,
        site_id: &str,
    ) -> Result<Self, TunnelError> {
        let addr = config.gateway_endpoint();
        let mut last_error = String::new();
        for attempt in 1..=DIAL_ATTEMPTS {
            info!("Dialing SSH Gateway at {} (attempt {}/{})", addr, attempt, DIAL_ATTEMPTS);
            match Self::dial(config, identity, site_id).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!("Dialing SSH Gateway at {} failed: {}", addr, e);
                    last_error = e.to_string();
                    if attempt < DIAL_ATTEMPTS {
                        tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                    }
                }
            }
        }
        Err(TunnelError::GatewayDial {
            addr,
            reason: last_error,
        })
    }

    async fn dial(
        config: &TunnelConfig,
        identity: &Identity,
        site_id: &str,
    ) -> Result<Self, TunnelError> {
        let ssh_config = Arc::new(client::Config::default());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let handler = GatewayHandler {
            incoming: incoming_tx,
        };

        let mut handle = client::connect(
            ssh_config,
            (config.gateway_host.as_str(), config.gateway_port),
            handler,
        )
        .await?;

        let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(site_id, identity.auth_key(rsa_hash))
            .await?;
        if !auth.success() {
            return Err(TunnelError::GatewayDial {
                addr: config.gateway_endpoint(),
                reason: "public key authentication rejected".to_string(),
            });
        }
        debug!("Authenticated against the gateway as {}", site_id);

        let accepted = handle
            .tcpip_forward(REMOTE_FORWARD_HOST, REMOTE_FORWARD_PORT)
            .await?;
        if !accepted {
            return Err(TunnelError::RemoteListener(format!(
                "forward request for {}:{} denied",
                REMOTE_FORWARD_HOST, REMOTE_FORWARD_PORT
            )));
        }
        info!("Remote listener established");

        Ok(Self {
            handle,
            incoming: incoming_rx,
        })
    }

    /// Wait for the next public connection.
    ///
    /// `None` means the gateway closed the underlying transport; the caller
    /// must close this session and rebuild.
    pub async fn accept(&mut self) -> Option<ChannelStream<Msg>> {
        let channel = self.incoming.recv().await?;
        Some(channel.into_stream())
    }

    /// Close the underlying transport. Always called before a new dial so a
    /// dropped session never leaks its handle.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel shutting down", "en")
            .await;
    }
}
