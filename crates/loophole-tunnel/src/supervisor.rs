//! Tunnel supervisor
//!
//! Owns the full lifecycle: identity, registration, gateway session, local
//! TLS frontend, accept loop, and the reconnect machine that keeps the same
//! public hostname bound across transport drops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use loophole_api::{RegistrationClient, SiteSpecification};
use loophole_auth::{terminal, Identity, TokenStore};
use loophole_cert::CertificateProvider;

use crate::acceptor;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::gateway::GatewaySession;
use crate::proxy::LocalProxy;

pub struct Supervisor {
    config: TunnelConfig,
    registration: RegistrationClient,
    /// Loaded lazily, exactly once; a reconnect never re-prompts for a
    /// passphrase.
    identity: Option<Identity>,
    /// Sticky after the first successful registration.
    site: Option<SiteSpecification>,
    any_successful_connection: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let tokens = TokenStore::new()?;
        let registration = RegistrationClient::new(config.api_url.clone(), tokens);
        Ok(Self {
            config,
            registration,
            identity: None,
            site: None,
            any_successful_connection: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run the tunnel until a fatal error.
    ///
    /// Clean shutdown never returns from here: the signal handler restores
    /// the terminal, says goodbye and exits the process directly.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        self.spawn_signal_handler();

        println!("Loophole - expose your local server to the world");
        info!("Exposing http://{}", self.config.local_endpoint());

        let mut frontend: Option<LocalProxy> = None;
        loop {
            let site_id = self.ensure_registered().await?;
            let identity = self.ensure_identity()?;

            let mut session = GatewaySession::connect(&self.config, &identity, &site_id).await?;

            // The TLS frontend and its certificate cache survive reconnects;
            // only the gateway transport is rebuilt.
            let proxied_endpoint = match &frontend {
                Some(proxy) => proxy.local_addr(),
                None => self.start_frontend(&site_id, &mut frontend).await?,
            };

            info!("Tunnel is up, press Ctrl+C to stop");
            self.accept_loop(&mut session, proxied_endpoint).await;

            info!("Connection dropped, reconnecting...");
            session.close().await;
        }
    }

    async fn accept_loop(&self, session: &mut GatewaySession, proxied_endpoint: SocketAddr) {
        while let Some(stream) = session.accept().await {
            self.any_successful_connection.store(true, Ordering::Relaxed);
            tokio::spawn(acceptor::serve_stream(stream, proxied_endpoint));
        }
    }

    async fn start_frontend(
        &self,
        site_id: &str,
        frontend: &mut Option<LocalProxy>,
    ) -> Result<SocketAddr, TunnelError> {
        let certs = Arc::new(CertificateProvider::new(site_id, &self.config.site_domain)?);
        let proxy =
            LocalProxy::start(&self.config.local_host, self.config.local_port, certs).await?;
        let addr = proxy.local_addr();

        let url = self.config.public_url(site_id);
        println!();
        println!("Forwarding {} -> {}", url, self.config.local_endpoint());
        if self.config.qr {
            if let Err(e) = qr2term::print_qr(&url) {
                warn!("Cannot render QR code: {}", e);
            }
        }
        println!();

        *frontend = Some(proxy);
        Ok(addr)
    }

    /// Register once; afterwards the sticky identifier is reused without
    /// recontacting the API.
    async fn ensure_registered(&mut self) -> Result<String, TunnelError> {
        if let Some(site) = &self.site {
            info!("Trying to reuse old hostname {}...", site.host);
            return Ok(site.host.clone());
        }

        let identity = self.ensure_identity()?;
        let requested = self.config.requested_hostname.clone();
        let site = self
            .registration
            .register(identity.public_key_openssh(), requested.as_deref())
            .await?;
        info!("Registered hostname {}", self.config.public_url(&site.host));
        Ok(self.adopt_site(site))
    }

    fn ensure_identity(&mut self) -> Result<Identity, TunnelError> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let identity = Identity::load(&self.config.identity_file)?;
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Adopt a registration result, honoring hostname stickiness: once a
    /// non-empty identifier is held it is never replaced by a different one
    /// within the same process.
    fn adopt_site(&mut self, site: SiteSpecification) -> String {
        match &self.site {
            Some(existing) if !existing.host.is_empty() && existing.host != site.host => {
                warn!(
                    "Ignoring site identifier {}, keeping sticky hostname {}",
                    site.host, existing.host
                );
                existing.host.clone()
            }
            _ => {
                let host = site.host.clone();
                self.site = Some(site);
                host
            }
        }
    }

    fn spawn_signal_handler(&self) {
        let served_any = self.any_successful_connection.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            terminal::restore_if_saved();
            println!();
            if served_any.load(Ordering::Relaxed) {
                println!("Thank you for using Loophole!");
            }
            println!("Goodbye! Feedback is welcome at https://github.com/loophole/loophole-rs/issues");
            std::process::exit(0);
        });
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn supervisor() -> Supervisor {
        let config = TunnelConfig::new(3000, "127.0.0.1".to_string(), PathBuf::from("id_rsa"));
        let tokens = TokenStore::with_path(PathBuf::from("/nonexistent/tokens.json"));
        let registration = RegistrationClient::new(config.api_url.clone(), tokens);
        Supervisor {
            config,
            registration,
            identity: None,
            site: None,
            any_successful_connection: Arc::new(AtomicBool::new(false)),
        }
    }

    fn site(host: &str) -> SiteSpecification {
        SiteSpecification {
            host: host.to_string(),
            result_code: 200,
            error: None,
        }
    }

    #[test]
    fn first_registration_is_adopted() {
        let mut sup = supervisor();
        assert_eq!(sup.adopt_site(site("abc123")), "abc123");
        assert_eq!(sup.site.as_ref().map(|s| s.host.as_str()), Some("abc123"));
    }

    #[test]
    fn sticky_identifier_is_never_replaced() {
        let mut sup = supervisor();
        sup.adopt_site(site("abc123"));
        assert_eq!(sup.adopt_site(site("other9")), "abc123");
        assert_eq!(sup.site.as_ref().map(|s| s.host.as_str()), Some("abc123"));
    }

    #[test]
    fn readopting_the_same_identifier_is_fine() {
        let mut sup = supervisor();
        sup.adopt_site(site("abc123"));
        assert_eq!(sup.adopt_site(site("abc123")), "abc123");
    }
}
