//! Certificate provisioning for the public tunnel hostname
//!
//! Terminating public TLS locally needs a real certificate for
//! `<site>.<site domain>`. The provider obtains one lazily on the first TLS
//! handshake via ACME (TLS-ALPN-01; the validation handshake arrives
//! through the tunnel itself), caches the material on disk, and serves the
//! cached certificate until the renewal horizon.

mod acme;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// ALPN protocol name of the TLS-ALPN-01 validation handshake (RFC 8737).
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Cached certificates older than this are re-ordered.
const RENEWAL_HORIZON_DAYS: i64 = 60;

/// Certificate provisioning errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("no TLS-ALPN-01 challenge offered for {0}")]
    ChallengeUnavailable(String),

    #[error("no pending validation for {0}")]
    NoPendingChallenge(String),

    #[error("certificate order failed: {0}")]
    OrderFailed(String),

    #[error("handshake for unknown host {0}")]
    UnknownHost(String),

    #[error("challenge certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate cache error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot determine home directory")]
    NoHomeDir,
}

/// Issuance metadata stored next to the cached certificate.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    issued_at: DateTime<Utc>,
}

/// Lazy ACME certificate provider for a single whitelisted hostname.
pub struct CertificateProvider {
    domain: String,
    contact_email: String,
    cache_dir: PathBuf,
    directory_url: String,
    serving: RwLock<Option<Arc<ServerConfig>>>,
    challenges: Mutex<HashMap<String, Arc<ServerConfig>>>,
    order_guard: Mutex<()>,
}

impl CertificateProvider {
    /// Create a provider for `<site_id>.<site_domain>` with the on-disk
    /// cache at `~/.loophole/certs`.
    pub fn new(site_id: &str, site_domain: &str) -> Result<Self, CertError> {
        let home = dirs::home_dir().ok_or(CertError::NoHomeDir)?;
        Ok(Self::with_cache_dir(
            site_id,
            site_domain,
            home.join(".loophole").join("certs"),
        ))
    }

    /// Create a provider with a custom cache directory (used by tests).
    pub fn with_cache_dir(site_id: &str, site_domain: &str, cache_dir: PathBuf) -> Self {
        Self {
            domain: format!("{}.{}", site_id, site_domain),
            contact_email: format!("{}@{}", site_id, site_domain),
            cache_dir,
            directory_url: instant_acme::LetsEncrypt::Production.url().to_string(),
            serving: RwLock::new(None),
            challenges: Mutex::new(HashMap::new()),
            order_guard: Mutex::new(()),
        }
    }

    /// Override the ACME directory (staging, Pebble).
    pub fn with_directory_url(mut self, url: String) -> Self {
        self.directory_url = url;
        self
    }

    /// The single whitelisted hostname.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub(crate) fn contact_email(&self) -> &str {
        &self.contact_email
    }

    pub(crate) fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub(crate) fn cert_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.domain)
    }

    pub(crate) fn account_path(&self) -> PathBuf {
        self.cache_dir.join("account.json")
    }

    /// Resolve the TLS configuration for an incoming handshake.
    ///
    /// Validation handshakes (`acme-tls/1` ALPN) get the pending challenge
    /// certificate. Ordinary handshakes get the site certificate, ordering
    /// one first if nothing usable is cached; that order blocks the first
    /// handshake, later ones hit the in-memory copy.
    pub async fn server_config_for(
        &self,
        sni: Option<&str>,
        acme_alpn: bool,
    ) -> Result<Arc<ServerConfig>, CertError> {
        if acme_alpn {
            let name = sni.unwrap_or(&self.domain);
            return self
                .challenges
                .lock()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| CertError::NoPendingChallenge(name.to_string()));
        }

        if let Some(name) = sni {
            if name != self.domain {
                return Err(CertError::UnknownHost(name.to_string()));
            }
        }

        if let Some(config) = self.serving.read().await.clone() {
            return Ok(config);
        }

        // Only one handshake drives the order; the rest wait here.
        let _guard = self.order_guard.lock().await;
        if let Some(config) = self.serving.read().await.clone() {
            return Ok(config);
        }

        if let Some(config) = self.load_cached().await? {
            info!("Using cached certificate for {}", self.domain);
            *self.serving.write().await = Some(config.clone());
            return Ok(config);
        }

        info!("No usable certificate for {}, ordering one", self.domain);
        let config = self.obtain().await?;
        *self.serving.write().await = Some(config.clone());
        Ok(config)
    }

    /// Install certificate material directly, bypassing ACME.
    ///
    /// Used after issuance and by tests that provision their own
    /// certificate.
    pub async fn install_certificate(
        &self,
        cert_chain_pem: &str,
        key_pem: &str,
    ) -> Result<(), CertError> {
        let config = build_server_config(cert_chain_pem, key_pem)?;
        *self.serving.write().await = Some(config);
        Ok(())
    }

    pub(crate) async fn publish_challenge(&self, name: String, config: Arc<ServerConfig>) {
        self.challenges.lock().await.insert(name, config);
    }

    pub(crate) async fn withdraw_challenge(&self, name: &str) {
        self.challenges.lock().await.remove(name);
    }

    async fn load_cached(&self) -> Result<Option<Arc<ServerConfig>>, CertError> {
        let dir = self.cert_dir();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        let meta_path = dir.join("meta.json");
        if !cert_path.exists() || !key_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let meta: CacheMeta = match serde_json::from_str(&tokio::fs::read_to_string(&meta_path).await?)
        {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Discarding unreadable certificate metadata: {}", e);
                return Ok(None);
            }
        };
        let age = Utc::now() - meta.issued_at;
        if age > Duration::days(RENEWAL_HORIZON_DAYS) {
            debug!(
                "Cached certificate for {} is {} days old, renewing",
                self.domain,
                age.num_days()
            );
            return Ok(None);
        }

        let chain = tokio::fs::read_to_string(&cert_path).await?;
        let key = tokio::fs::read_to_string(&key_path).await?;
        match build_server_config(&chain, &key) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!("Discarding unusable cached certificate: {}", e);
                Ok(None)
            }
        }
    }

    pub(crate) async fn store_cached(
        &self,
        cert_chain_pem: &str,
        key_pem: &str,
    ) -> Result<(), CertError> {
        let dir = self.cert_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("cert.pem"), cert_chain_pem).await?;
        tokio::fs::write(dir.join("key.pem"), key_pem).await?;
        let meta = CacheMeta {
            issued_at: Utc::now(),
        };
        let json = serde_json::to_string(&meta)
            .map_err(|e| CertError::OrderFailed(format!("cannot serialize metadata: {}", e)))?;
        tokio::fs::write(dir.join("meta.json"), json).await?;
        Ok(())
    }
}

/// Build a rustls server configuration from PEM-encoded material.
pub(crate) fn build_server_config(
    cert_chain_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, CertError> {
    let certs = rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertError::Io)?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(CertError::Io)?
        .ok_or_else(|| CertError::OrderFailed("no private key in PEM".to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
