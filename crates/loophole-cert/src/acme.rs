//! ACME order flow (TLS-ALPN-01)

use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, KeyAuthorization,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use rustls::ServerConfig;
use tracing::{debug, info};

use crate::{CertError, CertificateProvider, ACME_TLS_ALPN_NAME};

impl CertificateProvider {
    /// Order a certificate for the whitelisted hostname.
    ///
    /// The TLS-ALPN-01 validation handshake arrives through the tunnel at
    /// the local listener while the order is pending, which is why the
    /// challenge certificate is published before `set_ready`.
    pub(crate) async fn obtain(&self) -> Result<Arc<ServerConfig>, CertError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(self.domain().to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
        debug!("Created ACME order for {}", self.domain());

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                other => {
                    return Err(CertError::OrderFailed(format!(
                        "authorization is {:?}",
                        other
                    )))
                }
            }

            let mut challenge = authz
                .challenge(ChallengeType::TlsAlpn01)
                .ok_or_else(|| CertError::ChallengeUnavailable(self.domain().to_string()))?;

            let config = challenge_config(self.domain(), &challenge.key_authorization())?;
            self.publish_challenge(self.domain().to_string(), config)
                .await;
            challenge.set_ready().await?;
            debug!("TLS-ALPN-01 challenge for {} is ready", self.domain());
        }
        drop(authorizations);

        let retry = RetryPolicy::new()
            .timeout(Duration::from_secs(120))
            .initial_delay(Duration::from_secs(1));

        let status = order.poll_ready(&retry).await?;
        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            self.withdraw_challenge(self.domain()).await;
            return Err(CertError::OrderFailed(format!("order is {:?}", status)));
        }

        let private_key_pem = order.finalize().await?;
        let cert_chain_pem = order.poll_certificate(&retry).await?;
        self.withdraw_challenge(self.domain()).await;
        info!("Obtained certificate for {}", self.domain());

        self.store_cached(&cert_chain_pem, &private_key_pem).await?;
        crate::build_server_config(&cert_chain_pem, &private_key_pem)
    }

    /// Load the ACME account from the cache, creating and persisting one on
    /// first use.
    async fn account(&self) -> Result<Account, CertError> {
        let path = self.account_path();
        if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            if let Ok(credentials) = serde_json::from_str::<AccountCredentials>(&json) {
                match Account::builder()?.from_credentials(credentials).await {
                    Ok(account) => return Ok(account),
                    Err(e) => debug!("Stored ACME account unusable, creating a new one: {}", e),
                }
            }
        }

        let contact = format!("mailto:{}", self.contact_email());
        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url().to_string(),
                None,
            )
            .await?;
        info!("Created ACME account for {}", self.contact_email());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string(&credentials)
            .map_err(|e| CertError::OrderFailed(format!("cannot serialize account: {}", e)))?;
        tokio::fs::write(&path, json).await?;

        Ok(account)
    }
}

/// Build the self-signed challenge certificate carrying the `acmeIdentifier`
/// extension (RFC 8737 §3) and a config that only speaks `acme-tls/1`.
fn challenge_config(
    domain: &str,
    key_authorization: &KeyAuthorization,
) -> Result<Arc<ServerConfig>, CertError> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(
        key_authorization.digest().as_ref(),
    )];
    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        )?;
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
    Ok(Arc::new(config))
}
