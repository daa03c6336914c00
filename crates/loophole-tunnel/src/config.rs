//! Tunnel configuration
//!
//! Captured once from the CLI at startup and shared read-only with every
//! subcomponent.

use std::path::PathBuf;

pub const DEFAULT_GATEWAY_HOST: &str = "gateway.loophole.host";
pub const DEFAULT_GATEWAY_PORT: u16 = 8022;
pub const DEFAULT_SITE_DOMAIN: &str = "loophole.site";
pub const DEFAULT_API_URL: &str = "https://api.loophole.cloud";

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local endpoint to expose.
    pub local_host: String,
    pub local_port: u16,

    /// SSH gateway endpoint.
    pub gateway_host: String,
    pub gateway_port: u16,

    /// Domain under which site hostnames live.
    pub site_domain: String,

    /// Registration API base URL.
    pub api_url: String,

    /// Private key used to authenticate against the gateway.
    pub identity_file: PathBuf,

    /// Site identifier to request instead of a generated one.
    pub requested_hostname: Option<String>,

    /// Render a QR code of the public URL once the tunnel is up.
    pub qr: bool,
}

impl TunnelConfig {
    pub fn new(local_port: u16, local_host: String, identity_file: PathBuf) -> Self {
        Self {
            local_host,
            local_port,
            gateway_host: DEFAULT_GATEWAY_HOST.to_string(),
            gateway_port: DEFAULT_GATEWAY_PORT,
            site_domain: DEFAULT_SITE_DOMAIN.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            identity_file,
            requested_hostname: None,
            qr: false,
        }
    }

    pub fn with_gateway(mut self, host: String, port: u16) -> Self {
        self.gateway_host = host;
        self.gateway_port = port;
        self
    }

    pub fn with_requested_hostname(mut self, hostname: Option<String>) -> Self {
        self.requested_hostname = hostname;
        self
    }

    pub fn with_qr(mut self, qr: bool) -> Self {
        self.qr = qr;
        self
    }

    /// The local endpoint in `host:port` form.
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// The gateway endpoint in `host:port` form.
    pub fn gateway_endpoint(&self) -> String {
        format!("{}:{}", self.gateway_host, self.gateway_port)
    }

    /// The public URL for a site identifier.
    pub fn public_url(&self, site_id: &str) -> String {
        format!("https://{}.{}", site_id, self.site_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_hosted_gateway() {
        let config = TunnelConfig::new(3000, "127.0.0.1".to_string(), PathBuf::from("id_rsa"));
        assert_eq!(config.gateway_endpoint(), "gateway.loophole.host:8022");
        assert_eq!(config.local_endpoint(), "127.0.0.1:3000");
        assert_eq!(config.public_url("abc123"), "https://abc123.loophole.site");
        assert!(!config.qr);
    }
}
