//! Local TLS-terminating reverse proxy
//!
//! A single-host reverse proxy in front of the operator's local HTTP server.
//! Public TLS terminates here: each accepted loopback connection (relayed in
//! from the gateway) goes through a lazy TLS handshake whose certificate
//! comes from the certificate provider, then gets served as HTTP and
//! forwarded upstream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Uri;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use loophole_cert::{CertificateProvider, ACME_TLS_ALPN_NAME};

use crate::error::TunnelError;

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type UpstreamClient = Client<HttpConnector, Incoming>;

/// The running local reverse proxy.
pub struct LocalProxy {
    local_addr: SocketAddr,
    server: JoinHandle<()>,
}

impl LocalProxy {
    /// Bind an ephemeral loopback port and start serving TLS on a
    /// background task. Failure to bind is fatal.
    pub async fn start(
        upstream_host: &str,
        upstream_port: u16,
        certs: Arc<CertificateProvider>,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TunnelError::LocalProxy(format!("cannot bind loopback listener: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::LocalProxy(format!("cannot read listener address: {}", e)))?;

        let upstream = format!("{}:{}", upstream_host, upstream_port);
        let client: UpstreamClient = Client::builder(TokioExecutor::new()).build_http();
        info!("Local TLS proxy on {} -> http://{}", local_addr, upstream);

        let server = tokio::spawn(accept_loop(listener, certs, upstream, client));
        Ok(Self { local_addr, server })
    }

    /// The proxied endpoint public connections are relayed to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving (tests only; in production the proxy lives as long as
    /// the process).
    pub fn shutdown(self) {
        self.server.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    certs: Arc<CertificateProvider>,
    upstream: String,
    client: UpstreamClient,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Local accept failed: {}", e);
                continue;
            }
        };
        tokio::spawn(serve_tls(
            stream,
            peer,
            certs.clone(),
            upstream.clone(),
            client.clone(),
        ));
    }
}

async fn serve_tls(
    stream: TcpStream,
    peer: SocketAddr,
    certs: Arc<CertificateProvider>,
    upstream: String,
    client: UpstreamClient,
) {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(e) => {
            debug!("TLS client hello from {} failed: {}", peer, e);
            return;
        }
    };

    let (sni, acme_alpn) = {
        let hello = start.client_hello();
        let sni = hello.server_name().map(str::to_string);
        let acme_alpn = hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);
        (sni, acme_alpn)
    };

    let config = match certs.server_config_for(sni.as_deref(), acme_alpn).await {
        Ok(config) => config,
        Err(e) => {
            warn!("No certificate for incoming handshake: {}", e);
            return;
        }
    };

    let tls = match start.into_stream(config).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!("TLS handshake from {} failed: {}", peer, e);
            return;
        }
    };

    if acme_alpn {
        // The validator only needs to observe the challenge certificate.
        info!("Answered TLS-ALPN-01 validation handshake");
        let mut tls = tls;
        let _ = tls.shutdown().await;
        return;
    }

    let service = service_fn(move |req| {
        let upstream = upstream.clone();
        let client = client.clone();
        async move { Ok::<_, Infallible>(proxy_request(req, &upstream, &client, peer).await) }
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), service)
        .await
    {
        debug!("Connection from {} ended: {}", peer, e);
    }
}

async fn proxy_request(
    mut req: Request<Incoming>,
    upstream: &str,
    client: &UpstreamClient,
    peer: SocketAddr,
) -> Response<ProxyBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{}{}", upstream, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!("Unroutable request path {}: {}", path_and_query, e);
            return error_response(StatusCode::BAD_REQUEST);
        }
    };
    *req.uri_mut() = uri;

    strip_hop_by_hop(req.headers_mut());
    if let Ok(forwarded_for) = HeaderValue::from_str(&peer.ip().to_string()) {
        req.headers_mut()
            .append(HeaderName::from_static("x-forwarded-for"), forwarded_for);
    }

    match client.request(req).await {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            response.map(BodyExt::boxed)
        }
        Err(e) => {
            warn!("Upstream request to {} failed: {}", upstream, e);
            error_response(StatusCode::BAD_GATEWAY)
        }
    }
}

fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(status.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Drop hop-by-hop headers (RFC 9110 §7.6.1), including any named by the
/// `Connection` header itself.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse().ok())
        .collect();
    for name in connection_named {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
}
