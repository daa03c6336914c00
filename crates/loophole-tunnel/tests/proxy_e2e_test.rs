//! End-to-end tests for the local TLS frontend and the connection plumbing

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use loophole_cert::CertificateProvider;
use loophole_tunnel::acceptor::serve_stream;
use loophole_tunnel::LocalProxy;

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Echo upstream: answers every request with the request body.
async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let had_connection_header = req.headers().get("connection").is_some();
                    let forwarded = req.headers().contains_key("x-forwarded-for");
                    let body = req.into_body().collect().await?.to_bytes();
                    let mut response = Response::new(Full::new(body));
                    if forwarded {
                        response
                            .headers_mut()
                            .insert("x-saw-forwarded-for", "1".parse().unwrap());
                    }
                    if had_connection_header {
                        response
                            .headers_mut()
                            .insert("x-saw-connection", "1".parse().unwrap());
                    }
                    Ok::<_, hyper::Error>(response)
                });
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn start_proxy(upstream: SocketAddr) -> (LocalProxy, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let certs = Arc::new(CertificateProvider::with_cache_dir(
        "abc123",
        "loophole.site",
        dir.path().to_path_buf(),
    ));

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["abc123.loophole.site".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    certs
        .install_certificate(&cert.pem(), &key_pair.serialize_pem())
        .await
        .unwrap();

    let proxy = LocalProxy::start("127.0.0.1", upstream.port(), certs)
        .await
        .unwrap();
    (proxy, dir)
}

fn https_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .resolve("abc123.loophole.site", proxy_addr)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn public_request_round_trips_through_the_proxy() {
    init();
    let upstream = start_echo_upstream().await;
    let (proxy, _dir) = start_proxy(upstream).await;
    let client = https_client(proxy.local_addr());

    let response = client
        .post(format!(
            "https://abc123.loophole.site:{}/ping",
            proxy.local_addr().port()
        ))
        .body("PING")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-saw-forwarded-for").unwrap(),
        "1"
    );
    assert_eq!(response.text().await.unwrap(), "PING");
}

#[tokio::test(flavor = "multi_thread")]
async fn hop_by_hop_headers_are_not_forwarded() {
    init();
    let upstream = start_echo_upstream().await;
    let (proxy, _dir) = start_proxy(upstream).await;
    let client = https_client(proxy.local_addr());

    let response = client
        .get(format!(
            "https://abc123.loophole.site:{}/",
            proxy.local_addr().port()
        ))
        .send()
        .await
        .unwrap();

    assert!(response.headers().get("x-saw-connection").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_yields_bad_gateway() {
    init();
    // Reserve a port and release it so nothing listens there.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let (proxy, _dir) = start_proxy(dead).await;
    let client = https_client(proxy.local_addr());

    let response = client
        .get(format!(
            "https://abc123.loophole.site:{}/",
            proxy.local_addr().port()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test(flavor = "multi_thread")]
async fn serve_stream_relays_to_the_proxied_endpoint() {
    init();
    // Plain TCP echo standing in for the proxied endpoint.
    let proxied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxied_addr = proxied.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = proxied.accept().await.unwrap();
        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    // A socket pair standing in for the logical stream from the gateway.
    let entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let entry_addr = entry.local_addr().unwrap();
    let accept = tokio::spawn(async move { entry.accept().await.unwrap().0 });
    let mut public_side = tokio::net::TcpStream::connect(entry_addr).await.unwrap();
    let tunnel_side = accept.await.unwrap();

    tokio::spawn(serve_stream(tunnel_side, proxied_addr));

    public_side.write_all(b"hello").await.unwrap();
    let mut buf = vec![0u8; 5];
    public_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}
