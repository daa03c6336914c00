//! Per-connection plumbing
//!
//! Each public connection accepted from the gateway session is dialed
//! through to the local reverse proxy and relayed byte-for-byte in both
//! directions.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Bidirectional byte relay.
///
/// Runs one copy per direction and returns as soon as either direction
/// finishes, for any reason; both sides are shut down before returning.
/// Copy errors are expected churn (peers dropping mid-stream) and stay at
/// debug level.
pub async fn relay<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = result {
                debug!("Relay a->b ended: {}", e);
            }
        }
        result = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = result {
                debug!("Relay b->a ended: {}", e);
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

/// Serve one public connection: dial the local proxy and relay.
///
/// An unreachable local proxy means the TLS frontend died underneath us;
/// there is nothing left to serve, so the process exits.
pub async fn serve_stream<S>(stream: S, proxied_endpoint: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match TcpStream::connect(proxied_endpoint).await {
        Ok(local) => relay(stream, local).await,
        Err(e) => {
            error!("Local proxy at {} is unreachable: {}", proxied_endpoint, e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relay_copies_both_directions_in_order() {
        let (client_a, tunnel_a) = tokio::io::duplex(64);
        let (tunnel_b, client_b) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(tunnel_a, tunnel_b));

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        a_write.write_all(b"ping over the tunnel").await.unwrap();
        let mut buf = vec![0u8; 20];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over the tunnel");

        b_write.write_all(b"pong").await.unwrap();
        let mut buf = vec![0u8; 4];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side ends the relay.
        drop(a_write);
        drop(a_read);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn relay_survives_large_transfers() {
        let (client_a, tunnel_a) = tokio::io::duplex(1024);
        let (tunnel_b, client_b) = tokio::io::duplex(1024);

        tokio::spawn(relay(tunnel_a, tunnel_b));

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (_a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, _b_write) = tokio::io::split(client_b);

        let writer = tokio::spawn(async move {
            a_write.write_all(&payload).await.unwrap();
            a_write.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        b_read.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }
}
