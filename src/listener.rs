//! Peer-transport listener — accepts encrypted connections on the hub's
//! long-term identity and runs one read loop per peer, so each peer's frames
//! are handled strictly in arrival order.

use crate::dispatch::{short_key, ConnCtx, Dispatcher};
use crate::identity::Identity;
use crate::protocol::MAX_FRAME_LEN;
use anyhow::Result;
use iroh::Endpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub const ALPN: &[u8] = b"symmetry/1";

/// Outbound frames queued per peer before writers feel backpressure.
const PEER_WRITE_QUEUE: usize = 64;

/// Substrings that mark a transport error as fatal rather than a clean close.
const FATAL_ERROR_MARKERS: &[&str] =
    &["connection reset by peer", "network timeout", "socket hang up"];

pub fn is_fatal_transport_error(message: &str) -> bool {
    FATAL_ERROR_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Bind the endpoint and start accepting peer connections.
pub async fn start(identity: &Identity, dispatcher: Dispatcher) -> Result<Endpoint> {
    let endpoint = Endpoint::builder()
        .secret_key(identity.transport_key())
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await?;
    tracing::info!(
        "Peer transport up: endpoint {}, discovery key {}",
        endpoint.node_id().fmt_short(),
        identity.discovery_key_hex()
    );

    let accept_endpoint = endpoint.clone();
    tokio::spawn(async move {
        accept_loop(accept_endpoint, dispatcher).await;
    });
    Ok(endpoint)
}

async fn accept_loop(endpoint: Endpoint, dispatcher: Dispatcher) {
    loop {
        let incoming = match endpoint.accept().await {
            Some(incoming) => incoming,
            None => break,
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, dispatcher).await {
                tracing::warn!("Incoming connection error: {e}");
            }
        });
    }
    tracing::info!("Peer transport accept loop ended");
}

async fn handle_connection(
    incoming: iroh::endpoint::Incoming,
    dispatcher: Dispatcher,
) -> Result<()> {
    let mut accepting = incoming.accept()?;
    let _alpn = accepting.alpn().await?;
    let conn = accepting.await?;
    let remote = conn.remote_node_id()?;
    let key = hex::encode(remote.as_bytes());
    tracing::info!("Inbound connection from {}", remote.fmt_short());

    // The peer opens the single long-lived frame stream.
    let (send, recv) = conn.accept_bi().await?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(PEER_WRITE_QUEUE);
    let writer = tokio::spawn(write_loop(send, rx));

    let mut ctx = ConnCtx { key, sender: tx, joined: false };
    let reason = read_loop(&dispatcher, &mut ctx, recv).await;
    dispatcher.disconnected(&ctx, &reason).await;
    writer.abort();
    Ok(())
}

/// Drive frames into the dispatcher until the stream ends. Returns the
/// close reason handed to the CLOSED transition.
async fn read_loop(
    dispatcher: &Dispatcher,
    ctx: &mut ConnCtx,
    mut recv: iroh::endpoint::RecvStream,
) -> String {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(bytes)) => dispatcher.handle_bytes(ctx, bytes).await,
            Ok(None) => return "closed".to_string(),
            Err(e) => {
                let message = e.to_string();
                if is_fatal_transport_error(&message) {
                    tracing::warn!("Fatal transport error from {}: {message}", short_key(&ctx.key));
                } else {
                    tracing::info!("Connection to {} ended: {message}", short_key(&ctx.key));
                }
                return message;
            }
        }
    }
}

async fn write_loop(mut send: iroh::endpoint::SendStream, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_frame(&mut send, &bytes).await {
            tracing::debug!("Peer write failed: {e}");
            return;
        }
    }
    let _ = send.finish();
}

/// Read one u32-LE length-prefixed frame body. `Ok(None)` is a clean close
/// between frames; ending mid-frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(recv: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = recv.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("stream ended mid frame header");
        }
        filled += n;
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {len} exceeds limit");
    }
    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(send: &mut W, bytes: &[u8]) -> Result<()> {
    send.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    send.write_all(bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_markers() {
        assert!(is_fatal_transport_error("read failed: connection reset by peer"));
        assert!(is_fatal_transport_error("network timeout after 30s"));
        assert!(is_fatal_transport_error("socket hang up"));
        assert!(!is_fatal_transport_error("closed"));
        assert!(!is_fatal_transport_error("stream finished"));
    }

    #[tokio::test]
    async fn test_frame_codec_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"{\"key\":\"join\"}").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"{\"key\":\"join\"}");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none(), "clean EOF between frames");
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        a.write_all(&huge).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 0]).await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }
}
