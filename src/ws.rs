//! Stats WebSocket — one snapshot on connect, then every five seconds.

use crate::http::HttpState;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;

const PUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Upgrade an accepted connection (request not yet consumed) and stream
/// snapshots until the client goes away.
pub async fn serve<S>(stream: S, state: HttpState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    tracing::debug!("Stats WebSocket client connected");

    // First tick fires immediately, so clients get a snapshot on connect.
    let mut interval = tokio::time::interval(PUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snapshot = match stats_snapshot(&state).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::warn!("Stats snapshot failed: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(snapshot.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Stats WebSocket client disconnected");
    Ok(())
}

/// The JSON snapshot shared by `/ws` and `/api/stats`.
pub async fn stats_snapshot(state: &HttpState) -> Result<serde_json::Value> {
    let all_peers = state.peers.get_all().await?;
    let stats = state.sessions.stats().await?;
    let active_peers = all_peers.iter().filter(|row| row.peer.online).count();
    let active_models: BTreeSet<&str> = all_peers
        .iter()
        .filter(|row| row.peer.online)
        .map(|row| row.peer.model_name.as_str())
        .collect();
    Ok(json!({
        "uniquePeerCount": all_peers.len(),
        "activePeers": active_peers,
        "activeModels": active_models.len(),
        "allPeers": all_peers,
        "stats": stats,
    }))
}
