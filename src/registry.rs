//! In-memory connection registry — the single serialisation domain over
//! connected peers, per-peer timers, pending HTTP responders, and the
//! inference-token index. All four maps mutate under one mutex, which is
//! never held across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Write half of a peer connection. Carries encoded frame bodies; drained
/// by the connection's writer task, so a full buffer backpressures senders.
pub type PeerSender = mpsc::Sender<Vec<u8>>;

/// One event on the path from a provider to a waiting HTTP client.
#[derive(Debug)]
pub enum ResponderEvent {
    Chunk(Vec<u8>),
    End,
    Error(String),
}

pub type ResponderSender = mpsc::Sender<ResponderEvent>;

struct PeerEntry {
    sender: PeerSender,
    timers: Vec<AbortHandle>,
    health_timeout: Option<AbortHandle>,
}

impl PeerEntry {
    fn abort_all(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(timeout) = self.health_timeout.take() {
            timeout.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, PeerEntry>,
    responders: HashMap<String, ResponderSender>,
    /// inference token -> owning peer key
    tokens: HashMap<String, String>,
    /// secondary index so disconnect cleanup never scans the full token map
    tokens_by_peer: HashMap<String, HashSet<String>>,
}

/// State torn out of the registry by `detach`, handed back so the caller can
/// finish cleanup (responder terminator, store writes) outside the lock.
pub struct DetachedPeer {
    pub responder: Option<ResponderSender>,
    pub removed_tokens: usize,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry mutex poisoned")
    }

    /// Bind a joined peer's write half. A stale entry under the same key
    /// (reconnect racing the old connection's teardown) is torn down first.
    /// Returns true when an entry was replaced.
    pub fn attach(&self, key: &str, sender: PeerSender) -> bool {
        let mut inner = self.lock();
        let replaced = match inner.peers.get_mut(key) {
            Some(old) => {
                old.abort_all();
                true
            }
            None => false,
        };
        inner.peers.insert(
            key.to_string(),
            PeerEntry { sender, timers: Vec::new(), health_timeout: None },
        );
        replaced
    }

    /// Store the peer's recurring timer handles. If the peer detached, or a
    /// newer connection took the slot, in the window between join and timer
    /// spawn, the handles are aborted here instead.
    pub fn set_timers(&self, key: &str, owner: &PeerSender, timers: Vec<AbortHandle>) {
        let mut inner = self.lock();
        match inner.peers.get_mut(key) {
            Some(entry) if entry.sender.same_channel(owner) => entry.timers.extend(timers),
            _ => {
                for timer in timers {
                    timer.abort();
                }
            }
        }
    }

    /// Arm the one-shot health-check timeout, replacing any previous one.
    pub fn arm_health_timeout(&self, key: &str, handle: AbortHandle) {
        let mut inner = self.lock();
        match inner.peers.get_mut(key) {
            Some(entry) => {
                if let Some(previous) = entry.health_timeout.replace(handle) {
                    previous.abort();
                }
            }
            None => handle.abort(),
        }
    }

    /// Cancel the outstanding health-check timeout. Returns whether one was
    /// armed (a late ack after the timeout fired returns false).
    pub fn clear_health_timeout(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if let Some(entry) = inner.peers.get_mut(key) {
            if let Some(timeout) = entry.health_timeout.take() {
                timeout.abort();
                return true;
            }
        }
        false
    }

    /// Remove the armed timeout without aborting it. Used by the timeout
    /// task itself when it fires, so it can keep running its failure path.
    /// Returns false when an ack already cleared it.
    pub fn disarm_health_timeout(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner
            .peers
            .get_mut(key)
            .and_then(|entry| entry.health_timeout.take())
            .is_some()
    }

    pub fn sender(&self, key: &str) -> Option<PeerSender> {
        self.lock().peers.get(key).map(|e| e.sender.clone())
    }

    #[allow(dead_code)]
    pub fn is_connected(&self, key: &str) -> bool {
        self.lock().peers.contains_key(key)
    }

    pub fn connected_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Park an HTTP response sink for this provider. Refused when one is
    /// already pending: at most one responder per peer key at any instant.
    pub fn register_responder(&self, key: &str, sender: ResponderSender) -> bool {
        let mut inner = self.lock();
        if inner.responders.contains_key(key) {
            return false;
        }
        inner.responders.insert(key.to_string(), sender);
        true
    }

    pub fn responder(&self, key: &str) -> Option<ResponderSender> {
        self.lock().responders.get(key).cloned()
    }

    pub fn take_responder(&self, key: &str) -> Option<ResponderSender> {
        self.lock().responders.remove(key)
    }

    pub fn add_token(&self, token: &str, peer_key: &str) {
        let mut inner = self.lock();
        inner.tokens.insert(token.to_string(), peer_key.to_string());
        inner
            .tokens_by_peer
            .entry(peer_key.to_string())
            .or_default()
            .insert(token.to_string());
    }

    #[allow(dead_code)]
    pub fn peer_for_token(&self, token: &str) -> Option<String> {
        self.lock().tokens.get(token).cloned()
    }

    /// Tear down everything registered for this peer: abort all timers,
    /// release the slot, scrub its inference tokens, detach its responder.
    /// Returns None when the key was never attached, or when a reconnect
    /// already replaced this connection's entry; a stale connection's
    /// teardown must not destroy the live one's state.
    pub fn detach(&self, key: &str, owner: &PeerSender) -> Option<DetachedPeer> {
        let mut inner = self.lock();
        if !inner.peers.get(key)?.sender.same_channel(owner) {
            return None;
        }
        let mut entry = inner.peers.remove(key)?;
        entry.abort_all();
        let removed_tokens = match inner.tokens_by_peer.remove(key) {
            Some(tokens) => {
                for token in &tokens {
                    inner.tokens.remove(token);
                }
                tokens.len()
            }
            None => 0,
        };
        let responder = inner.responders.remove(key);
        Some(DetachedPeer { responder, removed_tokens })
    }
}
