//! The message state machine. Each peer connection starts OPEN (only `join`
//! is honored), moves to JOINED on a successful join, and ends CLOSED when
//! the transport drops. Frames from one peer are processed in arrival order
//! by its connection task; shared state lives in the registry.

use crate::broker::BrokerStore;
use crate::identity::Identity;
use crate::peers::{NewPeer, PeerStore};
use crate::protocol::{self, Decoded, Frame};
use crate::provider_sessions::ProviderSessionStore;
use crate::registry::{PeerSender, Registry, ResponderEvent};
use base64::Engine;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Peers advertising an older core (or none at all) get `versionMismatch`.
pub const MIN_CORE_VERSION: &str = "1.2.0";

const MAX_MATCH_ATTEMPTS: u32 = 5;
const PEER_FRAME_LIMIT: u32 = 500;
const PEER_FRAME_WINDOW: Duration = Duration::from_secs(60);
const LIMITER_CAPACITY: usize = 10_000;

const DURATION_TICK: Duration = Duration::from_secs(300);
const HEALTH_TICK: Duration = Duration::from_secs(900);
const HEALTH_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-connection state owned by the connection's read loop.
pub struct ConnCtx {
    /// Hex-encoded remote public key.
    pub key: String,
    pub sender: PeerSender,
    pub joined: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    peers: PeerStore,
    broker: BrokerStore,
    sessions: ProviderSessionStore,
    identity: Arc<Identity>,
    limiter: Arc<Mutex<FrameLimiter>>,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        peers: PeerStore,
        broker: BrokerStore,
        sessions: ProviderSessionStore,
        identity: Arc<Identity>,
    ) -> Self {
        Self {
            registry,
            peers,
            broker,
            sessions,
            identity,
            limiter: Arc::new(Mutex::new(FrameLimiter::new(
                PEER_FRAME_LIMIT,
                PEER_FRAME_WINDOW,
            ))),
        }
    }

    /// One length-prefixed body from the peer stream.
    pub async fn handle_bytes(&self, ctx: &mut ConnCtx, bytes: Vec<u8>) {
        let allowed = self
            .limiter
            .lock()
            .expect("frame limiter mutex poisoned")
            .allow(&ctx.key);
        if !allowed {
            tracing::warn!("Rate limit: dropping frame from {}", short_key(&ctx.key));
            return;
        }

        match protocol::decode(&bytes) {
            Decoded::Raw => self.relay_raw(ctx, bytes).await,
            Decoded::Unknown(key) => {
                tracing::debug!("Ignoring unknown frame key {key:?} from {}", short_key(&ctx.key));
            }
            Decoded::Invalid { key, error } => {
                tracing::warn!("Malformed {key} frame from {}: {error}", short_key(&ctx.key));
            }
            Decoded::Frame(frame) => {
                if !ctx.joined && !matches!(frame, Frame::Join(_)) {
                    // Pre-join frames are dropped, not failed: version-mismatch
                    // peers stay silent instead of reconnect-looping.
                    tracing::debug!(
                        "Dropping {} frame from {} before join",
                        frame.key(),
                        short_key(&ctx.key)
                    );
                    return;
                }
                self.handle_frame(ctx, frame).await;
            }
        }
    }

    async fn handle_frame(&self, ctx: &mut ConnCtx, frame: Frame) {
        match frame {
            Frame::Join(payload) => self.handle_join(ctx, payload).await,
            Frame::Challenge(payload) => self.handle_challenge(ctx, payload).await,
            Frame::ConnectionSize(payload) => {
                if let Err(e) = self.peers.update_connections(&ctx.key, payload.connections).await {
                    tracing::warn!("Failed to persist connection count for {}: {e}", short_key(&ctx.key));
                }
            }
            Frame::RequestProvider(payload) => self.handle_request_provider(ctx, payload).await,
            Frame::VerifySession(token) => self.handle_verify_session(ctx, &token).await,
            Frame::Inference(payload) => self.handle_inference(ctx, payload).await,
            Frame::SendMetrics(state) => self.handle_send_metrics(ctx, state).await,
            Frame::HealthCheckAck(_) => self.handle_health_ack(ctx).await,
            Frame::InferenceEnded => self.handle_inference_ended(ctx).await,
            other => {
                // Server-to-peer frames echoed back at us carry no meaning.
                tracing::debug!("Ignoring {} frame from {}", other.key(), short_key(&ctx.key));
            }
        }
    }

    // ── join ──

    async fn handle_join(&self, ctx: &mut ConnCtx, payload: protocol::JoinPayload) {
        if !version_ok(payload.symmetry_core_version.as_deref()) {
            tracing::info!(
                "Join from {} refused: core version {:?} below minimum {MIN_CORE_VERSION}",
                short_key(&ctx.key),
                payload.symmetry_core_version
            );
            send_frame(
                &ctx.sender,
                Frame::VersionMismatch(protocol::VersionMismatchPayload {
                    min_version: MIN_CORE_VERSION.to_string(),
                }),
            )
            .await;
            return;
        }

        let record = NewPeer {
            key: ctx.key.clone(),
            discovery_key: payload.discovery_key,
            model_name: payload.model_name,
            api_provider: payload.api_provider,
            name: payload.name,
            website: payload.website,
            public: payload.public,
            data_collection_enabled: payload.data_collection_enabled,
            server_key: payload.server_key,
            max_connections: payload.max_connections,
        };
        // Store failures here leave the connection in best-effort mode; the
        // peer's next join resynchronises.
        if let Err(e) = self.peers.upsert(record).await {
            tracing::warn!("Join upsert failed for {}: {e}", short_key(&ctx.key));
        }

        let replaced = self.registry.attach(&ctx.key, ctx.sender.clone());
        if replaced {
            tracing::debug!("Replaced stale connection entry for {}", short_key(&ctx.key));
        }
        if let Err(e) = self.sessions.start(&ctx.key).await {
            tracing::warn!("Failed to open provider session for {}: {e}", short_key(&ctx.key));
        }
        self.start_peer_timers(&ctx.key, &ctx.sender);
        ctx.joined = true;
        tracing::info!(
            "Peer joined: {} (connected: {})",
            short_key(&ctx.key),
            self.registry.connected_count()
        );

        send_frame(
            &ctx.sender,
            Frame::JoinAck(protocol::JoinAckPayload {
                status: "success".to_string(),
                key: ctx.key.clone(),
            }),
        )
        .await;
    }

    fn start_peer_timers(&self, key: &str, owner: &PeerSender) {
        let duration = {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(DURATION_TICK).await;
                    if let Err(e) = this.sessions.update_duration(&key).await {
                        tracing::debug!("Duration update failed for {}: {e}", short_key(&key));
                    }
                }
            })
        };
        let health = {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(HEALTH_TICK).await;
                    this.run_health_check(&key).await;
                }
            })
        };
        self.registry
            .set_timers(key, owner, vec![duration.abort_handle(), health.abort_handle()]);
    }

    // ── health protocol ──

    async fn run_health_check(&self, key: &str) {
        let Some(sender) = self.registry.sender(key) else {
            return;
        };
        let id = uuid::Uuid::new_v4().to_string();
        send_frame(
            &sender,
            Frame::HealthCheck(protocol::HealthCheckPayload { id: Some(id) }),
        )
        .await;

        let timeout = {
            let this = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(HEALTH_ACK_TIMEOUT).await;
                if !this.registry.disarm_health_timeout(&key) {
                    return; // ack won the race
                }
                tracing::warn!("Health check timed out for {}", short_key(&key));
                if let Err(e) = this.peers.set_healthy(&key, false).await {
                    tracing::warn!("Failed to mark {} unhealthy: {e}", short_key(&key));
                }
                if let Some(sender) = this.registry.sender(&key) {
                    send_frame(&sender, Frame::HealthCheckFailed).await;
                }
            })
        };
        self.registry.arm_health_timeout(key, timeout.abort_handle());
    }

    async fn handle_health_ack(&self, ctx: &ConnCtx) {
        if self.registry.clear_health_timeout(&ctx.key) {
            if let Err(e) = self.peers.set_healthy(&ctx.key, true).await {
                tracing::warn!("Failed to mark {} healthy: {e}", short_key(&ctx.key));
            }
        } else {
            tracing::debug!("Late health-check ack from {}", short_key(&ctx.key));
        }
    }

    // ── challenge ──

    async fn handle_challenge(&self, ctx: &ConnCtx, payload: protocol::ChallengeRequest) {
        let engine = base64::engine::general_purpose::STANDARD;
        let bytes = match engine.decode(&payload.challenge) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Undecodable challenge from {}: {e}", short_key(&ctx.key));
                return;
            }
        };
        let signature = self.identity.sign(&bytes);
        send_frame(
            &ctx.sender,
            Frame::ChallengeSigned(protocol::ChallengeReply {
                challenge: payload.challenge,
                signature: engine.encode(signature),
            }),
        )
        .await;
    }

    // ── matchmaking ──

    async fn handle_request_provider(&self, ctx: &ConnCtx, payload: protocol::RequestProviderPayload) {
        let chosen = match self
            .select_provider(&payload.model_name, payload.preferred_provider_id.as_deref())
            .await
        {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                // Deliberate silence: the caller times out and retries.
                tracing::debug!("No provider available for model {:?}", payload.model_name);
                return;
            }
            Err(e) => {
                tracing::warn!("Matchmaking query failed: {e}");
                return;
            }
        };

        if chosen.connections >= chosen.max_connections {
            // Fail fast on saturation; the caller re-requests rather than the
            // hub busy-looping over candidates.
            tracing::debug!(
                "Provider {} saturated ({}/{})",
                short_key(&chosen.key),
                chosen.connections,
                chosen.max_connections
            );
            return;
        }

        let token = match self.broker.create(&chosen.discovery_key).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Failed to create broker session: {e}");
                return;
            }
        };
        send_frame(
            &ctx.sender,
            Frame::ProviderDetails(protocol::ProviderDetailsPayload {
                provider_id: chosen.key.clone(),
                session_token: token,
            }),
        )
        .await;
    }

    async fn select_provider(
        &self,
        model_name: &str,
        preferred: Option<&str>,
    ) -> anyhow::Result<Option<crate::peers::PeerRecord>> {
        if let Some(preferred) = preferred {
            if let Some(peer) = self.peers.get_by_key(preferred).await? {
                if peer.online && peer.model_name == model_name {
                    return Ok(Some(peer));
                }
            }
        }
        for _ in 0..MAX_MATCH_ATTEMPTS {
            if let Some(peer) = self.peers.get_random(model_name).await? {
                return Ok(Some(peer));
            }
        }
        Ok(None)
    }

    // ── session validation ──

    async fn handle_verify_session(&self, ctx: &ConnCtx, token: &str) {
        let discovery_key = match self.broker.verify(token).await {
            Ok(Some(discovery_key)) => discovery_key,
            Ok(None) => {
                tracing::debug!("Session token rejected for {}", short_key(&ctx.key));
                return;
            }
            Err(e) => {
                tracing::warn!("Session verify failed: {e}");
                return;
            }
        };
        let provider = match self.peers.get_by_discovery_key(&discovery_key).await {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                tracing::debug!("Session {token} points at a vanished provider");
                return;
            }
            Err(e) => {
                tracing::warn!("Provider lookup failed: {e}");
                return;
            }
        };
        if let Err(e) = self.broker.extend(token).await {
            tracing::warn!("Failed to extend session: {e}");
        }
        send_frame(
            &ctx.sender,
            Frame::SessionValid(protocol::SessionValidPayload {
                discovery_key,
                model_name: provider.model_name,
                name: provider.name,
                provider: provider.api_provider,
            }),
        )
        .await;
    }

    // ── inference accounting & relay ──

    async fn handle_inference(&self, ctx: &ConnCtx, payload: protocol::InferencePayload) {
        self.registry.add_token(&payload.key, &ctx.key);
        match self.sessions.active_session_id(&ctx.key).await {
            Ok(Some(session_id)) => {
                if let Err(e) = self.sessions.log_request(session_id).await {
                    tracing::warn!("Failed to count request for {}: {e}", short_key(&ctx.key));
                }
            }
            Ok(None) => {
                tracing::debug!("Inference from {} with no open session", short_key(&ctx.key));
            }
            Err(e) => tracing::warn!("Session lookup failed: {e}"),
        }
    }

    async fn handle_send_metrics(&self, ctx: &ConnCtx, state: serde_json::Value) {
        match self.sessions.active_session_id(&ctx.key).await {
            Ok(Some(session_id)) => {
                if let Err(e) = self.sessions.add_metrics(session_id, &state).await {
                    tracing::warn!("Failed to append metrics for {}: {e}", short_key(&ctx.key));
                }
            }
            Ok(None) => {
                tracing::debug!("Metrics from {} with no open session", short_key(&ctx.key));
            }
            Err(e) => tracing::warn!("Session lookup failed: {e}"),
        }
    }

    async fn handle_inference_ended(&self, ctx: &ConnCtx) {
        if let Some(responder) = self.registry.take_responder(&ctx.key) {
            let _ = responder.send(ResponderEvent::End).await;
        } else {
            tracing::debug!("inferenceEnded from {} with no pending responder", short_key(&ctx.key));
        }
    }

    /// Non-envelope bytes: spliced straight through to the pending HTTP
    /// responder for this peer. The bounded channel makes the peer read loop
    /// wait for the HTTP writer, chunk by chunk.
    async fn relay_raw(&self, ctx: &ConnCtx, bytes: Vec<u8>) {
        let Some(responder) = self.registry.responder(&ctx.key) else {
            tracing::debug!(
                "Dropping {} raw bytes from {} (no pending responder)",
                bytes.len(),
                short_key(&ctx.key)
            );
            return;
        };
        if responder.send(ResponderEvent::Chunk(bytes)).await.is_err() {
            // HTTP client went away mid-stream; free the slot.
            self.registry.take_responder(&ctx.key);
        }
    }

    // ── disconnect ──

    /// The CLOSED transition: timers cancelled, registry slot and token index
    /// scrubbed, peer marked offline, provider session ended, any parked HTTP
    /// responder flushed with a terminator.
    pub async fn disconnected(&self, ctx: &ConnCtx, reason: &str) {
        if !ctx.joined {
            tracing::debug!("Connection {} closed before join", short_key(&ctx.key));
            return;
        }
        let Some(detached) = self.registry.detach(&ctx.key, &ctx.sender) else {
            // A reconnect already owns the slot; its state must survive.
            return;
        };
        tracing::info!(
            "Peer disconnected: {} ({reason}; scrubbed {} tokens, connected: {})",
            short_key(&ctx.key),
            detached.removed_tokens,
            self.registry.connected_count()
        );
        if let Err(e) = self.peers.set_offline(&ctx.key).await {
            tracing::warn!("Failed to mark {} offline: {e}", short_key(&ctx.key));
        }
        if let Err(e) = self.sessions.end(&ctx.key).await {
            tracing::warn!("Failed to end session for {}: {e}", short_key(&ctx.key));
        }
        if let Some(responder) = detached.responder {
            let _ = responder
                .send(ResponderEvent::Error(format!("Peer error: {reason}")))
                .await;
        }
    }
}

async fn send_frame(sender: &PeerSender, frame: Frame) {
    let key = frame.key();
    if sender.send(frame.encode()).await.is_err() {
        tracing::debug!("Peer write channel closed while sending {key}");
    }
}

pub fn short_key(key: &str) -> &str {
    &key[..key.len().min(8)]
}

fn version_ok(advertised: Option<&str>) -> bool {
    let minimum = semver::Version::parse(MIN_CORE_VERSION).expect("minimum version parses");
    match advertised.and_then(|v| semver::Version::parse(v).ok()) {
        Some(version) => version >= minimum,
        None => false,
    }
}

// ── per-peer frame limiter ──

/// Fixed 60 s windows per peer key in an LRU, so a noisy peer cannot grow
/// the table without bound.
pub struct FrameLimiter {
    cache: LruCache<String, Window>,
    limit: u32,
    window: Duration,
}

struct Window {
    started: Instant,
    count: u32,
}

impl FrameLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(LIMITER_CAPACITY).expect("nonzero capacity")),
            limit,
            window,
        }
    }

    pub fn allow(&mut self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        if let Some(window) = self.cache.get_mut(key) {
            if now.duration_since(window.started) < self.window {
                if window.count >= self.limit {
                    return false;
                }
                window.count += 1;
                return true;
            }
        }
        self.cache.put(key.to_string(), Window { started: now, count: 1 });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_db;
    use crate::db::Db;
    use ed25519_dalek::SigningKey;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn test_identity() -> Arc<Identity> {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let public = signing.verifying_key().to_bytes();
        let mut private = signing.to_bytes().to_vec();
        private.extend_from_slice(&public);
        Arc::new(Identity::from_hex(&hex::encode(public), &hex::encode(private)).unwrap())
    }

    fn dispatcher(db: Db) -> Dispatcher {
        Dispatcher::new(
            Registry::new(),
            PeerStore::new(db.clone()),
            BrokerStore::new(db.clone()),
            ProviderSessionStore::new(db),
            test_identity(),
        )
    }

    struct TestConn {
        ctx: ConnCtx,
        rx: mpsc::Receiver<Vec<u8>>,
    }

    fn conn(key: &str) -> TestConn {
        let (tx, rx) = mpsc::channel(16);
        TestConn {
            ctx: ConnCtx { key: key.to_string(), sender: tx, joined: false },
            rx,
        }
    }

    fn join_bytes(model: &str, version: Option<&str>) -> Vec<u8> {
        let mut data = json!({
            "discoveryKey": "DDDD",
            "modelName": model,
            "maxConnections": 4,
        });
        if let Some(v) = version {
            data["symmetryCoreVersion"] = json!(v);
        }
        serde_json::to_vec(&json!({"key": "join", "data": data})).unwrap()
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Vec<u8>>) -> Value {
        let bytes = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame expected")
            .expect("channel open");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_join_registers_provider() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut c = conn("aabb");

        d.handle_bytes(&mut c.ctx, join_bytes("llama3", Some("1.2.3"))).await;

        let ack = recv_frame(&mut c.rx).await;
        assert_eq!(ack["key"], "joinAck");
        assert_eq!(ack["data"]["status"], "success");
        assert_eq!(ack["data"]["key"], "aabb");
        assert!(c.ctx.joined);

        let peer = d.peers.get_by_key("aabb").await.unwrap().unwrap();
        assert!(peer.online);
        assert_eq!(peer.model_name, "llama3");
        assert!(d.sessions.active_session_id("aabb").await.unwrap().is_some());
        assert!(d.registry.is_connected("aabb"));

        d.disconnected(&c.ctx, "closed").await;
    }

    #[tokio::test]
    async fn test_version_mismatch_leaves_no_state() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut c = conn("aabb");

        d.handle_bytes(&mut c.ctx, join_bytes("llama3", Some("0.9.0"))).await;

        let reply = recv_frame(&mut c.rx).await;
        assert_eq!(reply["key"], "versionMismatch");
        assert_eq!(reply["data"]["minVersion"], MIN_CORE_VERSION);
        assert!(!c.ctx.joined);
        assert!(d.peers.get_by_key("aabb").await.unwrap().is_none());
        assert!(d.sessions.active_session_id("aabb").await.unwrap().is_none());
        assert!(!d.registry.is_connected("aabb"));
    }

    #[tokio::test]
    async fn test_missing_version_is_a_mismatch() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut c = conn("aabb");

        d.handle_bytes(&mut c.ctx, join_bytes("llama3", None)).await;
        let reply = recv_frame(&mut c.rx).await;
        assert_eq!(reply["key"], "versionMismatch");
    }

    #[tokio::test]
    async fn test_frames_before_join_are_dropped() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut c = conn("aabb");

        let bytes =
            serde_json::to_vec(&json!({"key": "requestProvider", "data": {"modelName": "llama3"}}))
                .unwrap();
        d.handle_bytes(&mut c.ctx, bytes).await;
        assert!(c.rx.try_recv().is_err(), "no reply before join");
    }

    #[tokio::test]
    async fn test_matchmaking_then_session_validation() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);

        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;

        let mut consumer = conn("ccdd");
        d.handle_bytes(&mut consumer.ctx, join_bytes("consumer-model", Some("1.2.3"))).await;
        recv_frame(&mut consumer.rx).await;

        let bytes =
            serde_json::to_vec(&json!({"key": "requestProvider", "data": {"modelName": "llama3"}}))
                .unwrap();
        d.handle_bytes(&mut consumer.ctx, bytes).await;
        let details = recv_frame(&mut consumer.rx).await;
        assert_eq!(details["key"], "providerDetails");
        assert_eq!(details["data"]["providerId"], "aabb");
        let token = details["data"]["sessionToken"].as_str().unwrap().to_string();

        let bytes = serde_json::to_vec(&json!({"key": "verifySession", "data": token})).unwrap();
        d.handle_bytes(&mut consumer.ctx, bytes).await;
        let valid = recv_frame(&mut consumer.rx).await;
        assert_eq!(valid["key"], "sessionValid");
        assert_eq!(valid["data"]["discoveryKey"], "DDDD");
        assert_eq!(valid["data"]["modelName"], "llama3");
    }

    #[tokio::test]
    async fn test_saturated_provider_gets_silence() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);

        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;
        // Provider reports it is full.
        let bytes =
            serde_json::to_vec(&json!({"key": "conectionSize", "data": {"connections": 4}}))
                .unwrap();
        d.handle_bytes(&mut provider.ctx, bytes).await;

        let mut consumer = conn("ccdd");
        d.handle_bytes(&mut consumer.ctx, join_bytes("x", Some("1.2.3"))).await;
        recv_frame(&mut consumer.rx).await;
        let bytes =
            serde_json::to_vec(&json!({"key": "requestProvider", "data": {"modelName": "llama3"}}))
                .unwrap();
        d.handle_bytes(&mut consumer.ctx, bytes).await;
        assert!(consumer.rx.try_recv().is_err(), "saturation means silence, caller retries");
    }

    #[tokio::test]
    async fn test_expired_session_token_gets_silence() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut consumer = conn("ccdd");
        d.handle_bytes(&mut consumer.ctx, join_bytes("x", Some("1.2.3"))).await;
        recv_frame(&mut consumer.rx).await;

        let bytes =
            serde_json::to_vec(&json!({"key": "verifySession", "data": "no-such-token"})).unwrap();
        d.handle_bytes(&mut consumer.ctx, bytes).await;
        assert!(consumer.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_challenge_signature_verifies() {
        use ed25519_dalek::{Signature, Verifier};

        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut c = conn("aabb");
        d.handle_bytes(&mut c.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut c.rx).await;

        let engine = base64::engine::general_purpose::STANDARD;
        let challenge = engine.encode(b"prove it");
        let bytes =
            serde_json::to_vec(&json!({"key": "challenge", "data": {"challenge": challenge}}))
                .unwrap();
        d.handle_bytes(&mut c.ctx, bytes).await;

        let reply = recv_frame(&mut c.rx).await;
        assert_eq!(reply["key"], "challenge");
        let sig_bytes = engine.decode(reply["data"]["signature"].as_str().unwrap()).unwrap();
        let verifying = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        verifying
            .verify(b"prove it", &Signature::from_bytes(&sig_bytes.try_into().unwrap()))
            .expect("hub signature must verify");
    }

    #[tokio::test]
    async fn test_inference_ended_closes_responder() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;

        let (tx, mut rx) = mpsc::channel(8);
        assert!(d.registry.register_responder("aabb", tx));

        // Raw bytes splice through first.
        d.handle_bytes(&mut provider.ctx, b"data: {\"delta\":\"hi\"}\n\n".to_vec()).await;
        match rx.recv().await.unwrap() {
            ResponderEvent::Chunk(bytes) => assert!(bytes.starts_with(b"data:")),
            other => panic!("expected chunk, got {other:?}"),
        }

        let bytes = serde_json::to_vec(&json!({"key": "inferenceEnded", "data": null})).unwrap();
        d.handle_bytes(&mut provider.ctx, bytes).await;
        assert!(matches!(rx.recv().await.unwrap(), ResponderEvent::End));
        assert!(d.registry.responder("aabb").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;

        let (tx, mut rx) = mpsc::channel(8);
        assert!(d.registry.register_responder("aabb", tx));
        d.registry.add_token("aabb", "aabb");

        d.disconnected(&provider.ctx, "connection reset by peer").await;

        match rx.recv().await.unwrap() {
            ResponderEvent::Error(msg) => assert!(msg.starts_with("Peer error:")),
            other => panic!("expected terminator, got {other:?}"),
        }
        let peer = d.peers.get_by_key("aabb").await.unwrap().unwrap();
        assert!(!peer.online);
        assert!(d.sessions.active_session_id("aabb").await.unwrap().is_none());
        assert!(d.registry.peer_for_token("aabb").is_none());
        assert!(!d.registry.is_connected("aabb"));
        assert!(d.registry.responder("aabb").is_none());
    }

    #[tokio::test]
    async fn test_health_ack_marks_peer_healthy() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db);
        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;

        d.peers.set_healthy("aabb", false).await.unwrap();
        d.run_health_check("aabb").await;
        let check = recv_frame(&mut provider.rx).await;
        assert_eq!(check["key"], "healthCheck");
        assert!(check["data"]["id"].is_string());

        let ack = serde_json::to_vec(
            &json!({"key": "healthCheck", "data": {"id": check["data"]["id"]}}),
        )
        .unwrap();
        d.handle_bytes(&mut provider.ctx, ack).await;
        assert!(d.peers.get_by_key("aabb").await.unwrap().unwrap().healthy);

        // A late ack with nothing armed is absorbed quietly.
        let late = serde_json::to_vec(&json!({"key": "healthCheck", "data": {}})).unwrap();
        d.handle_bytes(&mut provider.ctx, late).await;
    }

    #[tokio::test]
    async fn test_metrics_land_on_active_session() {
        let (db, _dir) = temp_db().await;
        let d = dispatcher(db.clone());
        let mut provider = conn("aabb");
        d.handle_bytes(&mut provider.ctx, join_bytes("llama3", Some("1.2.3"))).await;
        recv_frame(&mut provider.rx).await;

        let bytes = serde_json::to_vec(
            &json!({"key": "sendMetrics", "data": {"totalTokens": 128}}),
        )
        .unwrap();
        d.handle_bytes(&mut provider.ctx, bytes).await;

        let count: i64 = db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_version_gate() {
        assert!(version_ok(Some("1.2.0")));
        assert!(version_ok(Some("1.2.3")));
        assert!(version_ok(Some("2.0.0")));
        assert!(!version_ok(Some("0.9.0")));
        assert!(!version_ok(Some("1.1.9")));
        assert!(!version_ok(Some("not-a-version")));
        assert!(!version_ok(None));
    }

    #[test]
    fn test_frame_limiter_boundary() {
        let mut limiter = FrameLimiter::new(500, Duration::from_secs(60));
        let start = Instant::now();
        for i in 1..=500 {
            assert!(limiter.allow_at("peer", start), "frame {i} within the cap");
        }
        assert!(!limiter.allow_at("peer", start), "frame 501 dropped");
        // Other peers are unaffected.
        assert!(limiter.allow_at("other", start));
        // A new window opens after 60s.
        assert!(limiter.allow_at("peer", start + Duration::from_secs(61)));
    }
}
