//! Peer wire protocol — JSON frame envelopes over the encrypted stream.
//!
//! Every frame is `{"key": <string>, "data": <any>}`. Binary payloads are
//! base64-encoded by the sender. Unknown keys are ignored. Payloads that do
//! not parse as an envelope at all are raw response bytes, relayed to a
//! pending HTTP responder when one exists for the sending peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on a single length-prefixed frame body.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Provider self-description carried by `join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub discovery_key: String,
    pub model_name: String,
    #[serde(default)]
    pub api_provider: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub data_collection_enabled: bool,
    #[serde(default)]
    pub server_key: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub symmetry_core_version: Option<String>,
}

fn default_max_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAckPayload {
    pub status: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    /// Base64 challenge bytes chosen by the peer.
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeReply {
    pub challenge: String,
    /// Base64 ed25519 signature over the challenge bytes.
    pub signature: String,
}

/// Provider fan-out self-report. The wire key is `conectionSize`; the
/// misspelling is the deployed wire format and must not be corrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSizePayload {
    pub connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestProviderPayload {
    pub model_name: String,
    #[serde(default)]
    pub preferred_provider_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDetailsPayload {
    pub provider_id: String,
    pub session_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidPayload {
    pub discovery_key: String,
    pub model_name: String,
    pub name: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferencePayload {
    pub messages: Value,
    /// Inference token used to route response bytes back to the consumer.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPayload {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMismatchPayload {
    pub min_version: String,
}

/// A decoded wire frame. The `challenge` and `healthCheck` keys are used in
/// both directions; the inbound readings are `Challenge` and `HealthCheckAck`.
#[derive(Debug, Clone)]
pub enum Frame {
    Join(JoinPayload),
    JoinAck(JoinAckPayload),
    Challenge(ChallengeRequest),
    ChallengeSigned(ChallengeReply),
    ConnectionSize(ConnectionSizePayload),
    RequestProvider(RequestProviderPayload),
    ProviderDetails(ProviderDetailsPayload),
    VerifySession(String),
    SessionValid(SessionValidPayload),
    Inference(InferencePayload),
    SendMetrics(Value),
    HealthCheck(HealthCheckPayload),
    HealthCheckAck(HealthCheckPayload),
    HealthCheckFailed,
    InferenceEnded,
    VersionMismatch(VersionMismatchPayload),
}

/// Outcome of decoding one frame body.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// Well-formed envelope with a key this hub does not know.
    Unknown(String),
    /// Known key whose payload failed to deserialize.
    Invalid { key: String, error: String },
    /// Not a JSON envelope at all; candidate for raw relay.
    Raw,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    #[serde(default)]
    data: Value,
}

pub fn decode(bytes: &[u8]) -> Decoded {
    let env: Envelope = match serde_json::from_slice(bytes) {
        Ok(env) => env,
        Err(_) => return Decoded::Raw,
    };
    let key = env.key;
    let frame = match key.as_str() {
        "join" => payload(env.data).map(Frame::Join),
        "challenge" => payload(env.data).map(Frame::Challenge),
        "conectionSize" => payload(env.data).map(Frame::ConnectionSize),
        "requestProvider" => payload(env.data).map(Frame::RequestProvider),
        "verifySession" => payload(env.data).map(Frame::VerifySession),
        "inference" => payload(env.data).map(Frame::Inference),
        "sendMetrics" => Ok(Frame::SendMetrics(env.data)),
        "healthCheck" => payload(env.data).map(Frame::HealthCheckAck),
        "inferenceEnded" => Ok(Frame::InferenceEnded),
        _ => return Decoded::Unknown(key),
    };
    match frame {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => Decoded::Invalid { key, error: e.to_string() },
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

impl Frame {
    pub fn key(&self) -> &'static str {
        match self {
            Frame::Join(_) => "join",
            Frame::JoinAck(_) => "joinAck",
            Frame::Challenge(_) | Frame::ChallengeSigned(_) => "challenge",
            Frame::ConnectionSize(_) => "conectionSize",
            Frame::RequestProvider(_) => "requestProvider",
            Frame::ProviderDetails(_) => "providerDetails",
            Frame::VerifySession(_) => "verifySession",
            Frame::SessionValid(_) => "sessionValid",
            Frame::Inference(_) => "inference",
            Frame::SendMetrics(_) => "sendMetrics",
            Frame::HealthCheck(_) | Frame::HealthCheckAck(_) => "healthCheck",
            Frame::HealthCheckFailed => "healthCheckFailed",
            Frame::InferenceEnded => "inferenceEnded",
            Frame::VersionMismatch(_) => "versionMismatch",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let data = match self {
            Frame::Join(p) => serde_json::to_value(p),
            Frame::JoinAck(p) => serde_json::to_value(p),
            Frame::Challenge(p) => serde_json::to_value(p),
            Frame::ChallengeSigned(p) => serde_json::to_value(p),
            Frame::ConnectionSize(p) => serde_json::to_value(p),
            Frame::RequestProvider(p) => serde_json::to_value(p),
            Frame::ProviderDetails(p) => serde_json::to_value(p),
            Frame::VerifySession(p) => serde_json::to_value(p),
            Frame::SessionValid(p) => serde_json::to_value(p),
            Frame::Inference(p) => serde_json::to_value(p),
            Frame::SendMetrics(p) => Ok(p.clone()),
            Frame::HealthCheck(p) | Frame::HealthCheckAck(p) => serde_json::to_value(p),
            Frame::HealthCheckFailed | Frame::InferenceEnded => Ok(Value::Null),
            Frame::VersionMismatch(p) => serde_json::to_value(p),
        }
        .expect("frame payload serializable");
        let env = Envelope { key: self.key().to_string(), data };
        serde_json::to_vec(&env).expect("frame envelope serializable")
    }
}
