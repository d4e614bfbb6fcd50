//! Wire envelopes: `{ "service": tag, "data": { … } }` as MessagePack maps.
//!
//! Every `data` carries `timestamp` (adjusted unix seconds) and `clock`
//! (Lamport). Encoding uses named fields so the frames stay self-describing
//! and interoperate with any MessagePack client.

use crate::types::{ChannelMessage, ServerInfo, UserLogin, UserMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Outer message shape shared by every request and reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub service: String,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(service: &str, data: T) -> Self {
        Self {
            service: service.to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Peek at the service tag without committing to a payload shape.
/// Returns `None` when the frame is not an envelope at all.
pub fn service_tag(bytes: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        service: String,
    }
    rmp_serde::from_slice::<Probe>(bytes).ok().map(|p| p.service)
}

/// Reply to a frame that could not be handled as an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn encode(message: &str) -> Vec<u8> {
        rmp_serde::to_vec_named(&Self {
            error: message.to_string(),
        })
        .unwrap_or_default()
    }
}

// --- request payloads ------------------------------------------------------

/// Bare timestamp/clock pair: the `data` of `users`, `channels`, `list`,
/// `clock` and `election` requests, which carry nothing else.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stamp {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub user: String,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub channel: String,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishData {
    pub user: String,
    pub channel: String,
    pub message: String,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectData {
    pub src: String,
    pub dst: String,
    pub message: String,
    pub timestamp: i64,
    pub clock: i64,
}

/// `rank` and `heartbeat` requests: the peer identifies itself by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStamp {
    pub user: String,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustData {
    pub adjustment: i64,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorData {
    pub coordinator: String,
    pub timestamp: i64,
    pub clock: i64,
}

/// One replicated mutation, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaPayload {
    Login(UserLogin),
    Channel(String),
    ChannelMessage(ChannelMessage),
    UserMessage(UserMessage),
}

impl ReplicaPayload {
    /// Wire value of the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaPayload::Login(_) => "login",
            ReplicaPayload::Channel(_) => "channel",
            ReplicaPayload::ChannelMessage(_) => "channel_message",
            ReplicaPayload::UserMessage(_) => "user_message",
        }
    }
}

/// `replicate` request data. `content`'s shape depends on `type`, so the
/// receiver probes the kind first ([`ReplicateProbe`]) and then decodes the
/// frame again with the matching content type — the same two-pass discipline
/// the router uses for the outer service tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateData<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: T,
    pub timestamp: i64,
    pub clock: i64,
}

/// First pass over a `replicate` frame: kind and clock, content skipped
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicateProbe {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub clock: i64,
}

// --- reply payloads --------------------------------------------------------

/// `status` + optional `description`: login/channel/adjust/heartbeat/replicate
/// replies all share this shape (`description` is omitted when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
    pub timestamp: i64,
    pub clock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `publish` and `message` replies: `status` + optional `message` text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersData {
    pub timestamp: i64,
    pub clock: i64,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsData {
    pub timestamp: i64,
    pub clock: i64,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankData {
    pub rank: i64,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListData {
    pub list: Vec<ServerInfo>,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockData {
    pub time: i64,
    pub timestamp: i64,
    pub clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionData {
    pub election: String,
    pub timestamp: i64,
    pub clock: i64,
}

// --- broker payloads -------------------------------------------------------

/// Payload fanned out on topic = channel name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub user: String,
    pub message: String,
    pub timestamp: i64,
    pub clock: i64,
}

/// Payload fanned out on topic = destination username
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectDelivery {
    pub from: String,
    pub message: String,
    pub timestamp: i64,
    pub clock: i64,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(payload)?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_envelope_round_trips() {
        let env = Envelope::new(
            "login",
            LoginData {
                user: "alice".into(),
                timestamp: 100,
                clock: 7,
            },
        );
        let bytes = env.encode().unwrap();
        assert_eq!(service_tag(&bytes).as_deref(), Some("login"));

        let back: Envelope<LoginData> = decode(&bytes).unwrap();
        assert_eq!(back.service, "login");
        assert_eq!(back.data.user, "alice");
        assert_eq!(back.data.clock, 7);
    }

    #[test]
    fn frames_are_named_maps() {
        // Clients match on field names, so the encoding must keep them
        let env = Envelope::new(
            "login",
            LoginData {
                user: "alice".into(),
                timestamp: 100,
                clock: 7,
            },
        );
        let value: serde_json::Value = rmp_serde::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(value["service"], "login");
        assert_eq!(value["data"]["user"], "alice");
        assert_eq!(value["data"]["clock"], 7);
    }

    #[test]
    fn optional_description_is_omitted() {
        let env = Envelope::new(
            "login",
            StatusData {
                status: "sucesso".into(),
                timestamp: 1,
                clock: 2,
                description: None,
            },
        );
        let value: serde_json::Value = rmp_serde::from_slice(&env.encode().unwrap()).unwrap();
        assert!(value["data"].get("description").is_none());
    }

    #[test]
    fn replicate_frames_carry_kind_and_content() {
        let env = Envelope::new(
            "replicate",
            ReplicateData {
                kind: "channel".into(),
                content: "general".to_string(),
                timestamp: 5,
                clock: 9,
            },
        );
        let bytes = env.encode().unwrap();

        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["data"]["type"], "channel");
        assert_eq!(value["data"]["content"], "general");
        assert_eq!(value["data"]["clock"], 9);

        // First pass reads kind and clock while skipping the content
        let probe: Envelope<ReplicateProbe> = decode(&bytes).unwrap();
        assert_eq!(probe.data.kind, "channel");
        assert_eq!(probe.data.clock, 9);

        // Second pass decodes the typed content
        let back: Envelope<ReplicateData<String>> = decode(&bytes).unwrap();
        assert_eq!(back.data.content, "general");
    }

    #[test]
    fn structured_replica_content_round_trips() {
        let message = UserMessage {
            src: "alice".into(),
            dst: "bob".into(),
            message: "oi".into(),
            timestamp: 3,
        };
        let payload = ReplicaPayload::UserMessage(message.clone());
        assert_eq!(payload.kind(), "user_message");

        let env = Envelope::new(
            "replicate",
            ReplicateData {
                kind: payload.kind().into(),
                content: message,
                timestamp: 5,
                clock: 9,
            },
        );
        let bytes = env.encode().unwrap();

        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["data"]["type"], "user_message");
        assert_eq!(value["data"]["content"]["dst"], "bob");

        let back: Envelope<ReplicateData<UserMessage>> = decode(&bytes).unwrap();
        assert_eq!(back.data.content.dst, "bob");
    }

    #[test]
    fn garbage_has_no_service_tag() {
        assert!(service_tag(b"\x00\x01\x02").is_none());
    }

    #[test]
    fn error_frame_decodes() {
        let bytes = ErrorFrame::encode("Formato de mensagem inválido");
        let frame: ErrorFrame = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(frame.error, "Formato de mensagem inválido");
    }
}
