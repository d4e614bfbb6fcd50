//! Domain records shared by the store, the wire and replication

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as unix seconds
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// A registered user. `timestamp` carries the registering request's
/// timestamp, not the local receipt time, so replicated copies agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    pub username: String,
    pub timestamp: i64,
}

/// One message published into a channel. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub user: String,
    pub channel: String,
    pub message: String,
    pub timestamp: i64,
}

/// One direct message between users. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub src: String,
    pub dst: String,
    pub message: String,
    pub timestamp: i64,
}

/// Peer descriptor as the directory reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub rank: i64,
}
