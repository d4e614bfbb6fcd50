//! Best-effort replication: each committed mutation is pushed to the
//! directory, which fans it out to the other peers. Failures are logged and
//! dropped; convergence relies on set-union with idempotent inserts.

use crate::net::{
    self, endpoint, envelope, Envelope, ReplicaPayload, ReplicateData, StatusData, WireError,
};
use crate::peer::Peer;
use crate::store::StoreError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fire-and-forget push of one mutation. No retry; the next mutation or the
/// next peer restart is the only recovery path, by design of the protocol.
pub fn spawn_push(peer: Arc<Peer>, payload: ReplicaPayload) {
    tokio::spawn(async move {
        if let Err(e) = push(&peer, payload).await {
            warn!("replication push failed: {e}");
        }
    });
}

async fn push(peer: &Peer, payload: ReplicaPayload) -> Result<(), net::NetError> {
    let kind = payload.kind();
    let timestamp = peer.physical.now();
    let clock = peer.clock.tick();
    let frame = match &payload {
        ReplicaPayload::Login(login) => encode(kind, login, timestamp, clock)?,
        ReplicaPayload::Channel(channel) => encode(kind, channel, timestamp, clock)?,
        ReplicaPayload::ChannelMessage(message) => encode(kind, message, timestamp, clock)?,
        ReplicaPayload::UserMessage(message) => encode(kind, message, timestamp, clock)?,
    };

    // Short-lived channel so pushes never contend with the singleton
    let reply = net::request_any(endpoint(&peer.config.reference_url), &frame, None).await?;
    let reply: Envelope<StatusData> = envelope::decode(&reply)?;
    peer.clock.merge(reply.data.clock);
    debug!(kind, "mutation replicated");
    Ok(())
}

fn encode<T: Serialize>(
    kind: &str,
    content: &T,
    timestamp: i64,
    clock: i64,
) -> Result<Vec<u8>, WireError> {
    Envelope::new(
        "replicate",
        ReplicateData {
            kind: kind.to_string(),
            content,
            timestamp,
            clock,
        },
    )
    .encode()
}

/// Apply a replicated mutation received from another peer: duplicates of
/// logins and channels are silently dropped, messages always append.
pub fn apply(peer: &Peer, payload: ReplicaPayload) -> Result<(), StoreError> {
    match payload {
        ReplicaPayload::Login(login) => {
            peer.store.add_login(login)?;
        }
        ReplicaPayload::Channel(channel) => {
            peer.store.add_channel(&channel)?;
        }
        ReplicaPayload::ChannelMessage(message) => {
            peer.store.append_channel_message(message)?;
        }
        ReplicaPayload::UserMessage(message) => {
            peer.store.append_user_message(message)?;
        }
    }
    Ok(())
}
