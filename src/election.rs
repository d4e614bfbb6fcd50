//! Bully election: liveness probing of the coordinator, probing of
//! higher-ranked peers, self-promotion and announcement handling.
//!
//! The engine is deliberately flat: an incoming `election` request is always
//! answered OK without cascading, because the directory re-broadcasts every
//! coordinator announcement and each candidate probes on its own ticker.

use crate::net::{
    self, peer_endpoint, CoordinatorData, ElectionData, Envelope, StatusData, PEER_REQUEST_TIMEOUT,
};
use crate::peer::Peer;
use crate::types::ServerInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Heartbeat cadence towards the directory
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Coordinator liveness is checked on every third heartbeat
pub const PROBE_EVERY_BEATS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Probing,
    Announcing,
    Follower,
}

/// Deterministic coordinator choice: highest rank, ties broken by the
/// lexicographically greatest name. Falls back to `fallback` on an empty
/// list (a lone peer coordinates itself).
pub fn pick_coordinator(servers: &[ServerInfo], fallback: &str) -> String {
    servers
        .iter()
        .max_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)))
        .map(|s| s.name.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// Heartbeat ticker: report liveness to the directory every 10 s and probe
/// the coordinator every third beat.
pub fn spawn_heartbeat(peer: Arc<Peer>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // the first tick fires immediately; skip it
        let mut beats = 0u32;
        loop {
            ticker.tick().await;
            if let Err(e) = peer.send_heartbeat().await {
                warn!("heartbeat failed: {e}");
            }
            beats += 1;
            if beats >= PROBE_EVERY_BEATS {
                beats = 0;
                probe_coordinator(&peer).await;
            }
        }
    });
}

/// Check that the current coordinator answers. Skipped when no coordinator
/// is known yet or we are it; a silent coordinator starts an election.
///
/// Any reply frame counts as alive — a peer that answers the probe with an
/// unknown-service envelope is still very much up.
pub async fn probe_coordinator(peer: &Arc<Peer>) {
    let coordinator = peer.coordinator();
    if coordinator.is_empty() || coordinator == peer.name() {
        return;
    }

    let frame = match Envelope::new("heartbeat", peer.user_stamp()).encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("cannot encode liveness probe: {e}");
            return;
        }
    };
    match net::request_any(
        &peer_endpoint(&coordinator),
        &frame,
        Some(PEER_REQUEST_TIMEOUT),
    )
    .await
    {
        Ok(reply) => {
            if let Ok(envelope) = net::envelope::decode::<StatusData>(&reply) {
                peer.clock.merge(envelope.data.clock);
            }
        }
        Err(e) => {
            warn!(coordinator = %coordinator, "coordinator unreachable: {e}");
            start_election(peer).await;
        }
    }
}

/// Probe every strictly higher-ranked peer; self-promote on silence.
pub async fn start_election(peer: &Arc<Peer>) {
    if !peer.begin_election() {
        return;
    }
    info!(rank = peer.rank(), "starting election");

    let servers = match peer.server_list().await {
        Ok(servers) => servers,
        Err(e) => {
            warn!("election aborted, peer list unavailable: {e}");
            peer.set_election_state(ElectionState::Idle);
            return;
        }
    };

    let my_rank = peer.rank();
    let mut heard_superior = false;
    for server in servers.iter().filter(|s| s.rank > my_rank) {
        let request = Envelope::new("election", peer.stamp());
        match net::request_once::<_, ElectionData>(
            &peer_endpoint(&server.name),
            &request,
            Some(PEER_REQUEST_TIMEOUT),
        )
        .await
        {
            Ok(reply) => {
                peer.clock.merge(reply.data.clock);
                info!(superior = %server.name, "higher-ranked peer answered, standing down");
                heard_superior = true;
                break;
            }
            Err(e) => {
                warn!(candidate = %server.name, "election probe unanswered: {e}");
            }
        }
    }

    if heard_superior {
        // Await the winner's announcement on the feed
        peer.set_election_state(ElectionState::Follower);
    } else {
        peer.set_election_state(ElectionState::Announcing);
        peer.set_coordinator(peer.name());
        announce_coordinator(peer).await;
        peer.set_election_state(ElectionState::Idle);
    }
}

/// Tell the directory we coordinate; it re-broadcasts on the feed.
pub async fn announce_coordinator(peer: &Peer) {
    let request = Envelope::new(
        "coordinator",
        CoordinatorData {
            coordinator: peer.name().to_string(),
            timestamp: peer.physical.now(),
            clock: peer.clock.tick(),
        },
    );
    match peer.directory.request::<_, StatusData>(&request).await {
        Ok(reply) => {
            peer.clock.merge(reply.data.clock);
            info!("announced self as coordinator");
        }
        Err(e) => warn!("coordinator announcement failed: {e}"),
    }
}

/// Consume the announcement feed and track coordinator changes. Reconnects
/// with a pause when the feed drops.
pub fn spawn_announcement_listener(peer: Arc<Peer>) {
    tokio::spawn(async move {
        loop {
            match net::Subscriber::connect(&peer.config.announce_url).await {
                Ok(mut feed) => {
                    info!(feed = %peer.config.announce_url, "subscribed to coordinator announcements");
                    loop {
                        match feed.recv().await {
                            Ok((_topic, payload)) => handle_announcement(&peer, &payload),
                            Err(e) => {
                                warn!("announcement feed lost: {e}");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("announcement feed connect failed: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

fn handle_announcement(peer: &Peer, payload: &[u8]) {
    match net::envelope::decode::<CoordinatorData>(payload) {
        Ok(envelope) => {
            peer.clock.merge(envelope.data.clock);
            peer.set_coordinator(&envelope.data.coordinator);
            peer.set_election_state(ElectionState::Idle);
            info!(coordinator = %envelope.data.coordinator, "coordinator announced");
        }
        Err(e) => warn!("undecodable announcement: {e}"),
    }
}
