//! Berkeley clock synchronization, run by whichever peer currently
//! coordinates: collect every reachable peer's adjusted time, average, and
//! hand each participant its delta.

use crate::election::pick_coordinator;
use crate::net::{
    self, peer_endpoint, AdjustData, ClockData, Envelope, StatusData, PEER_REQUEST_TIMEOUT,
};
use crate::peer::Peer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cadence of the coordinator's periodic rounds
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Ten-message trigger: refresh the coordinator identity from the directory
/// and, when we are it, spawn a round.
pub fn sync_check(peer: &Arc<Peer>) {
    let peer = peer.clone();
    tokio::spawn(async move {
        let servers = match peer.server_list().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!("coordination check failed, peer list unavailable: {e}");
                return;
            }
        };
        let coordinator = pick_coordinator(&servers, peer.name());
        peer.set_coordinator(&coordinator);
        if coordinator == peer.name() {
            run_round(&peer).await;
        }
    });
}

/// Periodic ticker; only acts while this peer coordinates.
pub fn spawn_periodic(peer: Arc<Peer>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if peer.coordinator() == peer.name() {
                run_round(&peer).await;
            }
        }
    });
}

/// One round, guarded so a second trigger while one is in flight is dropped.
pub async fn run_round(peer: &Arc<Peer>) {
    if !peer.begin_sync_round() {
        debug!("sync round already in flight, trigger dropped");
        return;
    }
    if let Err(e) = round(peer).await {
        warn!("clock sync round failed: {e}");
    }
    peer.end_sync_round();
}

async fn round(peer: &Arc<Peer>) -> Result<(), net::NetError> {
    info!("starting clock sync round as coordinator");

    let servers = peer.server_list().await?;
    if servers.is_empty() {
        warn!("empty peer list, aborting clock sync");
        return Ok(());
    }
    if servers.len() <= 1 {
        info!("single live peer, clock sync not needed");
        return Ok(());
    }

    // Collect adjusted times; unreachable peers are skipped silently.
    let mut recorded: Vec<(String, i64)> = vec![(peer.name().to_string(), peer.physical.now())];
    for server in servers.iter().filter(|s| s.name != peer.name()) {
        let request = Envelope::new("clock", peer.stamp());
        match net::request_once::<_, ClockData>(
            &peer_endpoint(&server.name),
            &request,
            Some(PEER_REQUEST_TIMEOUT),
        )
        .await
        {
            Ok(reply) => {
                peer.clock.merge(reply.data.clock);
                debug!(peer = %server.name, time = reply.data.time, "clock collected");
                recorded.push((server.name.clone(), reply.data.time));
            }
            Err(e) => warn!(peer = %server.name, "clock collection failed: {e}"),
        }
    }

    let mean = recorded.iter().map(|(_, t)| *t).sum::<i64>() / recorded.len() as i64;
    info!(mean, participants = recorded.len(), "computed mean time");

    // Distribute deltas. Self adjusts in place, everyone else gets an
    // `adjust` envelope and is awaited for the ack.
    for (name, time) in &recorded {
        let delta = mean - time;
        if name == peer.name() {
            if delta != 0 {
                peer.physical.adjust(delta);
            }
            continue;
        }

        let request = Envelope::new(
            "adjust",
            AdjustData {
                adjustment: delta,
                timestamp: peer.physical.now(),
                clock: peer.clock.tick(),
            },
        );
        match net::request_once::<_, StatusData>(
            &peer_endpoint(name),
            &request,
            Some(PEER_REQUEST_TIMEOUT),
        )
        .await
        {
            Ok(reply) => {
                peer.clock.merge(reply.data.clock);
                info!(peer = %name, delta, "adjustment delivered");
            }
            Err(e) => warn!(peer = %name, "adjustment delivery failed: {e}"),
        }
    }

    info!("clock sync round finished");
    Ok(())
}
