//! The peer value: identity, clocks, store, coordinator identity and the two
//! singleton sockets. Every long-lived task closes over an `Arc<Peer>`; there
//! is no process-global state.

use crate::clock::{LogicalClock, PhysicalClock};
use crate::election::ElectionState;
use crate::net::{
    DirectoryConn, Envelope, ListData, NetError, Publisher, RankData, Stamp, StatusData, UserStamp,
};
use crate::store::Store;
use crate::types::ServerInfo;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::{debug, info};

/// Serviced requests between coordination checks
pub const SYNC_CHECK_EVERY: u32 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// Stable peer name; other peers dial us by it
    pub name: String,
    /// Directory request endpoint
    pub reference_url: String,
    /// Coordinator announcement feed
    pub announce_url: String,
    /// Broker publish endpoint
    pub broker_url: String,
    /// Local request listener bind address
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "server-default".into(),
            reference_url: "tcp://reference:5559".into(),
            announce_url: "tcp://reference:5560".into(),
            broker_url: "tcp://broker:5557".into(),
            listen_addr: "0.0.0.0:5555".into(),
        }
    }
}

pub struct Peer {
    pub config: Config,
    pub clock: LogicalClock,
    pub physical: PhysicalClock,
    pub store: Store,
    pub directory: DirectoryConn,
    /// Set once by [`Peer::connect_broker`], at the end of startup
    publisher: OnceLock<Publisher>,
    rank: AtomicI64,
    coordinator: RwLock<String>,
    election: Mutex<ElectionState>,
    message_counter: AtomicU32,
    sync_in_flight: AtomicBool,
}

impl Peer {
    /// Connect the directory singleton and assemble the peer. The caller
    /// treats directory unreachability here as fatal. The broker publish
    /// socket is not touched yet: it is attached last in the startup
    /// sequence by [`Peer::connect_broker`], after registration and the
    /// initial coordinator determination have already run.
    pub async fn connect(config: Config, store: Store) -> Result<Arc<Self>, NetError> {
        let directory = DirectoryConn::connect(&config.reference_url).await?;
        info!(directory = %directory.addr(), "connected to directory");

        Ok(Arc::new(Self {
            config,
            clock: LogicalClock::new(),
            physical: PhysicalClock::new(),
            store,
            directory,
            publisher: OnceLock::new(),
            rank: AtomicI64::new(0),
            coordinator: RwLock::new(String::new()),
            election: Mutex::new(ElectionState::Idle),
            message_counter: AtomicU32::new(0),
            sync_in_flight: AtomicBool::new(false),
        }))
    }

    /// Connect the broker publish socket. Runs once, right before the
    /// request loop starts; the delay gives a slow-starting broker the whole
    /// registration and election window to come up.
    pub async fn connect_broker(&self) -> Result<(), NetError> {
        let publisher = Publisher::connect(&self.config.broker_url).await?;
        info!(broker = %self.config.broker_url, "publish socket connected to broker");
        let _ = self.publisher.set(publisher);
        Ok(())
    }

    /// Fan a `(topic, payload)` frame pair out through the broker
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NetError> {
        match self.publisher.get() {
            Some(publisher) => publisher.publish(topic, payload).await,
            None => Err(NetError::BrokerUnavailable),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn rank(&self) -> i64 {
        self.rank.load(Ordering::SeqCst)
    }

    /// Current coordinator name; empty until the first determination.
    /// Readers tolerate a stale value, writes happen on announcements only.
    pub fn coordinator(&self) -> String {
        self.coordinator.read().unwrap().clone()
    }

    pub fn set_coordinator(&self, name: &str) {
        *self.coordinator.write().unwrap() = name.to_string();
    }

    /// Fresh timestamp/clock pair for an outbound request
    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.physical.now(),
            clock: self.clock.tick(),
        }
    }

    /// Stamp carrying our own name, for `rank` and `heartbeat`
    pub fn user_stamp(&self) -> UserStamp {
        UserStamp {
            user: self.config.name.clone(),
            timestamp: self.physical.now(),
            clock: self.clock.tick(),
        }
    }

    /// Register with the directory and adopt the rank it assigns
    pub async fn register(&self) -> Result<i64, NetError> {
        let request = Envelope::new("rank", self.user_stamp());
        let reply: Envelope<RankData> = self.directory.request(&request).await?;
        self.clock.merge(reply.data.clock);
        self.rank.store(reply.data.rank, Ordering::SeqCst);
        Ok(reply.data.rank)
    }

    pub async fn send_heartbeat(&self) -> Result<(), NetError> {
        let request = Envelope::new("heartbeat", self.user_stamp());
        let reply: Envelope<StatusData> = self.directory.request(&request).await?;
        let clock = self.clock.merge(reply.data.clock);
        debug!(rank = self.rank(), clock, "heartbeat acknowledged");
        Ok(())
    }

    /// Fetch the live peer list from the directory
    pub async fn server_list(&self) -> Result<Vec<ServerInfo>, NetError> {
        let request = Envelope::new("list", self.stamp());
        let reply: Envelope<ListData> = self.directory.request(&request).await?;
        self.clock.merge(reply.data.clock);
        Ok(reply.data.list)
    }

    /// Count one serviced request; true on every `SYNC_CHECK_EVERY`-th
    pub fn bump_message_counter(&self) -> bool {
        let count = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= SYNC_CHECK_EVERY {
            self.message_counter.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Claim the single in-flight Berkeley round slot
    pub fn begin_sync_round(&self) -> bool {
        self.sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_sync_round(&self) {
        self.sync_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn election_state(&self) -> ElectionState {
        *self.election.lock().unwrap()
    }

    pub fn set_election_state(&self, state: ElectionState) {
        *self.election.lock().unwrap() = state;
    }

    /// Move to `Probing` unless a probe or announcement is already running
    pub fn begin_election(&self) -> bool {
        let mut state = self.election.lock().unwrap();
        match *state {
            ElectionState::Probing | ElectionState::Announcing => false,
            ElectionState::Idle | ElectionState::Follower => {
                *state = ElectionState::Probing;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static STORE_SEQ: AtomicUsize = AtomicUsize::new(0);

    async fn test_peer() -> Arc<Peer> {
        // Throwaway endpoints so the singleton sockets have something to
        // connect to; nothing is sent through them here.
        let directory = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            name: "server-test".into(),
            reference_url: format!("tcp://{}", directory.local_addr().unwrap()),
            broker_url: format!("tcp://{}", broker.local_addr().unwrap()),
            ..Config::default()
        };
        tokio::spawn(async move {
            let _conns = (directory.accept().await, broker.accept().await);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let path = std::env::temp_dir().join(format!(
            "tagarela_peer_{}_{}.json",
            std::process::id(),
            STORE_SEQ.fetch_add(1, Ordering::SeqCst),
        ));
        let _ = std::fs::remove_file(&path);
        let store = Store::open(&path).unwrap();
        let peer = Peer::connect(config, store).await.unwrap();
        peer.connect_broker().await.unwrap();
        peer
    }

    #[tokio::test]
    async fn publishing_without_a_broker_is_refused() {
        let directory = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            name: "server-test".into(),
            reference_url: format!("tcp://{}", directory.local_addr().unwrap()),
            ..Config::default()
        };
        tokio::spawn(async move {
            let _conn = directory.accept().await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let path = std::env::temp_dir().join(format!(
            "tagarela_peer_nobroker_{}.json",
            std::process::id(),
        ));
        let _ = std::fs::remove_file(&path);
        let store = Store::open(&path).unwrap();
        let peer = Peer::connect(config, store).await.unwrap();

        // No connect_broker() yet: the publish socket must report as absent
        assert!(matches!(
            peer.publish("general", b"payload").await,
            Err(NetError::BrokerUnavailable)
        ));
    }

    #[tokio::test]
    async fn counter_trips_every_tenth_request() {
        let peer = test_peer().await;
        for round in 0..3 {
            for i in 1..SYNC_CHECK_EVERY {
                assert!(!peer.bump_message_counter(), "round {round}, call {i}");
            }
            assert!(peer.bump_message_counter());
        }
    }

    #[tokio::test]
    async fn only_one_sync_round_at_a_time() {
        let peer = test_peer().await;
        assert!(peer.begin_sync_round());
        assert!(!peer.begin_sync_round());
        peer.end_sync_round();
        assert!(peer.begin_sync_round());
    }

    #[tokio::test]
    async fn election_claims_are_exclusive() {
        let peer = test_peer().await;
        assert!(peer.begin_election());
        assert_eq!(peer.election_state(), ElectionState::Probing);
        assert!(!peer.begin_election());

        peer.set_election_state(ElectionState::Follower);
        assert!(peer.begin_election());
    }
}
