//! Tagarela peer — one instance of the replicated chat service.
//!
//! Startup order matters: snapshot, directory registration, background
//! tickers, initial coordinator, then the request loop. The directory and the
//! broker must both be reachable or the process exits.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tagarela::peer::{Config, Peer};
use tagarela::store::Store;
use tagarela::{berkeley, election, router};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Broker address is fixed by the deployment topology
const BROKER_URL: &str = "tcp://broker:5557";

/// Snapshot location; the volume is mounted by the environment
const DATA_FILE: &str = "/data/server_data.json";

#[derive(Parser)]
#[command(name = "tagarela", version, about = "Replicated chat service peer")]
struct Args {
    /// Stable peer name within the fleet
    #[arg(long, env = "SERVER_NAME", default_value = "server-default")]
    server_name: String,

    /// Directory (reference) request endpoint
    #[arg(long, env = "REFERENCE_URL", default_value = "tcp://reference:5559")]
    reference_url: String,

    /// Coordinator announcement feed
    #[arg(long, env = "COORD_ANNOUNCE_URL", default_value = "tcp://reference:5560")]
    announce_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tagarela=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!(name = %args.server_name, "starting peer");

    let store = match Store::open(PathBuf::from(DATA_FILE)) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot load snapshot: {e}");
            std::process::exit(1);
        }
    };
    let (logins, channels, channel_messages, user_messages) = store.counts();
    info!(
        logins,
        channels, channel_messages, user_messages, "snapshot loaded"
    );

    let config = Config {
        name: args.server_name,
        reference_url: args.reference_url,
        announce_url: args.announce_url,
        broker_url: BROKER_URL.into(),
        listen_addr: "0.0.0.0:5555".into(),
    };

    let peer = match Peer::connect(config, store).await {
        Ok(peer) => peer,
        Err(e) => {
            error!("cannot reach directory: {e}");
            std::process::exit(1);
        }
    };

    // Let the fresh connections settle before the first request
    tokio::time::sleep(Duration::from_secs(2)).await;

    match peer.register().await {
        Ok(rank) => info!(rank, "registered with directory"),
        Err(e) => {
            error!("directory registration failed: {e}");
            std::process::exit(1);
        }
    }

    election::spawn_heartbeat(peer.clone());
    election::spawn_announcement_listener(peer.clone());

    // Give the subscription a moment so our own announcement is not missed
    tokio::time::sleep(Duration::from_secs(2)).await;

    match peer.server_list().await {
        Ok(servers) => {
            let coordinator = tagarela::pick_coordinator(&servers, peer.name());
            peer.set_coordinator(&coordinator);
            info!(coordinator = %coordinator, "initial coordinator");
            if coordinator == peer.name() {
                election::announce_coordinator(&peer).await;
            }
        }
        Err(e) => warn!("could not determine initial coordinator: {e}"),
    }

    berkeley::spawn_periodic(peer.clone());

    let listener = match TcpListener::bind(&peer.config.listen_addr).await {
        Ok(listener) => {
            info!(addr = %peer.config.listen_addr, "request listener bound");
            listener
        }
        Err(e) => {
            error!("cannot bind request listener: {e}");
            std::process::exit(1);
        }
    };

    // Broker connects last, right before the request loop needs it
    if let Err(e) = peer.connect_broker().await {
        error!("cannot reach broker: {e}");
        std::process::exit(1);
    }

    info!(
        name = %peer.name(),
        rank = peer.rank(),
        "peer ready to serve requests"
    );

    if let Err(e) = router::serve_on(Arc::clone(&peer), listener).await {
        error!("request loop failed: {e}");
        std::process::exit(1);
    }
}
