pub mod berkeley;
pub mod clock;
pub mod election;
pub mod net;
pub mod peer;
pub mod replicate;
pub mod router;
pub mod store;
pub mod types;

pub use clock::{LogicalClock, PhysicalClock};
pub use election::{pick_coordinator, ElectionState};
pub use net::{Envelope, NetError, WireError};
pub use peer::{Config, Peer, SYNC_CHECK_EVERY};
pub use store::{Insert, Store, StoreError};
pub use types::*;
