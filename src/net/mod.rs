//! Wire format and transport

pub mod envelope;
pub mod transport;

pub use envelope::{
    AdjustData, ChannelData, ChannelsData, ClockData, CoordinatorData, DeliveryStatus, DirectData,
    DirectDelivery, ElectionData, Envelope, ErrorFrame, ListData, LoginData, PublishData,
    Publication, RankData, ReplicaPayload, ReplicateData, ReplicateProbe, Stamp, StatusData,
    UserStamp, UsersData, WireError,
};
pub use transport::{
    endpoint, peer_endpoint, read_frame, request_any, request_once, write_frame, DirectoryConn,
    NetError, Publisher, Subscriber, MAX_FRAME_SIZE, PEER_PORT, PEER_REQUEST_TIMEOUT,
};
