//! Framed TCP transport.
//!
//! Frames are `u32` big-endian length prefixes followed by the MessagePack
//! body. Three disciplines live here:
//!
//!   - ephemeral request/reply (`request_once`) used peer-to-peer, one fresh
//!     connection per RPC so conversations never interleave;
//!   - the persistent, mutex-serialized [`DirectoryConn`] singleton;
//!   - `(topic, payload)` frame pairs to the broker ([`Publisher`]) and from
//!     the announcement feed ([`Subscriber`]).

use super::envelope::{self, Envelope, WireError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Upper bound on a single frame. Nothing in the protocol comes close; a
/// larger prefix means a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Receive timeout for peer-to-peer conversations, so dead peers cannot
/// stall Berkeley rounds or elections.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Port every peer binds its request listener on
pub const PEER_PORT: u16 = 5555;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    Oversized(usize),
    #[error("publish socket is not connected")]
    BrokerUnavailable,
}

/// Strip the `tcp://` scheme the configuration URLs carry
pub fn endpoint(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

/// Dial address for a peer. Names are plain hostnames served on the fixed
/// peer port; a name that already carries a port is used as-is.
pub fn peer_endpoint(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:{PEER_PORT}")
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), NetError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(NetError::Oversized(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, NetError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::Oversized(len));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// One conversation on a fresh connection: connect, send the frame, return
/// whatever single frame comes back. With `recv_timeout` the whole
/// conversation is bounded; a timeout is reported as [`NetError::Timeout`].
///
/// Liveness probes use this directly: any reply at all, including an
/// unknown-service error envelope, proves the peer is up.
pub async fn request_any(
    addr: &str,
    frame: &[u8],
    recv_timeout: Option<Duration>,
) -> Result<Vec<u8>, NetError> {
    let conversation = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, frame).await?;
        read_frame(&mut stream).await
    };

    match recv_timeout {
        Some(limit) => timeout(limit, conversation)
            .await
            .map_err(|_| NetError::Timeout(addr.to_string()))?,
        None => conversation.await,
    }
}

/// Typed request/reply over [`request_any`]
pub async fn request_once<Req, Resp>(
    addr: &str,
    request: &Envelope<Req>,
    recv_timeout: Option<Duration>,
) -> Result<Envelope<Resp>, NetError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let frame = request.encode()?;
    let bytes = request_any(addr, &frame, recv_timeout).await?;
    Ok(envelope::decode(&bytes)?)
}

/// Persistent request channel to the directory. One request/reply in flight
/// at a time; the mutex enforces the alternation.
#[derive(Debug)]
pub struct DirectoryConn {
    addr: String,
    stream: Mutex<TcpStream>,
}

impl DirectoryConn {
    pub async fn connect(url: &str) -> Result<Self, NetError> {
        let addr = endpoint(url).to_string();
        let stream = TcpStream::connect(&addr).await?;
        Ok(Self {
            addr,
            stream: Mutex::new(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Blocking request/reply on the shared channel (no receive timeout:
    /// the directory is trusted to answer).
    pub async fn request<Req, Resp>(&self, request: &Envelope<Req>) -> Result<Envelope<Resp>, NetError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let frame = request.encode()?;
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &frame).await?;
        let bytes = read_frame(&mut *stream).await?;
        Ok(envelope::decode(&bytes)?)
    }
}

/// Publish half of the broker fan-out: `(topic, payload)` frame pairs on a
/// single long-lived connection, serialized by the mutex.
#[derive(Debug)]
pub struct Publisher {
    stream: Mutex<TcpStream>,
}

impl Publisher {
    pub async fn connect(url: &str) -> Result<Self, NetError> {
        let stream = TcpStream::connect(endpoint(url)).await?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NetError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, topic.as_bytes()).await?;
        write_frame(&mut *stream, payload).await?;
        Ok(())
    }
}

/// Subscribe half: a blocking reader of `(topic, payload)` pairs. No topic
/// filtering; the announcement feed is consumed whole.
#[derive(Debug)]
pub struct Subscriber {
    stream: TcpStream,
}

impl Subscriber {
    pub async fn connect(url: &str) -> Result<Self, NetError> {
        let stream = TcpStream::connect(endpoint(url)).await?;
        Ok(Self { stream })
    }

    pub async fn recv(&mut self) -> Result<(String, Vec<u8>), NetError> {
        let topic = read_frame(&mut self.stream).await?;
        let payload = read_frame(&mut self.stream).await?;
        Ok((String::from_utf8_lossy(&topic).into_owned(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::envelope::{LoginData, Stamp};

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn request_once_talks_to_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = read_frame(&mut stream).await.unwrap();
            let req: Envelope<LoginData> = envelope::decode(&bytes).unwrap();
            assert_eq!(req.data.user, "alice");
            let reply = Envelope::new("login", Stamp { timestamp: 1, clock: 2 });
            write_frame(&mut stream, &reply.encode().unwrap()).await.unwrap();
        });

        let request = Envelope::new(
            "login",
            LoginData {
                user: "alice".into(),
                timestamp: 0,
                clock: 1,
            },
        );
        let reply: Envelope<Stamp> = request_once(&addr.to_string(), &request, None).await.unwrap();
        assert_eq!(reply.data.clock, 2);
    }

    #[tokio::test]
    async fn request_once_times_out_on_a_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // accept and say nothing
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let request = Envelope::new("election", Stamp::default());
        let result: Result<Envelope<Stamp>, _> =
            request_once(&addr.to_string(), &request, Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(NetError::Timeout(_))));
    }

    #[test]
    fn endpoints_strip_the_scheme() {
        assert_eq!(endpoint("tcp://reference:5559"), "reference:5559");
        assert_eq!(endpoint("reference:5559"), "reference:5559");
        assert_eq!(peer_endpoint("server-1"), "server-1:5555");
        assert_eq!(peer_endpoint("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
