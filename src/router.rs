//! Service router: a sequential request loop on the bound listener plus the
//! handler catalogue. Every inbound envelope merges its clock first; every
//! reply carries a fresh tick. Handler failures become error envelopes, they
//! never escape the loop.

use crate::berkeley;
use crate::net::envelope::{self, ErrorFrame};
use crate::net::{
    read_frame, write_frame, AdjustData, ChannelData, ChannelsData, ClockData, DeliveryStatus,
    DirectData, DirectDelivery, ElectionData, Envelope, LoginData, NetError, PublishData,
    Publication, ReplicaPayload, ReplicateData, ReplicateProbe, Stamp, StatusData, UsersData,
    WireError,
};
use crate::peer::Peer;
use crate::replicate;
use crate::store::Insert;
use crate::types::{ChannelMessage, UserLogin, UserMessage};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Bind the configured listener and serve forever. Bind failure is fatal to
/// the caller.
pub async fn serve(peer: Arc<Peer>) -> Result<(), NetError> {
    let listener = TcpListener::bind(&peer.config.listen_addr).await?;
    info!(addr = %peer.config.listen_addr, "request listener bound");
    serve_on(peer, listener).await
}

/// Accept loop on an already-bound listener. Requests are serviced one at a
/// time, preserving the strict request/reply alternation the protocol
/// assumes.
pub async fn serve_on(peer: Arc<Peer>, listener: TcpListener) -> Result<(), NetError> {
    loop {
        let (mut stream, remote) = listener.accept().await?;
        match handle_connection(&peer, &mut stream).await {
            Ok(()) => {
                if peer.bump_message_counter() {
                    berkeley::sync_check(&peer);
                }
            }
            Err(e) => debug!(%remote, "request connection failed: {e}"),
        }
    }
}

/// One conversation: read a frame, dispatch, reply, done.
async fn handle_connection(peer: &Arc<Peer>, stream: &mut TcpStream) -> Result<(), NetError> {
    let bytes = read_frame(stream).await?;
    let reply = dispatch(peer, &bytes).await;
    write_frame(stream, &reply).await?;
    Ok(())
}

/// Route by service tag. Always produces a reply frame: unknown tags and
/// undecodable requests answer with an error envelope.
pub async fn dispatch(peer: &Arc<Peer>, bytes: &[u8]) -> Vec<u8> {
    let service = match envelope::service_tag(bytes) {
        Some(service) => service,
        None => {
            warn!("undecodable request frame");
            return ErrorFrame::encode("Formato de mensagem inválido");
        }
    };

    let result = match service.as_str() {
        "login" => handle_login(peer, bytes),
        "users" => handle_users(peer, bytes),
        "channel" => handle_channel(peer, bytes),
        "channels" => handle_channels(peer, bytes),
        "publish" => handle_publish(peer, bytes).await,
        "message" => handle_message(peer, bytes).await,
        "clock" => handle_clock(peer, bytes),
        "adjust" => handle_adjust(peer, bytes),
        "election" => handle_election(peer, bytes),
        "replicate" => handle_replicate(peer, bytes),
        unknown => {
            warn!(service = %unknown, "unknown service requested");
            return ErrorFrame::encode(&format!("Serviço desconhecido: {unknown}"));
        }
    };

    match result {
        Ok(frame) => frame,
        Err(e) => {
            error!(service = %service, "request handling failed: {e}");
            ErrorFrame::encode(&e.to_string())
        }
    }
}

fn handle_login(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<LoginData> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let mut response = StatusData {
        status: String::new(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        description: None,
    };

    if request.data.user.is_empty() {
        response.status = "erro".into();
        response.description = Some("Nome de usuário não pode ser vazio".into());
    } else {
        let login = UserLogin {
            username: request.data.user.clone(),
            timestamp: request.data.timestamp,
        };
        match peer.store.add_login(login.clone()) {
            Ok(Insert::Inserted) => {
                response.status = "sucesso".into();
                info!(user = %request.data.user, clock = response.clock, "user registered");
                replicate::spawn_push(peer.clone(), ReplicaPayload::Login(login));
            }
            Ok(Insert::Duplicate) => {
                response.status = "erro".into();
                response.description = Some("Usuário já existe".into());
            }
            Err(e) => {
                response.status = "erro".into();
                response.description = Some(format!("Erro ao salvar dados: {e}"));
            }
        }
    }

    Envelope::new("login", response).encode()
}

fn handle_users(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<Stamp> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let response = UsersData {
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        users: peer.store.users(),
    };
    Envelope::new("users", response).encode()
}

fn handle_channel(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<ChannelData> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let mut response = StatusData {
        status: String::new(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        description: None,
    };

    if request.data.channel.is_empty() {
        response.status = "erro".into();
        response.description = Some("Nome do canal não pode ser vazio".into());
    } else {
        match peer.store.add_channel(&request.data.channel) {
            Ok(Insert::Inserted) => {
                response.status = "sucesso".into();
                info!(channel = %request.data.channel, clock = response.clock, "channel created");
                replicate::spawn_push(
                    peer.clone(),
                    ReplicaPayload::Channel(request.data.channel.clone()),
                );
            }
            Ok(Insert::Duplicate) => {
                response.status = "erro".into();
                response.description = Some("Canal já existe".into());
            }
            Err(e) => {
                response.status = "erro".into();
                response.description = Some(format!("Erro ao salvar dados: {e}"));
            }
        }
    }

    Envelope::new("channel", response).encode()
}

fn handle_channels(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<Stamp> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let response = ChannelsData {
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        channels: peer.store.channels(),
    };
    Envelope::new("channels", response).encode()
}

async fn handle_publish(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<PublishData> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let mut response = DeliveryStatus {
        status: String::new(),
        message: None,
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
    };
    let data = request.data;

    if !peer.store.channel_exists(&data.channel) {
        response.status = "erro".into();
        response.message = Some("Canal não existe".into());
        return Envelope::new("publish", response).encode();
    }
    if data.message.is_empty() {
        response.status = "erro".into();
        response.message = Some("Mensagem não pode ser vazia".into());
        return Envelope::new("publish", response).encode();
    }

    let publication = Publication {
        user: data.user.clone(),
        message: data.message.clone(),
        timestamp: data.timestamp,
        clock: peer.clock.tick(),
    };
    let payload = match envelope::encode_payload(&publication) {
        Ok(payload) => payload,
        Err(_) => {
            response.status = "erro".into();
            response.message = Some("Erro ao serializar mensagem".into());
            return Envelope::new("publish", response).encode();
        }
    };

    // Topic is the channel name, verbatim
    if let Err(e) = peer.publish(&data.channel, &payload).await {
        error!(channel = %data.channel, "publish to broker failed: {e}");
        response.status = "erro".into();
        response.message = Some(format!("Erro ao publicar mensagem: {e}"));
        return Envelope::new("publish", response).encode();
    }

    let record = ChannelMessage {
        user: data.user.clone(),
        channel: data.channel.clone(),
        message: data.message.clone(),
        timestamp: data.timestamp,
    };
    // The fan-out already happened; a failed snapshot commit is only a warning
    if let Err(e) = peer.store.append_channel_message(record.clone()) {
        warn!("failed to persist channel message: {e}");
    }
    replicate::spawn_push(peer.clone(), ReplicaPayload::ChannelMessage(record));

    response.status = "OK".into();
    info!(channel = %data.channel, user = %data.user, clock = publication.clock, "message published");
    Envelope::new("publish", response).encode()
}

async fn handle_message(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<DirectData> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let mut response = DeliveryStatus {
        status: String::new(),
        message: None,
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
    };
    let data = request.data;

    if !peer.store.user_exists(&data.dst) {
        response.status = "erro".into();
        response.message = Some("Usuário de destino não existe".into());
        return Envelope::new("message", response).encode();
    }
    if data.message.is_empty() {
        response.status = "erro".into();
        response.message = Some("Mensagem não pode ser vazia".into());
        return Envelope::new("message", response).encode();
    }

    let delivery = DirectDelivery {
        from: data.src.clone(),
        message: data.message.clone(),
        timestamp: data.timestamp,
        clock: peer.clock.tick(),
    };
    let payload = match envelope::encode_payload(&delivery) {
        Ok(payload) => payload,
        Err(_) => {
            response.status = "erro".into();
            response.message = Some("Erro ao serializar mensagem".into());
            return Envelope::new("message", response).encode();
        }
    };

    // Topic is the destination username, verbatim
    if let Err(e) = peer.publish(&data.dst, &payload).await {
        error!(dst = %data.dst, "direct message to broker failed: {e}");
        response.status = "erro".into();
        response.message = Some(format!("Erro ao enviar mensagem: {e}"));
        return Envelope::new("message", response).encode();
    }

    let record = UserMessage {
        src: data.src.clone(),
        dst: data.dst.clone(),
        message: data.message.clone(),
        timestamp: data.timestamp,
    };
    if let Err(e) = peer.store.append_user_message(record.clone()) {
        warn!("failed to persist direct message: {e}");
    }
    replicate::spawn_push(peer.clone(), ReplicaPayload::UserMessage(record));

    response.status = "OK".into();
    info!(src = %data.src, dst = %data.dst, clock = delivery.clock, "direct message sent");
    Envelope::new("message", response).encode()
}

fn handle_clock(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<Stamp> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    let response = ClockData {
        time: peer.physical.now(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
    };
    Envelope::new("clock", response).encode()
}

fn handle_adjust(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<AdjustData> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);

    peer.physical.adjust(request.data.adjustment);

    let response = StatusData {
        status: "OK".into(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        description: None,
    };
    Envelope::new("adjust", response).encode()
}

fn handle_election(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let request: Envelope<Stamp> = envelope::decode(bytes)?;
    peer.clock.merge(request.data.clock);
    debug!("answering election probe");

    let response = ElectionData {
        election: "OK".into(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
    };
    Envelope::new("election", response).encode()
}

fn handle_replicate(peer: &Arc<Peer>, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    // The content shape depends on the kind, so probe first and decode again
    let probe: Envelope<ReplicateProbe> = envelope::decode(bytes)?;
    peer.clock.merge(probe.data.clock);

    let payload = match probe.data.kind.as_str() {
        "login" => {
            let request: Envelope<ReplicateData<UserLogin>> = envelope::decode(bytes)?;
            Some(ReplicaPayload::Login(request.data.content))
        }
        "channel" => {
            let request: Envelope<ReplicateData<String>> = envelope::decode(bytes)?;
            Some(ReplicaPayload::Channel(request.data.content))
        }
        "channel_message" => {
            let request: Envelope<ReplicateData<ChannelMessage>> = envelope::decode(bytes)?;
            Some(ReplicaPayload::ChannelMessage(request.data.content))
        }
        "user_message" => {
            let request: Envelope<ReplicateData<UserMessage>> = envelope::decode(bytes)?;
            Some(ReplicaPayload::UserMessage(request.data.content))
        }
        other => {
            warn!(kind = %other, "unknown replication kind ignored");
            None
        }
    };

    if let Some(payload) = payload {
        debug!(kind = payload.kind(), "applying replicated mutation");
        // Duplicates drop silently; a failed snapshot commit keeps the
        // in-memory copy and is not the sender's problem.
        if let Err(e) = replicate::apply(peer, payload) {
            warn!("replicated mutation not persisted: {e}");
        }
    }

    let response = StatusData {
        status: "OK".into(),
        timestamp: peer.physical.now(),
        clock: peer.clock.tick(),
        description: None,
    };
    Envelope::new("replicate", response).encode()
}
