//! Transport and signaling: deterministic endpoint derivation plus
//! channel establishment over loopback WebSockets.
//!
//! There is no directory service. The host's endpoint is derived from the
//! room code alone — `md5(room)` picks a stable loopback port — so a
//! guest can locate the host with nothing but the code. Each guest
//! derives its own identity as `/<ROOM>/<participant-id>` and presents it
//! as the upgrade request path, which lets the host accept many inbound
//! channels under one room and reject duplicates during the handshake.
//!
//! Failure mapping, per the session error taxonomy:
//! - host bind `AddrInUse` → [`SignalError::RoomCollision`]
//! - guest connection refused → [`SignalError::RoomNotFound`]
//! - guest open not completing within [`CONNECT_TIMEOUT`] →
//!   [`SignalError::ConnectTimeout`]
//!
//! Nothing here retries. A failed attempt surfaces once and the caller
//! decides whether to start over.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::link::PeerChannel;
use crate::protocol::{ParticipantId, RoomCode, WireMessage};

/// A channel that has not opened within this window fails loudly instead
/// of hanging.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-channel buffered frame count, both directions.
const CHANNEL_CAPACITY: usize = 256;

/// Loopback port range the room-code hash maps into.
const PORT_BASE: u16 = 0xC000;
const PORT_SPAN: u16 = 0x3000;

/// Derive the host's listen port from the room code. Stable across
/// processes and platforms: guests recompute it independently.
pub fn derive_host_port(room: &RoomCode) -> u16 {
    let digest = md5::compute(room.as_str().as_bytes());
    let word = u16::from_be_bytes([digest.0[0], digest.0[1]]);
    PORT_BASE + word % PORT_SPAN
}

/// The host's connection identity string for a room.
pub fn host_endpoint(room: &RoomCode) -> String {
    format!("ws://127.0.0.1:{}/{}/host", derive_host_port(room), room)
}

/// A guest's connection identity string for a room.
pub fn guest_endpoint(room: &RoomCode, local_id: ParticipantId) -> String {
    format!(
        "ws://127.0.0.1:{}/{}/{}",
        derive_host_port(room),
        room,
        local_id
    )
}

/// Signaling layer faults. Surfaced once, never retried internally.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("room code already in use")]
    RoomCollision,
    #[error("room not found")]
    RoomNotFound,
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("transport fault: {0}")]
    Transport(String),
}

/// Connection lifecycle notifications, the Rust rendition of the
/// `onOpen`/`onPeerConnected`/`onPeerDisconnected`/`onError` callbacks.
pub enum SignalEvent {
    Open { endpoint: String },
    PeerConnected(PeerChannel),
    PeerDisconnected(ParticipantId),
    Error(String),
}

/// Handle to the signaling tasks for one session.
pub struct Signaling {
    pub local_endpoint: String,
    tasks: Vec<JoinHandle<()>>,
}

impl Signaling {
    /// Host mode: bind the derived endpoint and passively accept inbound
    /// channels for this room. Resolves as soon as the listener is up.
    pub async fn host(
        room: &RoomCode,
        events: mpsc::Sender<SignalEvent>,
    ) -> Result<Self, SignalError> {
        let port = derive_host_port(room);
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => SignalError::RoomCollision,
                _ => SignalError::Transport(e.to_string()),
            })?;
        let endpoint = host_endpoint(room);
        info!("room {room}: hosting at {endpoint}");

        let _ = events
            .send(SignalEvent::Open {
                endpoint: endpoint.clone(),
            })
            .await;

        let accept_room = room.clone();
        let connected: Arc<Mutex<HashSet<ParticipantId>>> =
            Arc::new(Mutex::new(HashSet::new()));
        let accept_events = events.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("room {accept_room}: inbound tcp from {addr}");
                        tokio::spawn(accept_peer(
                            stream,
                            accept_room.clone(),
                            Arc::clone(&connected),
                            accept_events.clone(),
                        ));
                    }
                    Err(e) => {
                        let _ = accept_events
                            .send(SignalEvent::Error(format!("accept failed: {e}")))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_endpoint: endpoint,
            tasks: vec![accept_task],
        })
    }

    /// Guest mode: actively open exactly one channel, to the host's
    /// derived identity. Resolves with the established channel; the
    /// error cases map per the module docs.
    pub async fn guest(
        room: &RoomCode,
        local_id: ParticipantId,
        events: mpsc::Sender<SignalEvent>,
    ) -> Result<(Self, PeerChannel), SignalError> {
        let endpoint = guest_endpoint(room, local_id);

        let connect = timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())).await;
        let ws = match connect {
            Err(_) => return Err(SignalError::ConnectTimeout),
            Ok(Err(tokio_tungstenite::tungstenite::Error::Io(e)))
                if e.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                return Err(SignalError::RoomNotFound)
            }
            Ok(Err(e)) => return Err(SignalError::Transport(e.to_string())),
            Ok(Ok((ws, _response))) => ws,
        };
        info!("room {room}: connected as {endpoint}");

        let _ = events
            .send(SignalEvent::Open {
                endpoint: endpoint.clone(),
            })
            .await;

        // The host's participant id is unknown until its PLAYER_JOIN
        // arrives; the nil id names "the host link" on a guest.
        let (channel, tasks) = spawn_channel(ws, Uuid::nil(), events, None);
        Ok((
            Self {
                local_endpoint: endpoint,
                tasks,
            },
            channel,
        ))
    }

    /// Stop accepting/pumping. Idempotent; established links die with
    /// their channel tasks.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Signaling {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Host side of one inbound channel: validate the upgrade path, then
/// wire the socket up.
async fn accept_peer(
    stream: TcpStream,
    room: RoomCode,
    connected: Arc<Mutex<HashSet<ParticipantId>>>,
    events: mpsc::Sender<SignalEvent>,
) {
    let identity: Arc<Mutex<Option<ParticipantId>>> = Arc::new(Mutex::new(None));
    let callback_identity = Arc::clone(&identity);
    let callback_room = room.clone();
    let callback_connected = Arc::clone(&connected);

    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        let mut segments = path.trim_start_matches('/').splitn(2, '/');
        let room_part = segments.next().unwrap_or_default();
        let id_part = segments.next().unwrap_or_default();

        if !room_part.eq_ignore_ascii_case(callback_room.as_str()) {
            return Err(reject(StatusCode::NOT_FOUND, "unknown room"));
        }
        let peer_id = Uuid::parse_str(id_part)
            .map_err(|_| reject(StatusCode::BAD_REQUEST, "bad participant id"))?;
        if !callback_connected.lock().unwrap().insert(peer_id) {
            return Err(reject(StatusCode::CONFLICT, "identity already in use"));
        }
        *callback_identity.lock().unwrap() = Some(peer_id);
        Ok(resp)
    };

    let ws = match accept_hdr_async(MaybeTlsStream::Plain(stream), callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("room {room}: rejected inbound channel: {e}");
            return;
        }
    };
    let peer_id = match identity.lock().unwrap().take() {
        Some(id) => id,
        None => return,
    };

    let (channel, _tasks) = spawn_channel(ws, peer_id, events.clone(), Some(connected));
    let _ = events.send(SignalEvent::PeerConnected(channel)).await;
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Split one socket into a writer task (drains the outbound mpsc, FIFO)
/// and a reader task (decodes frames, drops malformed ones with a
/// warning, emits `PeerDisconnected` exactly once on close).
fn spawn_channel(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    peer_id: ParticipantId,
    events: mpsc::Sender<SignalEvent>,
    connected: Option<Arc<Mutex<HashSet<ParticipantId>>>>,
) -> (PeerChannel, Vec<JoinHandle<()>>) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<WireMessage>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match WireMessage::decode(text.as_str()) {
                    Ok(decoded) => {
                        if in_tx.send(decoded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("peer {peer_id}: dropping malformed frame: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        if let Some(connected) = connected {
            connected.lock().unwrap().remove(&peer_id);
        }
        let _ = events.send(SignalEvent::PeerDisconnected(peer_id)).await;
    });

    (
        PeerChannel {
            peer_id,
            outbound: out_tx,
            inbound: in_rx,
        },
        vec![writer, reader],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_derivation_is_stable_and_in_range() {
        let room = RoomCode::parse("AB12CD").unwrap();
        let port = derive_host_port(&room);
        assert_eq!(port, derive_host_port(&room));
        assert!((PORT_BASE..PORT_BASE + PORT_SPAN).contains(&port));

        // Case-insensitive: the normalized code derives the same port.
        let lower = RoomCode::parse("ab12cd").unwrap();
        assert_eq!(port, derive_host_port(&lower));
    }

    #[test]
    fn test_endpoint_identities() {
        let room = RoomCode::parse("AB12CD").unwrap();
        let id = Uuid::nil();
        assert!(host_endpoint(&room).ends_with("/AB12CD/host"));
        let guest = guest_endpoint(&room, id);
        assert!(guest.contains("/AB12CD/"));
        assert!(guest.ends_with(&id.to_string()));
    }

    #[tokio::test]
    async fn test_guest_to_absent_room_is_room_not_found() {
        let room = RoomCode::generate();
        let (events, _rx) = mpsc::channel(8);
        let err = Signaling::guest(&room, Uuid::new_v4(), events)
            .await
            .err()
            .expect("no host is listening");
        assert!(matches!(err, SignalError::RoomNotFound));
    }

    #[tokio::test]
    async fn test_second_host_collides() {
        let room = RoomCode::generate();
        let (events1, _rx1) = mpsc::channel(8);
        let (events2, _rx2) = mpsc::channel(8);
        let _first = Signaling::host(&room, events1).await.unwrap();
        let err = Signaling::host(&room, events2).await.err().unwrap();
        assert!(matches!(err, SignalError::RoomCollision));
    }

    #[tokio::test]
    async fn test_host_guest_frame_exchange() {
        let room = RoomCode::generate();
        let guest_id = Uuid::new_v4();
        let (host_events, mut host_rx) = mpsc::channel(8);
        let (guest_events, _guest_rx) = mpsc::channel(8);

        let _host = Signaling::host(&room, host_events).await.unwrap();
        let (_guest, guest_channel) = Signaling::guest(&room, guest_id, guest_events)
            .await
            .unwrap();

        // Host sees Open first, then the inbound channel with the guest's
        // derived identity.
        let mut host_channel = loop {
            match host_rx.recv().await.expect("host event stream ended") {
                SignalEvent::PeerConnected(ch) => break ch,
                SignalEvent::Open { .. } => continue,
                SignalEvent::PeerDisconnected(_) => panic!("early disconnect"),
                SignalEvent::Error(e) => panic!("signal error: {e}"),
            }
        };
        assert_eq!(host_channel.peer_id, guest_id);

        let frame = WireMessage::PlayerLeave { id: guest_id }.encode().unwrap();
        guest_channel.outbound.send(frame).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), host_channel.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, WireMessage::PlayerLeave { id: guest_id });
    }

    #[tokio::test]
    async fn test_duplicate_guest_identity_is_rejected() {
        let room = RoomCode::generate();
        let guest_id = Uuid::new_v4();
        let (host_events, mut host_rx) = mpsc::channel(8);

        let _host = Signaling::host(&room, host_events).await.unwrap();

        let (ev1, _r1) = mpsc::channel(8);
        let (_g1, _ch1) = Signaling::guest(&room, guest_id, ev1).await.unwrap();
        // Drain the host's PeerConnected for the first guest.
        loop {
            match host_rx.recv().await.unwrap() {
                SignalEvent::PeerConnected(_) => break,
                _ => continue,
            }
        }

        let (ev2, _r2) = mpsc::channel(8);
        let second = Signaling::guest(&room, guest_id, ev2).await;
        assert!(
            second.is_err(),
            "same identity twice must fail the upgrade"
        );
    }
}
