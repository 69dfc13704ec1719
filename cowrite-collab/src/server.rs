//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── TextReplica ── RoomChannel
//! Client B ──┘         │
//!                      ├── ownership table (file → claim)
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! Each room maintains:
//! - A server-side `TextReplica` merged from every member's batches,
//!   so late joiners can resync from op history without peer help
//! - A `RoomChannel` for fan-out to members
//! - The advisory ownership table, replayed to joiners
//!
//! The server relays edits without transforming them; convergence is
//! the replica's job, not the transport's.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomChannel;
use crate::ownership::OwnershipRecord;
use crate::protocol::WireMessage;
use crate::replica::TextReplica;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_peers_per_room: usize,
    /// Fan-out channel capacity per room
    pub channel_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            channel_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One document room: authoritative replica + ownership + fan-out.
struct Room {
    /// Server-side replica, merged from every member's batches. The
    /// server authors nothing itself, so it uses the nil client id.
    replica: TextReplica,
    /// Advisory ownership claims, file id → record.
    ownership: HashMap<String, OwnershipRecord>,
    channel: Arc<RoomChannel>,
}

impl Room {
    fn new(channel_capacity: usize) -> Self {
        Self {
            replica: TextReplica::new(Uuid::nil()),
            ownership: HashMap::new(),
            channel: Arc::new(RoomChannel::new(channel_capacity)),
        }
    }
}

/// The room server.
pub struct CollabServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<String, Room>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut client_id: Option<Uuid> = None;
        let mut room_id: Option<String> = None;
        let mut room_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let wire_msg = match WireMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    // Malformed frames never take the connection down.
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match wire_msg {
                                WireMessage::JoinRoom { room_id: rid, participant } => {
                                    // One membership per connection. A second join
                                    // would orphan the old membership and leak the
                                    // old room's receiver.
                                    if client_id.is_some() {
                                        log::warn!(
                                            "Ignoring re-join from {addr}: connection already in a room"
                                        );
                                        continue;
                                    }

                                    let mut rooms_w = rooms.write().await;
                                    let room = rooms_w
                                        .entry(rid.clone())
                                        .or_insert_with(|| Room::new(config.channel_capacity));

                                    if room.channel.member_count().await >= config.max_peers_per_room {
                                        log::warn!(
                                            "Room {rid} full ({} members); rejecting {}",
                                            config.max_peers_per_room,
                                            participant.client_id
                                        );
                                        break;
                                    }

                                    client_id = Some(participant.client_id);
                                    room_id = Some(rid.clone());
                                    room_rx = Some(room.channel.add_member(participant.clone()).await);

                                    // Snapshot state for the joiner before releasing the lock.
                                    let history = room.replica.history();
                                    let text_hash = room.replica.text_hash();
                                    let claims: Vec<(String, OwnershipRecord)> = room
                                        .ownership
                                        .iter()
                                        .map(|(f, r)| (f.clone(), r.clone()))
                                        .collect();
                                    let members = room.channel.members().await;
                                    let channel = room.channel.clone();
                                    let room_count = rooms_w.len();
                                    drop(rooms_w);

                                    // Direct-send the full history so the joiner
                                    // converges before seeing live traffic.
                                    let resync = WireMessage::Resync {
                                        room_id: rid.clone(),
                                        ops: history,
                                        text_hash,
                                    };
                                    ws_sender.send(Message::Binary(resync.encode()?.into())).await?;

                                    // Replay active claims to the joiner only.
                                    for (file_id, record) in claims {
                                        let claim = WireMessage::OwnershipClaim {
                                            room_id: rid.clone(),
                                            file_id,
                                            record,
                                        };
                                        ws_sender.send(Message::Binary(claim.encode()?.into())).await?;
                                    }

                                    // Everyone (joiner included) gets the new roster.
                                    let status = WireMessage::RoomStatus {
                                        room_id: rid.clone(),
                                        members,
                                    };
                                    let _ = channel.send(&status);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!(
                                        "Client {} ({}) joined room {rid}",
                                        participant.name,
                                        participant.client_id
                                    );
                                }

                                WireMessage::OperationBatch { room_id: rid, client_id: cid, seq, ops } => {
                                    // Merge into the authoritative replica, then relay.
                                    let channel = {
                                        let mut rooms_w = rooms.write().await;
                                        match rooms_w.get_mut(&rid) {
                                            Some(room) => {
                                                for op in &ops {
                                                    room.replica.merge_remote(op);
                                                }
                                                Some(room.channel.clone())
                                            }
                                            None => None,
                                        }
                                    };
                                    if let Some(channel) = channel {
                                        let msg = WireMessage::OperationBatch {
                                            room_id: rid,
                                            client_id: cid,
                                            seq,
                                            ops,
                                        };
                                        let _ = channel.send(&msg);
                                    }
                                }

                                WireMessage::PresenceUpdate { room_id: rid, state } => {
                                    // Ephemeral; relay without touching room state.
                                    log::trace!("Presence update from {} in room {rid}", state.client_id);
                                    let channel = {
                                        let rooms_r = rooms.read().await;
                                        rooms_r.get(&rid).map(|r| r.channel.clone())
                                    };
                                    if let Some(channel) = channel {
                                        let msg = WireMessage::PresenceUpdate { room_id: rid, state };
                                        let _ = channel.send(&msg);
                                    }
                                }

                                WireMessage::OwnershipClaim { room_id: rid, file_id, record } => {
                                    // Last write to reach the server wins.
                                    let channel = {
                                        let mut rooms_w = rooms.write().await;
                                        match rooms_w.get_mut(&rid) {
                                            Some(room) => {
                                                room.ownership.insert(file_id.clone(), record.clone());
                                                Some(room.channel.clone())
                                            }
                                            None => None,
                                        }
                                    };
                                    if let Some(channel) = channel {
                                        log::info!("Claim on {file_id} by {} in room {rid}", record.owner_name);
                                        let msg = WireMessage::OwnershipClaim { room_id: rid, file_id, record };
                                        let _ = channel.send(&msg);
                                    }
                                }

                                WireMessage::OwnershipRelease { room_id: rid, file_id, client_id: cid } => {
                                    // Honored only from the current owner.
                                    let channel = {
                                        let mut rooms_w = rooms.write().await;
                                        match rooms_w.get_mut(&rid) {
                                            Some(room) => {
                                                match room.ownership.get(&file_id) {
                                                    Some(r) if r.owner == cid => {
                                                        room.ownership.remove(&file_id);
                                                        Some(room.channel.clone())
                                                    }
                                                    _ => {
                                                        log::debug!(
                                                            "Ignoring release of {file_id} from non-owner {cid}"
                                                        );
                                                        None
                                                    }
                                                }
                                            }
                                            None => None,
                                        }
                                    };
                                    if let Some(channel) = channel {
                                        let msg = WireMessage::OwnershipRelease {
                                            room_id: rid,
                                            file_id,
                                            client_id: cid,
                                        };
                                        let _ = channel.send(&msg);
                                    }
                                }

                                WireMessage::LeaveRoom { .. } => {
                                    log::info!("Client {client_id:?} leaving room {room_id:?}");
                                    break;
                                }

                                WireMessage::Ping { client_id: cid } => {
                                    let pong = WireMessage::Pong { client_id: cid };
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                WireMessage::RoomStatus { .. }
                                | WireMessage::Resync { .. }
                                | WireMessage::Pong { .. } => {
                                    // Server-authored variants arriving inbound are a
                                    // client bug; drop them.
                                    log::debug!("Ignoring server-authored variant from {addr}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room traffic
                msg = async {
                    if let Some(ref mut rx) = room_rx {
                        rx.recv().await
                    } else {
                        // Not in a room yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo a client's own frames back.
                            if let Ok(wire_msg) = WireMessage::decode(&data) {
                                if wire_msg.sender().is_some() && wire_msg.sender() == client_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The receiver skipped n frames. The room replica has
                            // already merged everything that was fanned out, so a
                            // full history resync catches this client up.
                            log::warn!("Client {client_id:?} lagged by {n} frames; resyncing");
                            if let Some(ref rid) = room_id {
                                let resync = {
                                    let rooms_r = rooms.read().await;
                                    rooms_r.get(rid).map(|room| {
                                        room.channel.note_lagged(n);
                                        WireMessage::Resync {
                                            room_id: rid.clone(),
                                            ops: room.replica.history(),
                                            text_hash: room.replica.text_hash(),
                                        }
                                    })
                                };
                                if let Some(resync) = resync {
                                    ws_sender.send(Message::Binary(resync.encode()?.into())).await?;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: remove member, notify the room, drop empty rooms.
        if let (Some(cid), Some(rid)) = (client_id, room_id) {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&rid) {
                room.channel.remove_member(&cid).await;

                let status = WireMessage::RoomStatus {
                    room_id: rid.clone(),
                    members: room.channel.members().await,
                };
                let _ = room.channel.send(&status);

                if room.channel.member_count().await == 0 {
                    rooms_w.remove(&rid);
                    log::info!("Room {rid} removed (empty)");
                }
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms_w.len();
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
