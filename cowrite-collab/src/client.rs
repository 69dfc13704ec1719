//! WebSocket client for a collaboration room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Operation batch send/receive
//! - Presence and ownership updates
//! - Offline queue for edits made while disconnected
//!
//! The client never mutates a replica itself; it shuttles frames
//! between the server and the application, which owns the
//! [`Reconciler`](crate::reconcile::Reconciler) and feeds
//! [`CollabEvent`]s into it.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::ownership::OwnershipRecord;
use crate::presence::ClientPresence;
use crate::protocol::{ParticipantInfo, ProtocolError, WireMessage};
use crate::replica::Operation;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote member's operation batch
    RemoteOps {
        client_id: Uuid,
        seq: u64,
        ops: Vec<Operation>,
    },
    /// A remote member's presence state
    PresenceUpdate(ClientPresence),
    /// Room membership changed
    RoomStatus(Vec<ParticipantInfo>),
    /// A file was claimed
    OwnershipClaimed {
        file_id: String,
        record: OwnershipRecord,
    },
    /// A claim was released
    OwnershipReleased { file_id: String, client_id: Uuid },
    /// Full history from the server; rebuild the replica from it
    Resynced { ops: Vec<Operation>, text_hash: u64 },
    /// Heartbeat answer
    Pong,
}

/// Edit batches made while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedBatch>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedBatch {
    seq: u64,
    ops: Vec<Operation>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a batch for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, seq: u64, ops: Vec<Operation>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedBatch { seq, ops });
        true
    }

    /// Drain all queued batches, in enqueue order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<Operation>)> {
        self.queue.drain(..).map(|b| (b.seq, b.ops)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total ops across all queued batches.
    pub fn total_ops(&self) -> usize {
        self.queue.iter().map(|b| b.ops.len()).sum()
    }
}

/// The room client.
///
/// Manages a WebSocket connection to the room server: join, operation
/// batches, presence, ownership, and offline queueing.
pub struct CollabClient {
    /// Our identity in the room
    participant: ParticipantInfo,

    /// Room we belong to
    room_id: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Monotone batch counter; a single client's batches apply in order
    seq: Arc<RwLock<u64>>,

    /// Edits made while disconnected
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<CollabEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<CollabEvent>,

    /// Server URL
    server_url: String,
}

impl CollabClient {
    pub fn new(
        participant: ParticipantInfo,
        room_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant,
            room_id: room_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            seq: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    /// On success the server answers with a `Resynced` event carrying
    /// the room's full history, then any queued offline batches replay.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

                // Outgoing frame channel
                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: forward outgoing channel to WebSocket
                let ws_writer = Arc::new(tokio::sync::Mutex::new(ws_writer));
                let writer = ws_writer.clone();
                tokio::spawn(async move {
                    while let Some(data) = out_rx.recv().await {
                        let mut w = writer.lock().await;
                        use futures_util::SinkExt;
                        if w.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                // First frame: join the room.
                let join = WireMessage::JoinRoom {
                    room_id: self.room_id.clone(),
                    participant: self.participant.clone(),
                };
                if let Ok(encoded) = join.encode() {
                    if let Some(ref tx) = self.outgoing_tx {
                        let _ = tx.send(encoded).await;
                    }
                }

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(CollabEvent::Connected).await;

                // Replay the offline queue
                {
                    let mut queue = self.offline_queue.lock().await;
                    let queued = queue.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued batches", queued.len());
                        for (seq, ops) in queued {
                            let msg = WireMessage::OperationBatch {
                                room_id: self.room_id.clone(),
                                client_id: self.participant.client_id,
                                seq,
                                ops,
                            };
                            if let Ok(encoded) = msg.encode() {
                                if let Some(ref tx) = self.outgoing_tx {
                                    let _ = tx.send(encoded).await;
                                }
                            }
                        }
                    }
                }

                // Reader task: map incoming frames to events
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                let my_id = self.participant.client_id;
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                                let bytes: Vec<u8> = data.into();
                                let wire_msg = match WireMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Dropping undecodable frame: {e}");
                                        continue;
                                    }
                                };

                                // A pong answers this client's own ping
                                // and carries our id, so it has to beat
                                // the own-frame filter.
                                if matches!(wire_msg, WireMessage::Pong { .. }) {
                                    let _ = event_tx.send(CollabEvent::Pong).await;
                                    continue;
                                }

                                // Skip our own frames (server filters too).
                                if wire_msg.sender() == Some(my_id) {
                                    continue;
                                }

                                let event = match wire_msg {
                                    WireMessage::OperationBatch { client_id, seq, ops, .. } => {
                                        Some(CollabEvent::RemoteOps { client_id, seq, ops })
                                    }
                                    WireMessage::PresenceUpdate { state, .. } => {
                                        Some(CollabEvent::PresenceUpdate(state))
                                    }
                                    WireMessage::RoomStatus { members, .. } => {
                                        Some(CollabEvent::RoomStatus(members))
                                    }
                                    WireMessage::OwnershipClaim { file_id, record, .. } => {
                                        Some(CollabEvent::OwnershipClaimed { file_id, record })
                                    }
                                    WireMessage::OwnershipRelease { file_id, client_id, .. } => {
                                        Some(CollabEvent::OwnershipReleased { file_id, client_id })
                                    }
                                    WireMessage::Resync { ops, text_hash, .. } => {
                                        Some(CollabEvent::Resynced { ops, text_hash })
                                    }
                                    _ => None,
                                };

                                if let Some(evt) = event {
                                    let _ = event_tx.send(evt).await;
                                }
                            }
                            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Connection lost
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(CollabEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Drop the current connection and dial the server again.
    ///
    /// The join handshake runs anew; the server answers with a fresh
    /// resync carrying the room's full history, and any offline
    /// batches replay. On failure the state falls back to
    /// [`ConnectionState::Disconnected`].
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Send an operation batch to the room.
    ///
    /// If disconnected, queues the batch for replay on reconnect.
    pub async fn send_operations(&self, ops: Vec<Operation>) -> Result<(), ProtocolError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut seq = self.seq.write().await;
        *seq += 1;
        let current_seq = *seq;
        drop(seq);

        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_seq, ops) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = WireMessage::OperationBatch {
            room_id: self.room_id.clone(),
            client_id: self.participant.client_id,
            seq: current_seq,
            ops,
        };
        self.send_frame(&msg).await
    }

    /// Send our presence state. Silently dropped while offline; stale
    /// presence is worse than none.
    pub async fn send_presence(&self, state: &ClientPresence) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = WireMessage::PresenceUpdate {
            room_id: self.room_id.clone(),
            state: state.clone(),
        };
        self.send_frame(&msg).await
    }

    /// Broadcast an ownership claim. Silently dropped while offline.
    pub async fn send_claim(
        &self,
        file_id: impl Into<String>,
        record: OwnershipRecord,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = WireMessage::OwnershipClaim {
            room_id: self.room_id.clone(),
            file_id: file_id.into(),
            record,
        };
        self.send_frame(&msg).await
    }

    /// Broadcast an ownership release. Silently dropped while offline.
    pub async fn send_release(&self, file_id: impl Into<String>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = WireMessage::OwnershipRelease {
            room_id: self.room_id.clone(),
            file_id: file_id.into(),
            client_id: self.participant.client_id,
        };
        self.send_frame(&msg).await
    }

    /// Send a heartbeat.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = WireMessage::Ping {
            client_id: self.participant.client_id,
        };
        self.send_frame(&msg).await
    }

    /// Leave the room cleanly.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        let msg = WireMessage::LeaveRoom {
            room_id: self.room_id.clone(),
            client_id: self.participant.client_id,
        };
        let result = self.send_frame(&msg).await;
        *self.state.write().await = ConnectionState::Disconnected;
        self.outgoing_tx = None;
        result
    }

    async fn send_frame(&self, msg: &WireMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current batch counter value.
    pub async fn seq(&self) -> u64 {
        *self.seq.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
