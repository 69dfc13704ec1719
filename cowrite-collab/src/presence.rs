//! Presence/awareness registry: who is in the room, where their cursor
//! is, and whether they are typing.
//!
//! Presence is deliberately *not* part of the replicated document.
//! Each client's state is overwritten wholesale on every update
//! (last write wins) — losing a stale cursor position has no
//! correctness cost, so there are no merge semantics here.
//!
//! ```text
//! keystroke ──► note_keystroke()            (is_typing = true, debounced)
//! cursor move ─► set_cursor()               (broadcast state)
//!                     │
//!                     ▼  (room transport)
//!            remote PresenceRegistry::apply_update()
//!                     │
//!                     ▼
//!            peers() / peer_count()          (UI collaborator list)
//! ```
//!
//! The typing flag auto-clears after 1.5 s without a keystroke, so the
//! wire sees one broadcast per transition instead of one per key.
//! Peers unheard from for 30 s (the transport heartbeat window) are
//! pruned.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text cursor location, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

impl CursorPos {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// RGBA color used to render a collaborator's cursor and label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl PresenceColor {
    /// Stable, visually distinct color derived from a client id.
    ///
    /// High-saturation HSL keyed on the id hash, so the same client gets
    /// the same color in every session and on every peer.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for PresenceColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One client's ephemeral state. Owned by that client; everyone else
/// overwrites their copy wholesale on each update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPresence {
    pub client_id: Uuid,
    pub display_name: String,
    pub color: PresenceColor,
    pub cursor: CursorPos,
    pub is_typing: bool,
    /// Wall-clock milliseconds of the last update from this client.
    pub last_seen_ms: u64,
}

impl ClientPresence {
    pub fn new(client_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
            color: PresenceColor::from_uuid(client_id),
            cursor: CursorPos::default(),
            is_typing: false,
            last_seen_ms: now_ms(),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct PeerEntry {
    state: ClientPresence,
    last_heard: Instant,
}

/// Result of a registry maintenance tick.
#[derive(Debug, Default)]
pub struct PresenceTick {
    /// Local state to broadcast because the typing flag auto-cleared.
    pub typing_cleared: Option<ClientPresence>,
    /// Peers pruned for missing the staleness window.
    pub expired: Vec<Uuid>,
}

/// Tracks the local client's presence plus every peer heard from.
pub struct PresenceRegistry {
    local: ClientPresence,
    peers: HashMap<Uuid, PeerEntry>,
    /// When the typing flag should fall back to false.
    typing_deadline: Option<Instant>,
    typing_idle: Duration,
    stale_after: Duration,
}

impl PresenceRegistry {
    pub const TYPING_IDLE: Duration = Duration::from_millis(1500);
    pub const STALE_AFTER: Duration = Duration::from_secs(30);

    pub fn new(client_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            local: ClientPresence::new(client_id, display_name),
            peers: HashMap::new(),
            typing_deadline: None,
            typing_idle: Self::TYPING_IDLE,
            stale_after: Self::STALE_AFTER,
        }
    }

    /// Custom debounce/staleness windows (for testing).
    pub fn with_timeouts(
        client_id: Uuid,
        display_name: impl Into<String>,
        typing_idle: Duration,
        stale_after: Duration,
    ) -> Self {
        let mut reg = Self::new(client_id, display_name);
        reg.typing_idle = typing_idle;
        reg.stale_after = stale_after;
        reg
    }

    pub fn local_state(&self) -> &ClientPresence {
        &self.local
    }

    pub fn client_id(&self) -> Uuid {
        self.local.client_id
    }

    /// Publish a complete local state. Returns the state to broadcast.
    pub fn set_local_state(&mut self, cursor: CursorPos, is_typing: bool) -> ClientPresence {
        self.local.cursor = cursor;
        self.local.is_typing = is_typing;
        self.local.last_seen_ms = now_ms();
        self.typing_deadline = is_typing.then(|| Instant::now() + self.typing_idle);
        self.local.clone()
    }

    /// Move the local cursor. Returns the state to broadcast.
    pub fn set_cursor(&mut self, cursor: CursorPos) -> ClientPresence {
        self.local.cursor = cursor;
        self.local.last_seen_ms = now_ms();
        self.local.clone()
    }

    /// Record a keystroke. Returns the state to broadcast only on the
    /// false→true transition; repeats just push the debounce deadline.
    pub fn note_keystroke(&mut self) -> Option<ClientPresence> {
        self.typing_deadline = Some(Instant::now() + self.typing_idle);
        if self.local.is_typing {
            return None;
        }
        self.local.is_typing = true;
        self.local.last_seen_ms = now_ms();
        Some(self.local.clone())
    }

    /// Periodic maintenance: auto-clear the typing flag after the idle
    /// window and prune peers past the staleness threshold.
    pub fn tick(&mut self) -> PresenceTick {
        let now = Instant::now();
        let mut out = PresenceTick::default();

        if self.local.is_typing {
            if let Some(deadline) = self.typing_deadline {
                if now >= deadline {
                    self.local.is_typing = false;
                    self.typing_deadline = None;
                    self.local.last_seen_ms = now_ms();
                    out.typing_cleared = Some(self.local.clone());
                }
            }
        }

        let stale_after = self.stale_after;
        let expired: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_heard) > stale_after)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
            log::debug!("presence: pruned stale peer {id}");
        }
        out.expired = expired;
        out
    }

    /// Apply a peer's update, overwriting any previous state wholesale.
    /// Updates carrying our own id are ignored.
    pub fn apply_update(&mut self, state: ClientPresence) {
        if state.client_id == self.local.client_id {
            return;
        }
        self.peers.insert(
            state.client_id,
            PeerEntry {
                state,
                last_heard: Instant::now(),
            },
        );
    }

    /// Drop a peer immediately (clean leave or transport notification).
    pub fn remove_peer(&mut self, client_id: Uuid) -> bool {
        self.peers.remove(&client_id).is_some()
    }

    /// All known peers, unordered.
    pub fn peers(&self) -> Vec<&ClientPresence> {
        self.peers.values().map(|p| &p.state).collect()
    }

    /// Peers currently flagged as typing.
    pub fn typing_peers(&self) -> Vec<&ClientPresence> {
        self.peers
            .values()
            .map(|p| &p.state)
            .filter(|s| s.is_typing)
            .collect()
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&ClientPresence> {
        self.peers.get(client_id).map(|p| &p.state)
    }

    /// Remote collaborator count (local client excluded).
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fast_registry(client: Uuid) -> PresenceRegistry {
        PresenceRegistry::with_timeouts(
            client,
            "Local",
            Duration::from_millis(20),
            Duration::from_millis(40),
        )
    }

    #[test]
    fn test_color_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PresenceColor::from_uuid(id), PresenceColor::from_uuid(id));
    }

    #[test]
    fn test_color_in_range() {
        let c = PresenceColor::from_uuid(Uuid::new_v4());
        for v in [c.r, c.g, c.b] {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_hsl_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_set_cursor_broadcast_state() {
        let id = Uuid::new_v4();
        let mut reg = PresenceRegistry::new(id, "Alice");
        let state = reg.set_cursor(CursorPos::new(3, 14));
        assert_eq!(state.client_id, id);
        assert_eq!(state.cursor, CursorPos::new(3, 14));
        assert!(!state.is_typing);
    }

    #[test]
    fn test_typing_transition_broadcast_once() {
        let mut reg = fast_registry(Uuid::new_v4());
        let first = reg.note_keystroke();
        assert!(first.is_some());
        assert!(first.unwrap().is_typing);
        // Further keystrokes only extend the debounce window.
        assert!(reg.note_keystroke().is_none());
        assert!(reg.note_keystroke().is_none());
    }

    #[test]
    fn test_typing_auto_clears() {
        let mut reg = fast_registry(Uuid::new_v4());
        reg.note_keystroke();
        assert!(reg.local_state().is_typing);

        // Before the idle window: no clear.
        let tick = reg.tick();
        assert!(tick.typing_cleared.is_none());

        thread::sleep(Duration::from_millis(25));
        let tick = reg.tick();
        let cleared = tick.typing_cleared.expect("typing should auto-clear");
        assert!(!cleared.is_typing);
        assert!(!reg.local_state().is_typing);
    }

    #[test]
    fn test_keystroke_extends_deadline() {
        let mut reg = fast_registry(Uuid::new_v4());
        reg.note_keystroke();
        thread::sleep(Duration::from_millis(12));
        reg.note_keystroke(); // re-arm
        thread::sleep(Duration::from_millis(12));
        // Still inside the re-armed window.
        assert!(reg.tick().typing_cleared.is_none());
        assert!(reg.local_state().is_typing);
    }

    #[test]
    fn test_apply_update_lww() {
        let mut reg = fast_registry(Uuid::new_v4());
        let peer_id = Uuid::new_v4();

        let mut state = ClientPresence::new(peer_id, "Bob");
        state.cursor = CursorPos::new(1, 1);
        reg.apply_update(state);

        let mut newer = ClientPresence::new(peer_id, "Bob");
        newer.cursor = CursorPos::new(9, 9);
        newer.is_typing = true;
        reg.apply_update(newer);

        assert_eq!(reg.peer_count(), 1);
        let seen = reg.peer(&peer_id).unwrap();
        assert_eq!(seen.cursor, CursorPos::new(9, 9));
        assert!(seen.is_typing);
    }

    #[test]
    fn test_own_update_ignored() {
        let id = Uuid::new_v4();
        let mut reg = fast_registry(id);
        reg.apply_update(ClientPresence::new(id, "Echo"));
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn test_peer_expiry() {
        let mut reg = fast_registry(Uuid::new_v4());
        let peer_id = Uuid::new_v4();
        let mut state = ClientPresence::new(peer_id, "Bob");
        state.is_typing = true;
        reg.apply_update(state);
        assert_eq!(reg.peer_count(), 1);
        assert_eq!(reg.typing_peers().len(), 1);

        thread::sleep(Duration::from_millis(50));
        let tick = reg.tick();
        assert_eq!(tick.expired, vec![peer_id]);
        assert_eq!(reg.peer_count(), 0);
        // No false typing indicator after removal.
        assert!(reg.typing_peers().is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_peer_alive() {
        let mut reg = fast_registry(Uuid::new_v4());
        let peer_id = Uuid::new_v4();
        reg.apply_update(ClientPresence::new(peer_id, "Bob"));
        thread::sleep(Duration::from_millis(25));
        // Heartbeat refresh.
        reg.apply_update(ClientPresence::new(peer_id, "Bob"));
        thread::sleep(Duration::from_millis(25));
        let tick = reg.tick();
        assert!(tick.expired.is_empty());
        assert_eq!(reg.peer_count(), 1);
    }

    #[test]
    fn test_remove_peer_explicit() {
        let mut reg = fast_registry(Uuid::new_v4());
        let peer_id = Uuid::new_v4();
        reg.apply_update(ClientPresence::new(peer_id, "Bob"));
        assert!(reg.remove_peer(peer_id));
        assert!(!reg.remove_peer(peer_id));
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn test_presence_roundtrip_bincode() {
        let state = ClientPresence::new(Uuid::new_v4(), "Alice");
        let bytes =
            bincode::serde::encode_to_vec(&state, bincode::config::standard()).unwrap();
        let (back, _): (ClientPresence, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(state, back);
    }
}
