//! Lifecycle-scoped session state, written only by the synchronization
//! manager and read by everything else (UI, rendering).
//!
//! No validation lives here — authority checks happen in the manager;
//! this is the single place derived views (roster size, lock holder,
//! average latency, vote tallies, interpolated poses) are computed from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::interp::{InterpolatedState, InterpolationBuffer, MotionSample};
use crate::protocol::{
    ChatMessage, FullSnapshot, MachineStatus, ParticipantId, PlayerProfile, PlayerState,
    RoomCode, StateDiff, Weather,
};

/// Monotonic session-relative clock shared by links, buffers and loops.
///
/// All wire and interpolation timestamps are milliseconds since the
/// session epoch on the local machine; peers never compare clocks.
#[derive(Debug, Clone)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle. `Reconnecting` is reserved: today any mid-session
/// link loss routes straight back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// UI-facing mirror of one remote peer's link.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerLinkInfo {
    pub peer_id: ParticipantId,
    pub display_name: String,
    pub color: [f32; 3],
    pub latency_ms: u32,
    pub connection: ConnectionState,
}

/// A remote participant as tracked locally: identity, last reported
/// state, and the jitter buffer the renderer samples from.
pub struct RemoteParticipant {
    pub profile: PlayerProfile,
    pub state: PlayerState,
    pub interp: InterpolationBuffer,
    /// Receiver-local stamp of the last PLAYER_UPDATE.
    pub last_update_ms: u64,
}

impl RemoteParticipant {
    pub fn new(profile: PlayerProfile, now_ms: u64) -> Self {
        Self {
            profile,
            state: PlayerState::idle(0),
            interp: InterpolationBuffer::new(),
            last_update_ms: now_ms,
        }
    }
}

/// Shared handle to the session store.
pub type SharedState = Arc<RwLock<SessionState>>;

/// Everything the session knows, in one place.
pub struct SessionState {
    pub room: RoomCode,
    pub local: PlayerProfile,
    pub is_host: bool,
    pub connection: ConnectionState,

    /// Local player's live kinematics, fed by the input collaborator and
    /// read by the 50 ms broadcast tick.
    pub local_player: PlayerState,

    roster: HashMap<ParticipantId, RemoteParticipant>,
    locks: HashMap<String, ParticipantId>,
    chat: Vec<ChatMessage>,
    seen_chat: HashSet<uuid::Uuid>,
    latencies: HashMap<ParticipantId, u32>,
    votes: HashMap<String, HashMap<ParticipantId, bool>>,

    /// Mirror of authoritative machine state (host: last diffed copy;
    /// guest: applied copy).
    pub machines: HashMap<String, MachineStatus>,
    pub world_clock_min: f32,
    pub weather: Weather,
    pub emergency: bool,
    /// Highest applied diff sequence; snapshots reset it.
    pub last_applied_sequence: u64,
}

impl SessionState {
    pub fn new(room: RoomCode, local: PlayerProfile, is_host: bool) -> Self {
        Self {
            room,
            local,
            is_host,
            connection: ConnectionState::Disconnected,
            local_player: PlayerState::idle(0),
            roster: HashMap::new(),
            locks: HashMap::new(),
            chat: Vec::new(),
            seen_chat: HashSet::new(),
            latencies: HashMap::new(),
            votes: HashMap::new(),
            machines: HashMap::new(),
            world_clock_min: 0.0,
            weather: Weather::Clear,
            emergency: false,
            last_applied_sequence: 0,
        }
    }

    pub fn shared(room: RoomCode, local: PlayerProfile, is_host: bool) -> SharedState {
        Arc::new(RwLock::new(Self::new(room, local, is_host)))
    }

    // ───────────────────────────────────────────────────────────────
    // Roster
    // ───────────────────────────────────────────────────────────────

    pub fn add_participant(&mut self, profile: PlayerProfile, now_ms: u64) {
        self.roster
            .insert(profile.id, RemoteParticipant::new(profile, now_ms));
    }

    pub fn remove_participant(&mut self, id: &ParticipantId) -> Option<PlayerProfile> {
        self.latencies.remove(id);
        self.roster.remove(id).map(|p| p.profile)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&RemoteParticipant> {
        self.roster.get(id)
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn roster_ids(&self) -> Vec<ParticipantId> {
        self.roster.keys().copied().collect()
    }

    pub fn profiles(&self) -> Vec<PlayerProfile> {
        self.roster.values().map(|p| p.profile.clone()).collect()
    }

    /// Colors currently in use, for host-side palette assignment.
    pub fn colors_in_use(&self) -> Vec<[f32; 3]> {
        let mut colors: Vec<[f32; 3]> =
            self.roster.values().map(|p| p.profile.color).collect();
        colors.push(self.local.color);
        colors
    }

    /// Record an inbound PLAYER_UPDATE: latest state plus a motion sample
    /// stamped with the receiver-local clock.
    pub fn record_player_update(
        &mut self,
        id: &ParticipantId,
        state: PlayerState,
        received_ms: u64,
    ) {
        if let Some(p) = self.roster.get_mut(id) {
            p.interp.add_sample(MotionSample {
                position: state.position,
                yaw: state.yaw,
                velocity: state.velocity,
                timestamp_ms: received_ms,
            });
            p.state = state;
            p.last_update_ms = received_ms;
        }
    }

    /// Smoothed pose for one remote participant, for the renderer.
    pub fn interpolated_state(
        &self,
        id: &ParticipantId,
        render_time_ms: u64,
    ) -> Option<InterpolatedState> {
        self.roster
            .get(id)
            .and_then(|p| p.interp.interpolated_state(render_time_ms))
    }

    // ───────────────────────────────────────────────────────────────
    // Locks
    // ───────────────────────────────────────────────────────────────

    pub fn lock_holder(&self, machine_id: &str) -> Option<ParticipantId> {
        self.locks.get(machine_id).copied()
    }

    pub fn set_lock(&mut self, machine_id: String, holder: Option<ParticipantId>) {
        match holder {
            Some(id) => {
                self.locks.insert(machine_id, id);
            }
            None => {
                self.locks.remove(&machine_id);
            }
        }
    }

    pub fn locks(&self) -> &HashMap<String, ParticipantId> {
        &self.locks
    }

    pub fn replace_locks(&mut self, locks: HashMap<String, ParticipantId>) {
        self.locks = locks;
    }

    /// Release every lock held by `id`, returning the machine ids cleared.
    pub fn clear_locks_held_by(&mut self, id: &ParticipantId) -> Vec<String> {
        let cleared: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, holder)| *holder == id)
            .map(|(m, _)| m.clone())
            .collect();
        for machine in &cleared {
            self.locks.remove(machine);
        }
        cleared
    }

    // ───────────────────────────────────────────────────────────────
    // Chat & votes
    // ───────────────────────────────────────────────────────────────

    /// Append a chat line. Duplicate message ids (e.g. a relayed copy of
    /// our own line) are ignored.
    pub fn record_chat(&mut self, message: ChatMessage) -> bool {
        if !self.seen_chat.insert(message.id) {
            return false;
        }
        self.chat.push(message);
        true
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat
    }

    /// Record a ballot; a voter's latest ballot per proposal wins.
    pub fn record_vote(&mut self, proposal_id: &str, voter: ParticipantId, approve: bool) {
        self.votes
            .entry(proposal_id.to_string())
            .or_default()
            .insert(voter, approve);
    }

    /// (approvals, rejections) for one proposal.
    pub fn vote_tally(&self, proposal_id: &str) -> (usize, usize) {
        match self.votes.get(proposal_id) {
            Some(ballots) => {
                let yes = ballots.values().filter(|v| **v).count();
                (yes, ballots.len() - yes)
            }
            None => (0, 0),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Latency
    // ───────────────────────────────────────────────────────────────

    pub fn record_latency(&mut self, id: ParticipantId, latency_ms: u32) {
        self.latencies.insert(id, latency_ms);
    }

    pub fn latency_ms(&self, id: &ParticipantId) -> Option<u32> {
        self.latencies.get(id).copied()
    }

    pub fn average_latency_ms(&self) -> Option<u32> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies.values().map(|l| *l as u64).sum();
        Some((sum / self.latencies.len() as u64) as u32)
    }

    /// Per-peer link mirror for the lobby/HUD.
    pub fn peer_infos(&self) -> Vec<PeerLinkInfo> {
        self.roster
            .values()
            .map(|p| PeerLinkInfo {
                peer_id: p.profile.id,
                display_name: p.profile.name.clone(),
                color: p.profile.color,
                latency_ms: self.latencies.get(&p.profile.id).copied().unwrap_or(0),
                connection: ConnectionState::Connected,
            })
            .collect()
    }

    // ───────────────────────────────────────────────────────────────
    // World mirror
    // ───────────────────────────────────────────────────────────────

    /// Overwrite the world mirror from a diff. Sequence gating is the
    /// manager's job; this just applies.
    pub fn apply_diff(&mut self, diff: &StateDiff) {
        for machine in &diff.machines {
            self.machines.insert(machine.id.clone(), machine.clone());
        }
        self.world_clock_min = diff.world_clock_min;
        self.weather = diff.weather;
        self.emergency = diff.emergency;
        self.last_applied_sequence = diff.sequence;
    }

    /// Reset the world mirror from a full snapshot. Always rebaselines
    /// the sequence, unlike a diff.
    pub fn apply_snapshot(&mut self, snapshot: &FullSnapshot) {
        self.machines = snapshot
            .machines
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        self.locks = snapshot.locks.clone();
        self.world_clock_min = snapshot.world_clock_min;
        self.weather = snapshot.weather;
        self.emergency = snapshot.emergency;
        self.last_applied_sequence = snapshot.sequence;
    }

    pub fn machine(&self, id: &str) -> Option<&MachineStatus> {
        self.machines.get(id)
    }

    /// Clear everything lifecycle-scoped. Used by leave/destroy.
    pub fn reset(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.roster.clear();
        self.locks.clear();
        self.chat.clear();
        self.seen_chat.clear();
        self.latencies.clear();
        self.votes.clear();
        self.machines.clear();
        self.last_applied_sequence = 0;
    }
}
