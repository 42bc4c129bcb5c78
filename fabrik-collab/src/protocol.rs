//! Wire protocol for the factory-floor session.
//!
//! Every message that crosses a peer data channel is one [`WireMessage`],
//! serialized as a single JSON object per WebSocket text frame and tagged
//! by its `type` discriminator.
//!
//! ## Message directions
//!
//! | Tag               | Direction           | Handled by        |
//! |-------------------|---------------------|-------------------|
//! | `PLAYER_UPDATE`   | any → peers         | manager           |
//! | `PLAYER_JOIN`     | any → peers         | manager           |
//! | `PLAYER_LEAVE`    | any → peers         | manager           |
//! | `STATE_SYNC`      | host → all          | manager           |
//! | `FULL_STATE_SYNC` | host → new joiner   | manager           |
//! | `INTENT`          | guest → host        | manager (host)    |
//! | `INTENT_RESULT`   | host → requester    | manager (guest)   |
//! | `AI_VOTE`         | any → peers         | manager           |
//! | `CHAT`            | any → peers         | manager           |
//! | `PING` / `PONG`   | link ↔ link         | peer link only    |
//! | `MACHINE_LOCK`    | host → all          | manager           |
//!
//! ## Design rules
//!
//! 1. Every payload is `Serialize + Deserialize` with snake_case fields.
//! 2. `PING`/`PONG` never reach the synchronization manager — the peer
//!    link answers and consumes them.
//! 3. Timestamps are milliseconds on the sender's monotonic session clock;
//!    receivers never compare them across peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Participants are addressed by UUID everywhere.
pub type ParticipantId = Uuid;

/// Chat messages longer than this are truncated before send and on relay.
pub const MAX_CHAT_LEN: usize = 240;

// ───────────────────────────────────────────────────────────────────
// Room codes
// ───────────────────────────────────────────────────────────────────

/// Alphabet for generated room codes. No lowercase: codes are
/// case-insensitive and normalized to uppercase on entry.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ0123456789";

/// Number of characters in a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// A 6-character session identifier shared out-of-band between operators.
///
/// The host's network endpoint is derived deterministically from this code
/// (see [`crate::signal`]), so a room code is all a guest needs to find the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a fresh room code from UUID entropy.
    pub fn generate() -> Self {
        let entropy = Uuid::new_v4().as_u128();
        let mut code = String::with_capacity(ROOM_CODE_LEN);
        let mut bits = entropy;
        for _ in 0..ROOM_CODE_LEN {
            let idx = (bits % ROOM_CODE_ALPHABET.len() as u128) as usize;
            code.push(ROOM_CODE_ALPHABET[idx] as char);
            bits /= ROOM_CODE_ALPHABET.len() as u128;
        }
        Self(code)
    }

    /// Parse user input: trims, uppercases, validates length and charset.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let normalized: String = input.trim().to_ascii_uppercase();
        if normalized.len() != ROOM_CODE_LEN
            || !normalized.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ProtocolError::InvalidRoomCode(input.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Participants
// ───────────────────────────────────────────────────────────────────

/// Fixed display palette for participant avatars. The host assigns the
/// first unused entry to each joiner; [`fallback_color`] covers overflow.
pub const PALETTE: [[f32; 3]; 8] = [
    [0.91, 0.30, 0.24], // red
    [0.18, 0.55, 0.85], // blue
    [0.20, 0.70, 0.40], // green
    [0.95, 0.70, 0.16], // amber
    [0.61, 0.35, 0.71], // violet
    [0.10, 0.67, 0.66], // teal
    [0.93, 0.45, 0.63], // pink
    [0.55, 0.57, 0.62], // slate
];

/// Pick a display color for a joiner: the first palette entry nobody is
/// using, or the uuid-derived fallback once all eight are taken.
pub fn assign_color(in_use: &[[f32; 3]], id: ParticipantId) -> [f32; 3] {
    PALETTE
        .iter()
        .find(|c| !in_use.contains(*c))
        .copied()
        .unwrap_or_else(|| fallback_color(id))
}

/// Stable pseudo-random color for a participant when the palette is
/// exhausted. Derived from the UUID hash so every peer computes the same
/// color without coordination.
pub fn fallback_color(id: ParticipantId) -> [f32; 3] {
    let hash = id.as_u128();
    let r = ((hash >> 16) & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = (hash & 0xFF) as f32 / 255.0;
    // Lift toward white so avatars stay visible on dark floors.
    [0.3 + 0.7 * r, 0.3 + 0.7 * g, 0.3 + 0.7 * b]
}

/// Identity and display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub id: ParticipantId,
    pub name: String,
    /// RGB avatar color, host-assigned from [`PALETTE`].
    pub color: [f32; 3],
}

impl PlayerProfile {
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: name.into(),
            color: fallback_color(id),
        }
    }
}

/// A participant's kinematic state, pushed on every local-state tick.
///
/// The local player's fields come from the input/rendering collaborator;
/// remote players' fields are mutated only by inbound `PLAYER_UPDATE`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub position: [f32; 3],
    /// Heading in radians.
    pub yaw: f32,
    pub velocity: [f32; 3],
    /// Machine currently selected in the operator's HUD, if any.
    pub selected_machine: Option<String>,
    /// Sender's monotonic session clock, milliseconds.
    pub timestamp_ms: u64,
}

impl PlayerState {
    pub fn idle(timestamp_ms: u64) -> Self {
        Self {
            position: [0.0; 3],
            yaw: 0.0,
            velocity: [0.0; 3],
            selected_machine: None,
            timestamp_ms,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// World state
// ───────────────────────────────────────────────────────────────────

/// Ambient weather over the yard, part of every state diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    #[default]
    Clear,
    Overcast,
    Rain,
    Storm,
}

/// Authoritative status of one controllable machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub id: String,
    pub running: bool,
    /// Throughput setpoint in units/minute.
    pub rate: f32,
    pub fault: bool,
}

/// Incremental world update, host → all, ~10Hz.
///
/// Carries only machines whose status changed since the previous tick,
/// plus the fields that are cheap to always include. `sequence` is
/// strictly increasing; receivers drop anything at or below their last
/// applied sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub sequence: u64,
    pub machines: Vec<MachineStatus>,
    /// Simulated shift clock, minutes since shift start.
    pub world_clock_min: f32,
    pub weather: Weather,
    pub emergency: bool,
    pub timestamp_ms: u64,
}

/// Complete world state, host → new joiner, sent exactly once per join.
///
/// Always resets the receiver's sequence baseline, unlike a [`StateDiff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSnapshot {
    pub sequence: u64,
    pub machines: Vec<MachineStatus>,
    /// machine id → lock holder.
    pub locks: std::collections::HashMap<String, ParticipantId>,
    pub world_clock_min: f32,
    pub weather: Weather,
    pub emergency: bool,
}

// ───────────────────────────────────────────────────────────────────
// Intents
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Start,
    Stop,
    Adjust,
}

/// Lock traffic rides on `Adjust` intents so the host validates lock
/// requests and machine commands through one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Acquire,
    Release,
}

/// Parameters for an `Adjust` intent. `Start`/`Stop` carry the default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AdjustParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockAction>,
}

/// A requested world mutation, validated and applied only by the host.
///
/// Ephemeral: discarded once the matching [`IntentResult`] is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub kind: IntentKind,
    pub machine_id: String,
    pub requester: ParticipantId,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub params: AdjustParams,
}

/// Host's verdict on an intent, routed back only to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntentResult {
    pub fn ok(intent_id: Uuid) -> Self {
        Self {
            intent_id,
            success: true,
            error: None,
        }
    }

    pub fn rejected(intent_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            intent_id,
            success: false,
            error: Some(error.into()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Chat & advisor votes
// ───────────────────────────────────────────────────────────────────

/// One chat line. Text is capped at [`MAX_CHAT_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub from: ParticipantId,
    pub from_name: String,
    pub text: String,
    pub timestamp_ms: u64,
}

impl ChatMessage {
    pub fn new(
        from: ParticipantId,
        from_name: impl Into<String>,
        text: &str,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            from_name: from_name.into(),
            text: truncate_chat(text),
            timestamp_ms,
        }
    }
}

/// Cap chat text at [`MAX_CHAT_LEN`] characters, char-boundary safe.
pub fn truncate_chat(text: &str) -> String {
    text.chars().take(MAX_CHAT_LEN).collect()
}

/// A participant's vote on an AI advisor proposal.
///
/// Ballots are broadcast like chat; every peer keeps the tally. A voter's
/// latest ballot per proposal wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteBallot {
    pub proposal_id: String,
    pub voter: ParticipantId,
    pub approve: bool,
    pub timestamp_ms: u64,
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Top-level wire message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    PlayerUpdate {
        id: ParticipantId,
        state: PlayerState,
    },
    PlayerJoin {
        profile: PlayerProfile,
    },
    PlayerLeave {
        id: ParticipantId,
    },
    StateSync {
        diff: StateDiff,
    },
    FullStateSync {
        snapshot: FullSnapshot,
    },
    Intent {
        intent: Intent,
    },
    IntentResult {
        result: IntentResult,
    },
    AiVote {
        vote: VoteBallot,
    },
    Chat {
        message: ChatMessage,
    },
    Ping {
        nonce: u64,
        timestamp_ms: u64,
    },
    Pong {
        nonce: u64,
        /// Echo of the originating ping's timestamp.
        timestamp_ms: u64,
    },
    MachineLock {
        machine_id: String,
        holder: Option<ParticipantId>,
    },
}

impl WireMessage {
    /// Serialize to one JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Errors raised at the protocol boundary.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_code_generate_shape() {
        let code = RoomCode::generate();
        assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
        assert!(code
            .as_str()
            .bytes()
            .all(|b| ROOM_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_room_code_normalizes_case() {
        let code = RoomCode::parse(" ab12cd ").unwrap();
        assert_eq!(code.as_str(), "AB12CD");
        assert_eq!(code, RoomCode::parse("AB12CD").unwrap());
    }

    #[test]
    fn test_room_code_rejects_bad_input() {
        assert!(RoomCode::parse("AB12C").is_err()); // too short
        assert!(RoomCode::parse("AB12CDE").is_err()); // too long
        assert!(RoomCode::parse("AB 2CD").is_err()); // whitespace inside
        assert!(RoomCode::parse("AB!2CD").is_err()); // punctuation
    }

    #[test]
    fn test_wire_tags_match_contract() {
        let id = Uuid::new_v4();
        let cases = vec![
            (
                WireMessage::PlayerUpdate {
                    id,
                    state: PlayerState::idle(0),
                },
                "PLAYER_UPDATE",
            ),
            (
                WireMessage::PlayerJoin {
                    profile: PlayerProfile::new("Mara"),
                },
                "PLAYER_JOIN",
            ),
            (WireMessage::PlayerLeave { id }, "PLAYER_LEAVE"),
            (
                WireMessage::FullStateSync {
                    snapshot: FullSnapshot {
                        sequence: 0,
                        machines: vec![],
                        locks: Default::default(),
                        world_clock_min: 0.0,
                        weather: Weather::Clear,
                        emergency: false,
                    },
                },
                "FULL_STATE_SYNC",
            ),
            (
                WireMessage::AiVote {
                    vote: VoteBallot {
                        proposal_id: "rebalance-line-2".into(),
                        voter: id,
                        approve: true,
                        timestamp_ms: 1,
                    },
                },
                "AI_VOTE",
            ),
            (
                WireMessage::Ping {
                    nonce: 1,
                    timestamp_ms: 2,
                },
                "PING",
            ),
            (
                WireMessage::MachineLock {
                    machine_id: "press-1".into(),
                    holder: None,
                },
                "MACHINE_LOCK",
            ),
        ];
        for (msg, tag) in cases {
            let json = msg.encode().unwrap();
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value["type"], tag, "wrong tag in {json}");
        }
    }

    #[test]
    fn test_state_sync_roundtrip() {
        let diff = StateDiff {
            sequence: 7,
            machines: vec![MachineStatus {
                id: "press-1".into(),
                running: true,
                rate: 42.5,
                fault: false,
            }],
            world_clock_min: 125.0,
            weather: Weather::Rain,
            emergency: false,
            timestamp_ms: 1000,
        };
        let msg = WireMessage::StateSync { diff: diff.clone() };
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::StateSync { diff: d } => assert_eq!(d, diff),
            other => panic!("expected STATE_SYNC, got {other:?}"),
        }
    }

    #[test]
    fn test_intent_defaults_params() {
        // An intent without params on the wire decodes with empty params.
        let json = format!(
            r#"{{"type":"INTENT","intent":{{"id":"{}","kind":"start","machine_id":"press-1","requester":"{}","timestamp_ms":5}}}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let decoded = WireMessage::decode(&json).unwrap();
        match decoded {
            WireMessage::Intent { intent } => {
                assert_eq!(intent.kind, IntentKind::Start);
                assert_eq!(intent.params, AdjustParams::default());
            }
            other => panic!("expected INTENT, got {other:?}"),
        }
    }

    #[test]
    fn test_chat_truncation() {
        let long: String = "x".repeat(MAX_CHAT_LEN * 2);
        let msg = ChatMessage::new(Uuid::new_v4(), "Mara", &long, 0);
        assert_eq!(msg.text.chars().count(), MAX_CHAT_LEN);

        let short = ChatMessage::new(Uuid::new_v4(), "Mara", "hello", 0);
        assert_eq!(short.text, "hello");
    }

    #[test]
    fn test_assign_color_avoids_collisions() {
        let id = Uuid::new_v4();
        assert_eq!(assign_color(&[], id), PALETTE[0]);
        assert_eq!(assign_color(&PALETTE[..1], id), PALETTE[1]);
        assert_eq!(assign_color(&PALETTE[..3], id), PALETTE[3]);

        // Full palette: stable uuid-derived fallback, not a panic.
        let fallback = assign_color(&PALETTE, id);
        assert_eq!(fallback, fallback_color(id));
    }

    #[test]
    fn test_fallback_color_stable_and_bright() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(fallback_color(id), fallback_color(id));
        for c in fallback_color(id) {
            assert!((0.3..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_pong_echoes_ping_timestamp() {
        let ping = WireMessage::Ping {
            nonce: 9,
            timestamp_ms: 1234,
        };
        let json = ping.encode().unwrap();
        match WireMessage::decode(&json).unwrap() {
            WireMessage::Ping { nonce, timestamp_ms } => {
                let pong = WireMessage::Pong { nonce, timestamp_ms };
                let round = WireMessage::decode(&pong.encode().unwrap()).unwrap();
                assert_eq!(
                    round,
                    WireMessage::Pong {
                        nonce: 9,
                        timestamp_ms: 1234
                    }
                );
            }
            other => panic!("expected PING, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WireMessage::decode("not json").is_err());
        assert!(WireMessage::decode(r#"{"type":"NO_SUCH_TAG"}"#).is_err());
    }
}
