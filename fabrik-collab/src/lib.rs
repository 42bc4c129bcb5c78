//! # fabrik-collab — multiplayer synchronization for the shared factory floor
//!
//! Host-authoritative peer sessions over direct data channels: one
//! participant owns the world, everyone else mirrors it and negotiates
//! changes through intents.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   join /<ROOM>/<id>   ┌────────────┐
//! │ SyncManager │ ◄───────────────────► │ SyncManager │
//! │  (guest)    │    JSON wire frames   │   (host)    │
//! └──────┬─────┘                        └──────┬─────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌────────────┐                        ┌────────────┐
//! │ SessionState│  ◄── mirrors ───      │ SessionState│
//! │ + interp    │                       │ + lock map  │
//! └──────┬─────┘                        └──────┬─────┘
//!        │                                     │
//!        ▼                              ┌──────┴──────┐
//!  rendering / UI                       │ domain store │
//!  (collaborators)                      │ (collaborator)│
//!                                       └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and session entities
//! - [`signal`] — endpoint derivation and channel establishment
//! - [`link`] — per-peer queuing, latency probing, stale detection
//! - [`interp`] — jitter-absorbing motion interpolation
//! - [`session`] — lifecycle-scoped state store and derived views
//! - [`manager`] — the orchestrator: authority, loops, handshakes
//!
//! ## Session shape
//!
//! Exactly one host per room; guests open exactly one channel each, to
//! the host's room-code-derived endpoint. A disconnected host ends the
//! session — there is no migration. Guests never write world state
//! directly: every mutation travels as an intent and comes back as an
//! authoritative diff or lock broadcast.

pub mod interp;
pub mod link;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod signal;

pub use interp::{InterpolatedState, InterpolationBuffer, MotionSample};
pub use link::{PeerChannel, PeerLink};
pub use manager::{
    IntentHandler, IntentOutcome, SessionEvent, StateProvider, SyncConfig, SyncError,
    SyncManager,
};
pub use protocol::{
    AdjustParams, ChatMessage, FullSnapshot, Intent, IntentKind, IntentResult, LockAction,
    MachineStatus, ParticipantId, PlayerProfile, PlayerState, ProtocolError, RoomCode,
    StateDiff, VoteBallot, Weather, WireMessage,
};
pub use session::{
    ConnectionState, PeerLinkInfo, SessionClock, SessionState, SharedState,
};
pub use signal::{SignalError, SignalEvent, Signaling};
