//! The synchronization manager: session lifecycle, authority, loops.
//!
//! One [`SyncManager`] is one session. The composition root creates it
//! via [`SyncManager::host_room`] or [`SyncManager::join_room`] and hands
//! clones to the UI and rendering layers — there is no global singleton.
//!
//! ## Authority
//!
//! Exactly one host per room. The host is the sole writer of machine
//! status, locks and the world clock; guests are read-only mirrors that
//! express desired changes exclusively through intents. Intent
//! validation is no-op tolerant: a `START` on an already-running machine
//! succeeds trivially, because latency means a client may re-issue an
//! intent before it sees the previous result.
//!
//! ## Loops
//!
//! Fixed periods, not event-driven, to bound bandwidth and keep
//! staleness easy to reason about:
//!
//! | Loop          | Period  | Role | Effect                              |
//! |---------------|---------|------|-------------------------------------|
//! | player update | 50 ms   | all  | own pose → every link               |
//! | state diff    | 100 ms  | host | changed machines + world → all      |
//! | liveness      | 1000 ms | all  | ping links, close the stale ones    |
//!
//! All session mutation funnels through one dispatch task, so host-local
//! processing order — not network arrival heuristics — decides conflicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::link::{PeerChannel, PeerLink};
use crate::protocol::{
    assign_color, truncate_chat, AdjustParams, ChatMessage, FullSnapshot, Intent,
    IntentKind, IntentResult, LockAction, ParticipantId, PlayerProfile, PlayerState,
    RoomCode, StateDiff, VoteBallot, WireMessage, PALETTE,
};
use crate::session::{ConnectionState, SessionClock, SessionState, SharedState};
use crate::signal::{SignalError, SignalEvent, Signaling};

/// Fixed loop periods and windows. Tests shrink these.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub player_update_interval: std::time::Duration,
    pub state_diff_interval: std::time::Duration,
    pub probe_interval: std::time::Duration,
    /// Guest join fails if no full snapshot arrives within this window.
    pub join_timeout: std::time::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            player_update_interval: std::time::Duration::from_millis(50),
            state_diff_interval: std::time::Duration::from_millis(100),
            probe_interval: std::time::Duration::from_millis(1000),
            join_timeout: std::time::Duration::from_secs(15),
        }
    }
}

/// Host-side seam to the external domain store: produces the machine
/// list and world fields for snapshots and diff ticks. Locks and
/// sequence numbers are stamped in by the manager.
pub trait StateProvider: Send + Sync {
    fn full_snapshot(&self) -> FullSnapshot;
}

/// Host-side seam that applies a validated intent against the external
/// domain store. Transitions must be no-op safe.
pub trait IntentHandler: Send + Sync {
    fn apply(&self, intent: &Intent) -> IntentOutcome;
}

/// Verdict from an [`IntentHandler`].
#[derive(Debug, Clone)]
pub struct IntentOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl IntentOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Session faults surfaced to the caller. Intent rejections are values
/// ([`IntentResult`]), never errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),
    #[error("room code already in use")]
    RoomCollision,
    #[error("room not found")]
    RoomNotFound,
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("no session snapshot arrived within the join window")]
    JoinTimeout,
    #[error("transport fault: {0}")]
    Transport(String),
}

impl From<SignalError> for SyncError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::RoomCollision => Self::RoomCollision,
            SignalError::RoomNotFound => Self::RoomNotFound,
            SignalError::ConnectTimeout => Self::ConnectTimeout,
            SignalError::Transport(t) => Self::Transport(t),
        }
    }
}

/// Notifications for the UI collaborator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// The authority vanished; the session is over. No host migration.
    HostLost,
    PeerJoined(PlayerProfile),
    PeerLeft(ParticipantId),
    Chat(ChatMessage),
    VoteCast(VoteBallot),
    LockChanged {
        machine_id: String,
        holder: Option<ParticipantId>,
    },
    StateApplied {
        sequence: u64,
    },
    Error(String),
}

const EVENT_CAPACITY: usize = 256;
const APP_CAPACITY: usize = 512;

/// One live session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    clock: SessionClock,
    state: SharedState,
    /// Fully joined peers. Guests hold exactly one entry: the host link,
    /// keyed by the nil id until the host's profile is known.
    links: RwLock<HashMap<ParticipantId, Arc<PeerLink>>>,
    /// Host only: channels open but not yet through the join handshake.
    pending_links: RwLock<HashMap<ParticipantId, Arc<PeerLink>>>,
    signaling: Mutex<Option<Signaling>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    app_tx: mpsc::Sender<(ParticipantId, WireMessage)>,
    /// Hand-off between `build` and `spawn_dispatch`.
    app_rx: Mutex<Option<mpsc::Receiver<(ParticipantId, WireMessage)>>>,
    state_provider: Option<Arc<dyn StateProvider>>,
    intent_handler: Option<Arc<dyn IntentHandler>>,
    /// Guest: intents awaiting their routed result.
    pending_intents: Mutex<HashMap<Uuid, oneshot::Sender<IntentResult>>>,
    /// Guest: resolves once the bootstrap snapshot applies.
    snapshot_waiter: Mutex<Option<oneshot::Sender<()>>>,
    /// Guest: the host's participant id, learned from its PLAYER_JOIN.
    host_peer: Mutex<Option<ParticipantId>>,
    /// Host: strictly increasing diff sequence.
    sequence: AtomicU64,
    torn_down: AtomicBool,
}

impl SyncManager {
    // ───────────────────────────────────────────────────────────────
    // Construction
    // ───────────────────────────────────────────────────────────────

    /// Allocate a room, become its host, start the loops. The returned
    /// session is `Connected` immediately.
    pub async fn host_room(
        name: &str,
        provider: Arc<dyn StateProvider>,
        handler: Arc<dyn IntentHandler>,
        config: SyncConfig,
    ) -> Result<(Self, RoomCode), SyncError> {
        let room = RoomCode::generate();
        let mut profile = PlayerProfile::new(name);
        profile.color = PALETTE[0];

        let (signal_tx, signal_rx) = mpsc::channel(EVENT_CAPACITY);
        let signaling = Signaling::host(&room, signal_tx).await?;

        let manager = Self::build(
            room.clone(),
            profile,
            true,
            signaling,
            config,
            Some(provider.clone()),
            Some(handler),
        );

        {
            // Seed the host's world mirror so intent validation has a
            // machine list before the first diff tick.
            let snapshot = provider.full_snapshot();
            let mut state = manager.inner.state.write().await;
            state.apply_snapshot(&snapshot);
            state.connection = ConnectionState::Connected;
        }
        manager.emit(SessionEvent::Connected);

        manager.spawn_dispatch(signal_rx);
        manager.spawn_player_update_loop();
        manager.spawn_diff_loop();
        manager.spawn_probe_loop();

        info!("hosting room {room}");
        Ok((manager, room))
    }

    /// Join an existing room as a guest. Fails — tearing the partial
    /// connection down — unless the host's full snapshot arrives within
    /// the join window.
    pub async fn join_room(
        code: &str,
        name: &str,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let room = RoomCode::parse(code)
            .map_err(|_| SyncError::InvalidRoomCode(code.to_string()))?;
        let profile = PlayerProfile::new(name);
        let local_id = profile.id;

        let (signal_tx, signal_rx) = mpsc::channel(EVENT_CAPACITY);
        let (signaling, channel) = Signaling::guest(&room, local_id, signal_tx).await?;

        let manager = Self::build(room.clone(), profile.clone(), false, signaling, config, None, None);
        {
            let mut state = manager.inner.state.write().await;
            state.connection = ConnectionState::Connecting;
        }

        let (snap_tx, snap_rx) = oneshot::channel();
        *manager.inner.snapshot_waiter.lock().unwrap() = Some(snap_tx);

        // The host link: already open, so sends go straight through.
        let link = Arc::new(PeerLink::attached(
            channel,
            manager.inner.clock.clone(),
            manager.inner.app_tx.clone(),
        ));
        link.send(&WireMessage::PlayerJoin { profile });
        manager.inner.links.write().await.insert(Uuid::nil(), link);

        manager.spawn_dispatch(signal_rx);

        match timeout(manager.inner.config.join_timeout, snap_rx).await {
            Ok(Ok(())) => {}
            _ => {
                manager.teardown(None).await;
                return Err(SyncError::JoinTimeout);
            }
        }

        manager.spawn_player_update_loop();
        manager.spawn_probe_loop();

        info!("joined room {room}");
        Ok(manager)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        room: RoomCode,
        profile: PlayerProfile,
        is_host: bool,
        signaling: Signaling,
        config: SyncConfig,
        state_provider: Option<Arc<dyn StateProvider>>,
        intent_handler: Option<Arc<dyn IntentHandler>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (app_tx, app_rx) = mpsc::channel(APP_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                clock: SessionClock::new(),
                state: SessionState::shared(room, profile, is_host),
                links: RwLock::new(HashMap::new()),
                pending_links: RwLock::new(HashMap::new()),
                signaling: Mutex::new(Some(signaling)),
                tasks: Mutex::new(Vec::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                app_tx,
                app_rx: Mutex::new(Some(app_rx)),
                state_provider,
                intent_handler,
                pending_intents: Mutex::new(HashMap::new()),
                snapshot_waiter: Mutex::new(None),
                host_peer: Mutex::new(None),
                sequence: AtomicU64::new(0),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Public session API
    // ───────────────────────────────────────────────────────────────

    /// Shared session store handle for reactive reads (UI, rendering).
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.inner.state)
    }

    pub fn clock(&self) -> SessionClock {
        self.inner.clock.clone()
    }

    /// Session event stream. Can only be taken once.
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.inner.event_rx.lock().unwrap().take()
    }

    /// Feed from the input collaborator, read by the 50 ms tick.
    pub async fn update_local_player(
        &self,
        position: [f32; 3],
        yaw: f32,
        velocity: [f32; 3],
        selected_machine: Option<String>,
    ) {
        let mut state = self.inner.state.write().await;
        state.local_player = PlayerState {
            position,
            yaw,
            velocity,
            selected_machine,
            timestamp_ms: self.inner.clock.now_ms(),
        };
    }

    /// Submit a world mutation. The host validates and applies locally;
    /// a guest forwards to the host and awaits the routed result. On a
    /// torn-down session the returned future never resolves — callers
    /// race their own timeout.
    pub async fn submit_intent(
        &self,
        kind: IntentKind,
        machine_id: &str,
        params: AdjustParams,
    ) -> IntentResult {
        let local_id = self.inner.state.read().await.local.id;
        let intent = Intent {
            id: Uuid::new_v4(),
            kind,
            machine_id: machine_id.to_string(),
            requester: local_id,
            timestamp_ms: self.inner.clock.now_ms(),
            params,
        };

        if self.inner.state.read().await.is_host {
            return self.process_intent(intent).await;
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_intents
            .lock()
            .unwrap()
            .insert(intent.id, tx);
        self.send_to_host(&WireMessage::Intent { intent }).await;
        match rx.await {
            Ok(result) => result,
            // Session torn down mid-flight: by contract this intent
            // never resolves.
            Err(_) => std::future::pending().await,
        }
    }

    /// Claim exclusive control of a machine. First come, first served;
    /// a rejected requester must retry.
    pub async fn request_machine_lock(&self, machine_id: &str) -> IntentResult {
        self.submit_intent(
            IntentKind::Adjust,
            machine_id,
            AdjustParams {
                rate: None,
                lock: Some(LockAction::Acquire),
            },
        )
        .await
    }

    /// Release a held machine lock.
    pub async fn release_machine_lock(&self, machine_id: &str) -> IntentResult {
        self.submit_intent(
            IntentKind::Adjust,
            machine_id,
            AdjustParams {
                rate: None,
                lock: Some(LockAction::Release),
            },
        )
        .await
    }

    /// Append a chat line locally and fan it out.
    pub async fn send_chat(&self, text: &str) {
        let message = {
            let state = self.inner.state.read().await;
            ChatMessage::new(
                state.local.id,
                state.local.name.clone(),
                text,
                self.inner.clock.now_ms(),
            )
        };
        self.inner
            .state
            .write()
            .await
            .record_chat(message.clone());
        self.emit(SessionEvent::Chat(message.clone()));
        self.broadcast(&WireMessage::Chat { message }, None).await;
    }

    /// Cast a ballot on an AI advisor proposal and fan it out.
    pub async fn send_vote(&self, proposal_id: &str, approve: bool) {
        let vote = {
            let state = self.inner.state.read().await;
            VoteBallot {
                proposal_id: proposal_id.to_string(),
                voter: state.local.id,
                approve,
                timestamp_ms: self.inner.clock.now_ms(),
            }
        };
        self.inner
            .state
            .write()
            .await
            .record_vote(&vote.proposal_id, vote.voter, vote.approve);
        self.emit(SessionEvent::VoteCast(vote.clone()));
        self.broadcast(&WireMessage::AiVote { vote }, None).await;
    }

    /// Send one message to every joined link, optionally excluding the
    /// peer it came from (relay fan-out).
    pub async fn broadcast(&self, msg: &WireMessage, exclude: Option<ParticipantId>) {
        let links = self.inner.links.read().await;
        for (peer, link) in links.iter() {
            if Some(*peer) == exclude {
                continue;
            }
            link.send(msg);
        }
    }

    /// Leave the session: announce, stop loops, close links, reset
    /// state. Idempotent.
    pub async fn leave(&self) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let local_id = self.inner.state.read().await.local.id;
        self.broadcast(&WireMessage::PlayerLeave { id: local_id }, None)
            .await;
        self.teardown(None).await;
    }

    /// Leave and drop the session's callbacks. Idempotent.
    pub async fn destroy(&self) {
        self.leave().await;
        self.inner.event_rx.lock().unwrap().take();
        self.inner.pending_intents.lock().unwrap().clear();
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.read().await.connection
    }

    // ───────────────────────────────────────────────────────────────
    // Dispatch: the single mutation thread
    // ───────────────────────────────────────────────────────────────

    fn spawn_dispatch(&self, mut signal_rx: mpsc::Receiver<SignalEvent>) {
        let manager = self.clone();
        let mut app_rx = self
            .inner
            .app_rx
            .lock()
            .unwrap()
            .take()
            .expect("dispatch spawned once per session");
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signal_rx.recv() => match signal {
                        Some(ev) => manager.on_signal(ev).await,
                        None => break,
                    },
                    inbound = app_rx.recv() => match inbound {
                        Some((peer, msg)) => manager.on_message(peer, msg).await,
                        None => break,
                    },
                }
            }
            debug!("dispatch ended");
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    async fn on_signal(&self, event: SignalEvent) {
        match event {
            SignalEvent::Open { endpoint } => {
                debug!("endpoint registered: {endpoint}");
            }
            SignalEvent::PeerConnected(channel) => self.on_channel_open(channel).await,
            SignalEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer).await,
            SignalEvent::Error(e) => {
                warn!("signaling error: {e}");
                self.emit(SessionEvent::Error(e));
            }
        }
    }

    /// Host side: an inbound channel opened. The link idles in the
    /// pending set until the joiner's PLAYER_JOIN starts the handshake.
    async fn on_channel_open(&self, channel: PeerChannel) {
        let peer = channel.peer_id;
        let link = Arc::new(PeerLink::attached(
            channel,
            self.inner.clock.clone(),
            self.inner.app_tx.clone(),
        ));
        self.inner.pending_links.write().await.insert(peer, link);
        debug!("channel open from {peer}, awaiting join");
    }

    async fn on_message(&self, from: ParticipantId, msg: WireMessage) {
        let is_host = self.inner.state.read().await.is_host;
        match msg {
            WireMessage::PlayerJoin { profile } => {
                if is_host {
                    self.host_admit(from, profile).await;
                } else {
                    self.guest_track_join(profile).await;
                }
            }
            WireMessage::PlayerUpdate { id, state } => {
                let now = self.inner.clock.now_ms();
                self.inner
                    .state
                    .write()
                    .await
                    .record_player_update(&id, state.clone(), now);
                if is_host {
                    self.broadcast(&WireMessage::PlayerUpdate { id, state }, Some(from))
                        .await;
                }
            }
            WireMessage::PlayerLeave { id } => {
                if is_host {
                    self.host_drop_peer(id, true).await;
                } else {
                    self.guest_track_leave(id).await;
                }
            }
            WireMessage::StateSync { diff } => {
                if !is_host {
                    self.guest_apply_diff(diff).await;
                }
            }
            WireMessage::FullStateSync { snapshot } => {
                if !is_host {
                    self.guest_apply_snapshot(snapshot).await;
                }
            }
            WireMessage::Intent { intent } => {
                if is_host {
                    let result = self.process_intent(intent).await;
                    let links = self.inner.links.read().await;
                    if let Some(link) = links.get(&from) {
                        link.send(&WireMessage::IntentResult { result });
                    }
                }
            }
            WireMessage::IntentResult { result } => {
                let waiter = self
                    .inner
                    .pending_intents
                    .lock()
                    .unwrap()
                    .remove(&result.intent_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                }
            }
            WireMessage::Chat { mut message } => {
                message.text = truncate_chat(&message.text);
                let fresh = self
                    .inner
                    .state
                    .write()
                    .await
                    .record_chat(message.clone());
                if fresh {
                    self.emit(SessionEvent::Chat(message.clone()));
                    if is_host {
                        self.broadcast(&WireMessage::Chat { message }, Some(from))
                            .await;
                    }
                }
            }
            WireMessage::AiVote { vote } => {
                self.inner.state.write().await.record_vote(
                    &vote.proposal_id,
                    vote.voter,
                    vote.approve,
                );
                self.emit(SessionEvent::VoteCast(vote.clone()));
                if is_host {
                    self.broadcast(&WireMessage::AiVote { vote }, Some(from)).await;
                }
            }
            WireMessage::MachineLock { machine_id, holder } => {
                if !is_host {
                    self.inner
                        .state
                        .write()
                        .await
                        .set_lock(machine_id.clone(), holder);
                    self.emit(SessionEvent::LockChanged { machine_id, holder });
                }
            }
            // The peer link consumes these before dispatch.
            WireMessage::Ping { .. } | WireMessage::Pong { .. } => {}
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Host: admission, authority, disconnects
    // ───────────────────────────────────────────────────────────────

    /// Serialized join handshake. Holding the link-registry write lock
    /// for the whole sequence keeps every broadcast tick from observing
    /// the joiner until its snapshot and announcements are queued, and
    /// the channel's FIFO ordering does the rest.
    async fn host_admit(&self, peer: ParticipantId, profile: PlayerProfile) {
        let link = match self.inner.pending_links.write().await.remove(&peer) {
            Some(link) => link,
            None => {
                debug!("duplicate join from {peer}, ignoring");
                return;
            }
        };

        let mut links = self.inner.links.write().await;
        let admitted = {
            let mut state = self.inner.state.write().await;

            let color = assign_color(&state.colors_in_use(), peer);
            let admitted = PlayerProfile {
                id: peer,
                name: profile.name,
                color,
            };
            state.add_participant(admitted.clone(), self.inner.clock.now_ms());

            // Bootstrap, in contract order: snapshot, host's own join
            // announcement, then one per existing guest.
            let mut snapshot = self
                .inner
                .state_provider
                .as_ref()
                .map(|p| p.full_snapshot())
                .unwrap_or_else(|| FullSnapshot {
                    sequence: 0,
                    machines: Vec::new(),
                    locks: HashMap::new(),
                    world_clock_min: 0.0,
                    weather: Default::default(),
                    emergency: false,
                });
            snapshot.locks = state.locks().clone();
            snapshot.sequence = self.inner.sequence.load(Ordering::SeqCst);
            link.send(&WireMessage::FullStateSync { snapshot });
            link.send(&WireMessage::PlayerJoin {
                profile: state.local.clone(),
            });
            for existing in state.profiles() {
                if existing.id != peer {
                    link.send(&WireMessage::PlayerJoin { profile: existing });
                }
            }
            admitted
        };

        for other in links.values() {
            other.send(&WireMessage::PlayerJoin {
                profile: admitted.clone(),
            });
        }
        links.insert(peer, link);
        drop(links);

        info!("{} joined as {}", admitted.name, peer);
        self.emit(SessionEvent::PeerJoined(admitted));
    }

    /// Host-local intent validation and application, in dispatch order.
    async fn process_intent(&self, intent: Intent) -> IntentResult {
        let mut state = self.inner.state.write().await;

        if let Some(holder) = state.lock_holder(&intent.machine_id) {
            if holder != intent.requester {
                return IntentResult::rejected(
                    intent.id,
                    format!("{} is already controlled by another operator", intent.machine_id),
                );
            }
        }
        if state.machine(&intent.machine_id).is_none() {
            return IntentResult::rejected(
                intent.id,
                format!("unknown machine {}", intent.machine_id),
            );
        }

        if let Some(action) = intent.params.lock {
            let holder = match action {
                LockAction::Acquire => Some(intent.requester),
                LockAction::Release => None,
            };
            state.set_lock(intent.machine_id.clone(), holder);
            drop(state);
            self.broadcast(
                &WireMessage::MachineLock {
                    machine_id: intent.machine_id.clone(),
                    holder,
                },
                None,
            )
            .await;
            self.emit(SessionEvent::LockChanged {
                machine_id: intent.machine_id.clone(),
                holder,
            });
            return IntentResult::ok(intent.id);
        }
        drop(state);

        match self.inner.intent_handler.as_ref() {
            Some(handler) => {
                let outcome = handler.apply(&intent);
                if outcome.success {
                    IntentResult::ok(intent.id)
                } else {
                    IntentResult::rejected(
                        intent.id,
                        outcome.error.unwrap_or_else(|| "rejected".into()),
                    )
                }
            }
            None => IntentResult::rejected(intent.id, "no intent handler installed"),
        }
    }

    /// Remove a guest: roster, its locks (released and broadcast within
    /// this cycle), then tell everyone else.
    async fn host_drop_peer(&self, peer: ParticipantId, announced: bool) {
        let link = {
            let mut links = self.inner.links.write().await;
            links.remove(&peer)
        };
        self.inner.pending_links.write().await.remove(&peer);
        let Some(link) = link else {
            return; // already handled
        };
        link.close();

        let (profile, cleared) = {
            let mut state = self.inner.state.write().await;
            let profile = state.remove_participant(&peer);
            let cleared = state.clear_locks_held_by(&peer);
            (profile, cleared)
        };

        for machine_id in cleared {
            self.broadcast(
                &WireMessage::MachineLock {
                    machine_id: machine_id.clone(),
                    holder: None,
                },
                None,
            )
            .await;
            self.emit(SessionEvent::LockChanged {
                machine_id,
                holder: None,
            });
        }
        self.broadcast(&WireMessage::PlayerLeave { id: peer }, None).await;

        if profile.is_some() {
            info!(
                "peer {peer} {}",
                if announced { "left" } else { "disconnected" }
            );
            self.emit(SessionEvent::PeerLeft(peer));
        }
    }

    async fn on_peer_disconnected(&self, peer: ParticipantId) {
        let is_host = self.inner.state.read().await.is_host;
        if is_host {
            self.host_drop_peer(peer, false).await;
        } else {
            // The only link a guest has is the host. Session over.
            self.host_lost().await;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Guest: mirroring
    // ───────────────────────────────────────────────────────────────

    async fn guest_track_join(&self, profile: PlayerProfile) {
        {
            let mut state = self.inner.state.write().await;
            if profile.id == state.local.id {
                // Host echoed our own announcement with the assigned
                // color; adopt it.
                state.local.color = profile.color;
                return;
            }
            state.add_participant(profile.clone(), self.inner.clock.now_ms());
        }
        // The first announcement after the snapshot is the host itself.
        let mut host_peer = self.inner.host_peer.lock().unwrap();
        if host_peer.is_none() {
            *host_peer = Some(profile.id);
        }
        drop(host_peer);
        self.emit(SessionEvent::PeerJoined(profile));
    }

    async fn guest_track_leave(&self, id: ParticipantId) {
        let host_left = *self.inner.host_peer.lock().unwrap() == Some(id);
        if host_left {
            self.host_lost().await;
            return;
        }
        let removed = self.inner.state.write().await.remove_participant(&id);
        if removed.is_some() {
            self.emit(SessionEvent::PeerLeft(id));
        }
    }

    async fn guest_apply_diff(&self, diff: StateDiff) {
        let mut state = self.inner.state.write().await;
        if diff.sequence <= state.last_applied_sequence {
            debug!(
                "dropping stale diff {} (applied {})",
                diff.sequence, state.last_applied_sequence
            );
            return;
        }
        state.apply_diff(&diff);
        drop(state);
        self.emit(SessionEvent::StateApplied {
            sequence: diff.sequence,
        });
    }

    async fn guest_apply_snapshot(&self, snapshot: FullSnapshot) {
        {
            let mut state = self.inner.state.write().await;
            state.apply_snapshot(&snapshot);
            state.connection = ConnectionState::Connected;
        }
        if let Some(tx) = self.inner.snapshot_waiter.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.emit(SessionEvent::Connected);
        self.emit(SessionEvent::StateApplied {
            sequence: snapshot.sequence,
        });
    }

    /// Host vanished: stop loops and end the session. Deliberately no
    /// migration attempt.
    async fn host_lost(&self) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        warn!("host lost, ending session");
        self.emit(SessionEvent::HostLost);
        self.teardown(Some(SessionEvent::Disconnected)).await;
    }

    // ───────────────────────────────────────────────────────────────
    // Loops
    // ───────────────────────────────────────────────────────────────

    fn spawn_player_update_loop(&self) {
        let manager = self.clone();
        let period = self.inner.config.player_update_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let (id, mut player) = {
                    let state = manager.inner.state.read().await;
                    if state.connection != ConnectionState::Connected {
                        continue;
                    }
                    (state.local.id, state.local_player.clone())
                };
                player.timestamp_ms = manager.inner.clock.now_ms();
                manager
                    .broadcast(&WireMessage::PlayerUpdate { id, state: player }, None)
                    .await;
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    /// Host only: assemble and fan out the periodic world diff.
    fn spawn_diff_loop(&self) {
        let manager = self.clone();
        let period = self.inner.config.state_diff_interval;
        let Some(provider) = self.inner.state_provider.clone() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let snapshot = provider.full_snapshot();
                let diff = {
                    let mut state = manager.inner.state.write().await;
                    let changed: Vec<_> = snapshot
                        .machines
                        .iter()
                        .filter(|m| state.machine(&m.id) != Some(*m))
                        .cloned()
                        .collect();
                    for machine in &changed {
                        state.machines.insert(machine.id.clone(), machine.clone());
                    }
                    state.world_clock_min = snapshot.world_clock_min;
                    state.weather = snapshot.weather;
                    state.emergency = snapshot.emergency;

                    let sequence = manager.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    state.last_applied_sequence = sequence;
                    StateDiff {
                        sequence,
                        machines: changed,
                        world_clock_min: snapshot.world_clock_min,
                        weather: snapshot.weather,
                        emergency: snapshot.emergency,
                        timestamp_ms: manager.inner.clock.now_ms(),
                    }
                };
                manager
                    .broadcast(&WireMessage::StateSync { diff }, None)
                    .await;
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    /// Ping every link; collect latencies; disconnect links found stale
    /// at probe time — staleness is never acted on eagerly.
    fn spawn_probe_loop(&self) {
        let manager = self.clone();
        let period = self.inner.config.probe_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let mut stale = Vec::new();
                let mut latencies = Vec::new();
                {
                    let links = manager.inner.links.read().await;
                    for (peer, link) in links.iter() {
                        if link.is_stale() {
                            stale.push(*peer);
                        } else {
                            link.ping();
                            latencies.push((*peer, link.latency_ms()));
                        }
                    }
                }
                if !latencies.is_empty() {
                    let host_peer = *manager.inner.host_peer.lock().unwrap();
                    let mut state = manager.inner.state.write().await;
                    for (peer, latency) in latencies {
                        // A guest's single link is keyed nil until the
                        // host announces itself.
                        let id = if peer == Uuid::nil() {
                            match host_peer {
                                Some(h) => h,
                                None => continue,
                            }
                        } else {
                            peer
                        };
                        state.record_latency(id, latency);
                    }
                }
                for peer in stale {
                    warn!("link {peer} stale at probe, closing");
                    manager.on_peer_disconnected(peer).await;
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    // ───────────────────────────────────────────────────────────────
    // Teardown
    // ───────────────────────────────────────────────────────────────

    async fn send_to_host(&self, msg: &WireMessage) {
        let links = self.inner.links.read().await;
        // Guests key their single link by nil until the host's profile
        // arrives; fall back to any link.
        if let Some(link) = links.get(&Uuid::nil()).or_else(|| links.values().next()) {
            link.send(msg);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.inner.event_tx.try_send(event) {
            debug!("session event dropped: {e}");
        }
    }

    /// Stop timers, close links, clear state. Idempotent; safe to call
    /// from inside the dispatch task (self-abort happens last).
    async fn teardown(&self, final_event: Option<SessionEvent>) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut signaling) = self.inner.signaling.lock().unwrap().take() {
            signaling.shutdown();
        }
        {
            let mut links = self.inner.links.write().await;
            for link in links.values() {
                link.close();
            }
            links.clear();
        }
        self.inner.pending_links.write().await.clear();
        self.inner.pending_intents.lock().unwrap().clear();
        self.inner.state.write().await.reset();
        self.emit(final_event.unwrap_or(SessionEvent::Disconnected));

        // Own task may be in this list; abort it last.
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MachineStatus, Weather};
    use std::sync::Mutex as StdMutex;

    /// Minimal domain store standing in for the production floor.
    struct TestFloor {
        machines: StdMutex<HashMap<String, MachineStatus>>,
    }

    impl TestFloor {
        fn with_machines(ids: &[&str]) -> Arc<Self> {
            let machines = ids
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        MachineStatus {
                            id: id.to_string(),
                            running: false,
                            rate: 10.0,
                            fault: false,
                        },
                    )
                })
                .collect();
            Arc::new(Self {
                machines: StdMutex::new(machines),
            })
        }
    }

    impl StateProvider for TestFloor {
        fn full_snapshot(&self) -> FullSnapshot {
            FullSnapshot {
                sequence: 0,
                machines: self.machines.lock().unwrap().values().cloned().collect(),
                locks: HashMap::new(),
                world_clock_min: 60.0,
                weather: Weather::Clear,
                emergency: false,
            }
        }
    }

    impl IntentHandler for TestFloor {
        fn apply(&self, intent: &Intent) -> IntentOutcome {
            let mut machines = self.machines.lock().unwrap();
            let Some(machine) = machines.get_mut(&intent.machine_id) else {
                return IntentOutcome::rejected("unknown machine");
            };
            match intent.kind {
                // No-op safe: starting a running machine succeeds.
                IntentKind::Start => machine.running = true,
                IntentKind::Stop => machine.running = false,
                IntentKind::Adjust => {
                    if let Some(rate) = intent.params.rate {
                        machine.rate = rate;
                    }
                }
            }
            IntentOutcome::ok()
        }
    }

    async fn test_host() -> (SyncManager, RoomCode, Arc<TestFloor>) {
        let floor = TestFloor::with_machines(&["press-1", "kiln-1"]);
        let (manager, room) = SyncManager::host_room(
            "Mara",
            floor.clone(),
            floor.clone(),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        (manager, room, floor)
    }

    fn intent_from(requester: ParticipantId, machine: &str, lock: Option<LockAction>) -> Intent {
        Intent {
            id: Uuid::new_v4(),
            kind: IntentKind::Adjust,
            machine_id: machine.to_string(),
            requester,
            timestamp_ms: 0,
            params: AdjustParams { rate: None, lock },
        }
    }

    #[test]
    fn test_config_defaults_match_cadence() {
        let config = SyncConfig::default();
        assert_eq!(config.player_update_interval.as_millis(), 50);
        assert_eq!(config.state_diff_interval.as_millis(), 100);
        assert_eq!(config.probe_interval.as_millis(), 1000);
        assert_eq!(config.join_timeout.as_secs(), 15);
    }

    #[tokio::test]
    async fn test_host_is_connected_immediately() {
        let (manager, room, _) = test_host().await;
        assert_eq!(room.as_str().len(), 6);
        assert_eq!(manager.connection_state().await, ConnectionState::Connected);
        assert_eq!(manager.state().read().await.local.color, PALETTE[0]);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_intent_on_unknown_machine_is_rejected() {
        let (manager, _, _) = test_host().await;
        let result = manager
            .submit_intent(IntentKind::Start, "no-such-machine", AdjustParams::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown machine"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_start_is_noop_tolerant() {
        let (manager, _, floor) = test_host().await;
        let first = manager
            .submit_intent(IntentKind::Start, "press-1", AdjustParams::default())
            .await;
        let second = manager
            .submit_intent(IntentKind::Start, "press-1", AdjustParams::default())
            .await;
        assert!(first.success);
        assert!(second.success, "re-issued START must succeed trivially");
        assert!(floor.machines.lock().unwrap()["press-1"].running);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_lock_is_first_come_first_served() {
        let (manager, _, _) = test_host().await;
        let first_holder = ParticipantId::new_v4();

        let a = manager
            .process_intent(intent_from(first_holder, "press-1", Some(LockAction::Acquire)))
            .await;
        assert!(a.success);

        let b = manager
            .process_intent(intent_from(
                ParticipantId::new_v4(),
                "press-1",
                Some(LockAction::Acquire),
            ))
            .await;
        assert!(!b.success);
        assert!(b.error.unwrap().contains("already controlled"));
        assert_eq!(
            manager.state().read().await.lock_holder("press-1"),
            Some(first_holder)
        );
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_lock_release_by_other_is_rejected() {
        let (manager, _, _) = test_host().await;
        let holder = ParticipantId::new_v4();
        manager
            .process_intent(intent_from(holder, "press-1", Some(LockAction::Acquire)))
            .await;

        let release = manager
            .process_intent(intent_from(
                ParticipantId::new_v4(),
                "press-1",
                Some(LockAction::Release),
            ))
            .await;
        assert!(!release.success);

        let release = manager
            .process_intent(intent_from(holder, "press-1", Some(LockAction::Release)))
            .await;
        assert!(release.success);
        assert_eq!(manager.state().read().await.lock_holder("press-1"), None);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_command_on_machine_locked_by_other_is_rejected() {
        let (manager, _, _) = test_host().await;
        let holder = ParticipantId::new_v4();
        manager
            .process_intent(intent_from(holder, "kiln-1", Some(LockAction::Acquire)))
            .await;

        let result = manager
            .submit_intent(IntentKind::Start, "kiln-1", AdjustParams::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("already controlled"));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (manager, _, _) = test_host().await;
        manager.leave().await;
        manager.leave().await;
        assert_eq!(
            manager.connection_state().await,
            ConnectionState::Disconnected
        );
        manager.destroy().await;
    }
}
