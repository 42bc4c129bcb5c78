//! Per-peer link: queued sends, latency probing, stale detection.
//!
//! A [`PeerLink`] wraps one established (or still-opening) data channel.
//! Sends before the channel opens queue FIFO and flush in order on
//! attach. The link's inbound pump answers `PING` immediately with a
//! `PONG` carrying the original timestamp — latency measurement is never
//! blocked by application backlog — and consumes `PONG`s to maintain the
//! latency estimate. Everything else is forwarded to the manager.
//!
//! Staleness (no traffic of any kind for [`STALE_AFTER_MS`]) is advisory:
//! the synchronization manager's probe loop decides when to act on it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ParticipantId, WireMessage};
use crate::session::SessionClock;

/// A link with no inbound traffic for this long is stale.
pub const STALE_AFTER_MS: u64 = 5_000;

/// Pre-open queue bound; matches the outbound channel capacity.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// The two halves of an established data channel, as produced by the
/// signaling layer: encoded frames go out through `outbound`, decoded
/// messages arrive on `inbound`.
pub struct PeerChannel {
    pub peer_id: ParticipantId,
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<WireMessage>,
}

/// One peer connection owned by the synchronization manager.
pub struct PeerLink {
    peer_id: ParticipantId,
    /// `None` until the channel opens or after close.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// FIFO of frames accepted before the channel opened.
    pending: Mutex<VecDeque<String>>,
    closed: Mutex<bool>,
    /// Round trip / 2, milliseconds. Zero until the first pong.
    latency_ms: Arc<AtomicU32>,
    /// Session-clock stamp of the last inbound frame of any kind.
    last_received_ms: Arc<AtomicU64>,
    /// Outstanding ping nonces → send stamp.
    pings_in_flight: Arc<Mutex<HashMap<u64, u64>>>,
    ping_nonce: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    clock: SessionClock,
}

impl PeerLink {
    /// A link whose channel is still opening; sends queue until
    /// [`PeerLink::attach`].
    pub fn opening(peer_id: ParticipantId, clock: SessionClock) -> Self {
        let now = clock.now_ms();
        Self {
            peer_id,
            outbound: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
            latency_ms: Arc::new(AtomicU32::new(0)),
            last_received_ms: Arc::new(AtomicU64::new(now)),
            pings_in_flight: Arc::new(Mutex::new(HashMap::new())),
            ping_nonce: AtomicU64::new(0),
            pump: Mutex::new(None),
            clock,
        }
    }

    /// A link over an already-open channel. The queued-send path is
    /// skipped entirely; the inbound pump starts immediately.
    pub fn attached(
        channel: PeerChannel,
        clock: SessionClock,
        app_tx: mpsc::Sender<(ParticipantId, WireMessage)>,
    ) -> Self {
        let link = Self::opening(channel.peer_id, clock);
        link.attach(channel, app_tx);
        link
    }

    pub fn peer_id(&self) -> ParticipantId {
        self.peer_id
    }

    /// Bind an opened channel: flush the pre-open queue in FIFO order and
    /// start the inbound pump.
    pub fn attach(
        &self,
        channel: PeerChannel,
        app_tx: mpsc::Sender<(ParticipantId, WireMessage)>,
    ) {
        let tx = channel.outbound;
        {
            let mut pending = self.pending.lock().unwrap();
            while let Some(frame) = pending.pop_front() {
                if tx.try_send(frame).is_err() {
                    warn!("peer {}: channel closed while flushing queue", self.peer_id);
                    break;
                }
            }
        }
        *self.outbound.lock().unwrap() = Some(tx.clone());

        let handle = tokio::spawn(pump(
            self.peer_id,
            channel.inbound,
            tx,
            app_tx,
            self.clock.clone(),
            Arc::clone(&self.pings_in_flight),
            Arc::clone(&self.latency_ms),
            Arc::clone(&self.last_received_ms),
        ));
        *self.pump.lock().unwrap() = Some(handle);
    }

    /// Queue or transmit one message.
    ///
    /// Returns `true` once the frame is handed to the open channel,
    /// `false` if it was queued (channel still opening) or dropped
    /// (link closed / channel full).
    pub fn send(&self, msg: &WireMessage) -> bool {
        if *self.closed.lock().unwrap() {
            return false;
        }
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!("peer {}: encode failed: {e}", self.peer_id);
                return false;
            }
        };
        let outbound = self.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!("peer {}: send failed: {e}", self.peer_id);
                    false
                }
            },
            None => {
                let mut pending = self.pending.lock().unwrap();
                if pending.len() >= SEND_QUEUE_CAPACITY {
                    warn!("peer {}: pre-open queue full, dropping frame", self.peer_id);
                    return false;
                }
                pending.push_back(frame);
                false
            }
        }
    }

    /// Fire one latency probe. The answer is consumed by the inbound pump.
    pub fn ping(&self) {
        let nonce = self.ping_nonce.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        self.pings_in_flight.lock().unwrap().insert(nonce, now);
        self.send(&WireMessage::Ping {
            nonce,
            timestamp_ms: now,
        });
    }

    /// One-way latency estimate (round trip / 2), milliseconds.
    pub fn latency_ms(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// True when nothing — pings included — has arrived within
    /// [`STALE_AFTER_MS`].
    pub fn is_stale(&self) -> bool {
        let last = self.last_received_ms.load(Ordering::Relaxed);
        self.clock.now_ms().saturating_sub(last) > STALE_AFTER_MS
    }

    /// Stamp of the last inbound frame, session-clock milliseconds.
    pub fn last_received_ms(&self) -> u64 {
        self.last_received_ms.load(Ordering::Relaxed)
    }

    /// Close the link: stop the pump, drop the channel, clear the queue.
    /// Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.outbound.lock().unwrap().take();
        self.pending.lock().unwrap().clear();
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
        debug!("peer {}: link closed", self.peer_id);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    /// Number of frames waiting for the channel to open. Test hook.
    pub fn queued_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Inbound pump: stamps liveness, answers pings, resolves pongs, forwards
/// application messages to the manager.
#[allow(clippy::too_many_arguments)]
async fn pump(
    peer_id: ParticipantId,
    mut inbound: mpsc::Receiver<WireMessage>,
    outbound: mpsc::Sender<String>,
    app_tx: mpsc::Sender<(ParticipantId, WireMessage)>,
    clock: SessionClock,
    pings_in_flight: Arc<Mutex<HashMap<u64, u64>>>,
    latency_ms: Arc<AtomicU32>,
    last_received_ms: Arc<AtomicU64>,
) {
    while let Some(msg) = inbound.recv().await {
        last_received_ms.store(clock.now_ms(), Ordering::Relaxed);
        match msg {
            WireMessage::Ping { nonce, timestamp_ms } => {
                // Answer straight on the channel, ahead of any backlog.
                let pong = WireMessage::Pong { nonce, timestamp_ms };
                if let Ok(frame) = pong.encode() {
                    let _ = outbound.try_send(frame);
                }
            }
            WireMessage::Pong { nonce, .. } => {
                let sent_at = pings_in_flight.lock().unwrap().remove(&nonce);
                if let Some(sent_at) = sent_at {
                    let rtt = clock.now_ms().saturating_sub(sent_at);
                    latency_ms.store((rtt / 2) as u32, Ordering::Relaxed);
                    trace!("peer {peer_id}: rtt {rtt}ms");
                }
            }
            other => {
                if app_tx.send((peer_id, other)).await.is_err() {
                    break; // manager gone, stop pumping
                }
            }
        }
    }
    debug!("peer {peer_id}: inbound pump ended");
}
