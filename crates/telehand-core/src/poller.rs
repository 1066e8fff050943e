//! Fixed-interval overlay state poller.
//!
//! Each tick pulls one snapshot, publishes it on a drop-oldest channel
//! (consumers always want the latest), and diffs it against the previous
//! tick into discrete events on a drop-new channel. `process_exit` is
//! terminal: it is emitted once and the poller stops; it is never
//! resurrected against a dead process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::overlay::EasyTier;
use crate::readiness::{PeerClass, Snapshot};
use crate::timing::STATE_POLL_INTERVAL;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 4;
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Discrete overlay state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Node virtual IP transitioned from empty/0.0.0.0 to valid.
    TunReady,
    PeerAdded,
    PeerRemoved,
    /// Readiness class transitioned into endpoint_ready.
    EndpointReady,
    /// The overlay process terminated. Terminal for this poller.
    ProcessExit,
    /// One snapshot pull failed.
    SnapshotError,
}

/// Event plus the context a consumer needs without re-reading state.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub peer_id: String,
    pub peer_class: PeerClass,
    pub error: Option<String>,
}

impl Event {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
            peer_id: String::new(),
            peer_class: PeerClass::None,
            error: None,
        }
    }
}

/// Polls one supervisor until cancelled or the process exits.
pub struct StatePoller {
    et: Arc<EasyTier>,
    interval: Duration,
    /// snapshot_error events dropped because the event channel was full.
    dropped_errors: Arc<AtomicUsize>,
}

impl StatePoller {
    pub fn new(et: Arc<EasyTier>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            STATE_POLL_INTERVAL
        } else {
            interval
        };
        Self {
            et,
            interval,
            dropped_errors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// snapshot_error events that could not be delivered.
    pub fn dropped_error_count(&self) -> usize {
        self.dropped_errors.load(Ordering::Relaxed)
    }

    /// Start polling. Both channels close when the token is cancelled or
    /// the overlay process exits.
    pub fn start(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<Snapshot>, mpsc::Receiver<Event>) {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let et = Arc::clone(&self.et);
        let interval = self.interval;
        let dropped_errors = Arc::clone(&self.dropped_errors);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut prev: Option<Snapshot> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match et.query_snapshot().await {
                    Ok(snapshot) => {
                        // Snapshot before derived events, drop-oldest.
                        if snapshot_tx.try_send(snapshot.clone()).is_err() {
                            debug!("snapshot channel full, dropping stale snapshot");
                        }
                        for event in diff_snapshots(prev.as_ref(), &snapshot) {
                            if event_tx.try_send(event).is_err() {
                                debug!("event channel full, dropping event");
                            }
                        }
                        prev = Some(snapshot);
                    }
                    Err(err) => {
                        if et.has_exited().await {
                            let _ = event_tx.try_send(Event::new(EventKind::ProcessExit));
                            return;
                        }
                        let mut event = Event::new(EventKind::SnapshotError);
                        event.error = Some(err.to_string());
                        if event_tx.try_send(event).is_err() {
                            dropped_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        (snapshot_rx, event_rx)
    }
}

/// Events implied by the transition `prev -> curr`.
///
/// Within one tick `tun_ready` precedes `endpoint_ready`; peer add/remove
/// ordering inside a tick is unspecified (ids are compared as sorted sets).
pub fn diff_snapshots(prev: Option<&Snapshot>, curr: &Snapshot) -> Vec<Event> {
    let mut events = Vec::new();
    let now = curr.at;

    let endpoint_event = |events: &mut Vec<Event>| {
        let mut event = Event::new(EventKind::EndpointReady);
        event.at = now;
        event.peer_id = curr.readiness.peer_id.clone();
        event.peer_class = curr.readiness.class;
        events.push(event);
    };

    let Some(prev) = prev else {
        if curr.has_node_ip() {
            let mut event = Event::new(EventKind::TunReady);
            event.at = now;
            events.push(event);
        }
        if curr.readiness.class == PeerClass::EndpointReady {
            endpoint_event(&mut events);
        }
        return events;
    };

    if !prev.has_node_ip() && curr.has_node_ip() {
        let mut event = Event::new(EventKind::TunReady);
        event.at = now;
        events.push(event);
    }

    let prev_ids = sorted_id_set(&prev.readiness.peer_ids);
    let curr_ids = sorted_id_set(&curr.readiness.peer_ids);

    for id in &curr_ids {
        if prev_ids.binary_search(id).is_err() {
            let mut event = Event::new(EventKind::PeerAdded);
            event.at = now;
            event.peer_id = id.clone();
            event.peer_class = curr.readiness.class;
            events.push(event);
        }
    }
    for id in &prev_ids {
        if curr_ids.binary_search(id).is_err() {
            let mut event = Event::new(EventKind::PeerRemoved);
            event.at = now;
            event.peer_id = id.clone();
            events.push(event);
        }
    }

    if prev.readiness.class != PeerClass::EndpointReady
        && curr.readiness.class == PeerClass::EndpointReady
    {
        endpoint_event(&mut events);
    }

    events
}

fn sorted_id_set(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
