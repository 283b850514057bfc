//! Network activity events for progress indicators.
//!
//! Emission never blocks and never fails; with no subscribers the events
//! are simply dropped.

use tokio::sync::broadcast;

const ACTIVITY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Progress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub direction: Direction,
    pub phase: Phase,
    pub total_bytes: u64,
    pub current_bytes: u64,
}

impl ActivityEvent {
    /// Event for `current` of `total` bytes of one payload moved so far.
    /// `step` is how much of that moved in this frame.
    pub fn for_progress(direction: Direction, step: u64, current: u64, total: u64) -> Self {
        let phase = if current >= total {
            Phase::Completed
        } else if current <= step {
            Phase::Started
        } else {
            Phase::Progress
        };
        Self {
            direction,
            phase,
            total_bytes: total,
            current_bytes: current,
        }
    }
}

#[derive(Clone)]
pub struct ActivityMonitor {
    tx: broadcast::Sender<ActivityEvent>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ACTIVITY_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: ActivityEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
