//! Worker and fleet counters.

use serde::Serialize;
use sluice_core::WorkerId;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Lifecycle state of a pull worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Receiving from at least one handle
    Running,
    /// Every handle was dropped; idle until shutdown
    Draining,
    /// Shut down
    Stopped,
}

impl WorkerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// Live counters of one worker, updated lock-free from its task.
#[derive(Debug)]
pub struct WorkerStats {
    worker: WorkerId,
    receives: AtomicU64,
    empty_receives: AtomicU64,
    messages: AtomicU64,
    acknowledged: AtomicU64,
    receive_timeouts: AtomicU64,
    receive_errors: AtomicU64,
    action_failures: AtomicU64,
    unacknowledged: AtomicU64,
    ack_failures: AtomicU64,
    dropped_handles: AtomicU64,
    peak_in_flight: AtomicUsize,
    state: AtomicU8,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl WorkerStats {
    /// Fresh counters in the `Running` state.
    #[must_use]
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            receives: AtomicU64::new(0),
            empty_receives: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            receive_timeouts: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            action_failures: AtomicU64::new(0),
            unacknowledged: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            dropped_handles: AtomicU64::new(0),
            peak_in_flight: AtomicUsize::new(0),
            state: AtomicU8::new(WorkerState::Running.as_u8()),
        }
    }

    counter! {
        record_receive => receives,
        record_empty_receive => empty_receives,
        record_acknowledged => acknowledged,
        record_receive_timeout => receive_timeouts,
        record_receive_error => receive_errors,
        record_action_failure => action_failures,
        record_unacknowledged => unacknowledged,
        record_ack_failure => ack_failures,
        record_dropped_handle => dropped_handles,
    }

    pub(crate) fn record_messages(&self, count: usize) {
        self.messages.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_in_flight(&self, in_flight: usize) {
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Messages acknowledged so far.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker: self.worker,
            state: self.state(),
            receives: self.receives.load(Ordering::Relaxed),
            empty_receives: self.empty_receives.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            receive_timeouts: self.receive_timeouts.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            unacknowledged: self.unacknowledged.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            dropped_handles: self.dropped_handles.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Copy of one worker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Worker
    pub worker: WorkerId,
    /// State at snapshot time
    pub state: WorkerState,
    /// Receive attempts that returned normally
    pub receives: u64,
    /// Batch receives that returned no messages
    pub empty_receives: u64,
    /// Messages received
    pub messages: u64,
    /// Messages acknowledged
    pub acknowledged: u64,
    /// Single receives that timed out with nothing to deliver
    pub receive_timeouts: u64,
    /// Failed receive attempts, timeouts excluded
    pub receive_errors: u64,
    /// Failed downstream actions
    pub action_failures: u64,
    /// Messages deliberately left unacknowledged
    pub unacknowledged: u64,
    /// Rejected acknowledgments
    pub ack_failures: u64,
    /// Handles removed from rotation
    pub dropped_handles: u64,
    /// Highest number of concurrent pipelines
    pub peak_in_flight: usize,
}

/// Aggregate view over the whole fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    /// Per-worker counters, in worker order
    pub workers: Vec<WorkerSnapshot>,
    /// Messages pushed to listeners in listen mode
    pub listener_deliveries: u64,
}

impl FleetStats {
    /// Total messages received by all workers.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.workers.iter().map(|w| w.messages).sum()
    }

    /// Total messages acknowledged by all workers.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.workers.iter().map(|w| w.acknowledged).sum()
    }

    /// Total single receives that timed out.
    #[must_use]
    pub fn receive_timeouts(&self) -> u64 {
        self.workers.iter().map(|w| w.receive_timeouts).sum()
    }

    /// Total failed receive attempts.
    #[must_use]
    pub fn receive_errors(&self) -> u64 {
        self.workers.iter().map(|w| w.receive_errors).sum()
    }

    /// Total failed downstream actions.
    #[must_use]
    pub fn action_failures(&self) -> u64 {
        self.workers.iter().map(|w| w.action_failures).sum()
    }

    /// Total handles dropped from rotation.
    #[must_use]
    pub fn dropped_handles(&self) -> u64 {
        self.workers.iter().map(|w| w.dropped_handles).sum()
    }
}
