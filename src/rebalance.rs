use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace};

/// Rebalancing policy state for the v2 link-name B-tree. Deletions under
/// the lazy strategy only enqueue work here; the sweep itself happens in
/// `batch_rebalance` on the owning thread, or in the background worker
/// when incremental mode is enabled.

#[derive(Clone, Copy, Debug)]
pub struct LazyRebalanceConfig {
    /// Trigger a sweep when underflow_count / total_nodes reaches this.
    /// Clamped into [0.01, 0.20] at enable time.
    pub threshold: f64,
    /// Trigger a sweep regardless of the counter once this much time has
    /// passed since the last one.
    pub max_delay: Duration,
}

impl Default for LazyRebalanceConfig {
    fn default() -> Self {
        LazyRebalanceConfig {
            threshold: 0.05,
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

pub struct IncrementalConfig {
    /// Tick period of the background worker.
    pub interval: Duration,
    /// Per-tick work budget; bounds stop latency.
    pub budget: Duration,
    /// Invoked after every tick with a progress snapshot.
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for IncrementalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalConfig")
            .field("interval", &self.interval)
            .field("budget", &self.budget)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

pub type ProgressCallback = Box<dyn Fn(RebalanceProgress) + Send>;

impl std::fmt::Debug for RebalanceProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceProgress")
            .field("rebalanced", &self.rebalanced)
            .field("remaining", &self.remaining)
            .field("session_duration", &self.session_duration)
            .field("estimated_remaining", &self.estimated_remaining)
            .field("complete", &self.complete)
            .finish()
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        IncrementalConfig {
            interval: Duration::from_secs(5),
            budget: Duration::from_millis(100),
            progress: None,
        }
    }
}

/// Per-tick progress report handed to the configured callback.
pub struct RebalanceProgress {
    pub rebalanced: u64,
    pub remaining: u64,
    pub session_duration: Duration,
    pub estimated_remaining: Duration,
    pub complete: bool,
}

/// Counters shared between the owning thread and the background worker.
/// Every access goes through the mutex.
#[derive(Default, Debug)]
pub struct SharedRebalanceState {
    pub underflow_nodes: Vec<u64>,
    pub nodes_rebalanced: u64,
    pub running: bool,
    pub last_session_time: Duration,
    pub estimated_eta: Duration,
}

/// Snapshot returned by `get_lazy_rebalancing_stats`.
#[derive(Clone, Debug)]
pub struct LazyRebalanceStats {
    pub underflow_count: u64,
    pub pending_deletes: u64,
    pub pending_nodes: usize,
    pub nodes_rebalanced: u64,
    pub since_last_rebalance: Duration,
    pub worker_running: bool,
}

#[derive(Debug)]
pub(crate) struct LazyState {
    pub config: LazyRebalanceConfig,
    pub underflow_count: u64,
    pub pending_deletes: u64,
    pub last_rebalance: Instant,
    pub shared: Arc<Mutex<SharedRebalanceState>>,
}

impl LazyState {
    pub fn new(mut config: LazyRebalanceConfig) -> LazyState {
        config.threshold = config.threshold.clamp(0.01, 0.20);
        LazyState {
            config,
            underflow_count: 0,
            pending_deletes: 0,
            last_rebalance: Instant::now(),
            shared: Arc::new(Mutex::new(SharedRebalanceState::default())),
        }
    }

    /// Policy check after a lazy delete.
    pub fn should_trigger(&self, total_nodes: u64) -> bool {
        let ratio = self.underflow_count as f64 / total_nodes.max(1) as f64;
        ratio >= self.config.threshold || self.last_rebalance.elapsed() >= self.config.max_delay
    }

    pub fn reset_after_sweep(&mut self) {
        self.underflow_count = 0;
        self.pending_deletes = 0;
        self.last_rebalance = Instant::now();
    }
}

#[derive(Debug)]
pub(crate) struct IncrementalWorker {
    stop_tx: mpsc::Sender<()>,
    stopped_rx: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl IncrementalWorker {
    /// Spawn the background worker. The loop is a select between the
    /// periodic tick (`recv_timeout`) and the stop channel; stop is only
    /// honored between sessions, so stop latency is bounded by one budget.
    pub fn spawn(
        shared: Arc<Mutex<SharedRebalanceState>>,
        config: IncrementalConfig,
    ) -> IncrementalWorker {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (stopped_tx, stopped_rx) = mpsc::channel::<()>();
        let IncrementalConfig {
            interval,
            budget,
            progress,
        } = config;

        shared.lock().expect("rebalance state poisoned").running = true;

        let handle = std::thread::Builder::new()
            .name("btree-rebalance".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            run_session(&shared, budget, interval, progress.as_ref());
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                shared.lock().expect("rebalance state poisoned").running = false;
                // Dropping the sender closes the channel; that is the
                // "stopped" acknowledgement the owner waits on.
                drop(stopped_tx);
            })
            .expect("failed to spawn rebalance worker");

        IncrementalWorker {
            stop_tx,
            stopped_rx,
            handle: Some(handle),
        }
    }

    /// Signal stop, wait for the acknowledgement, and join the thread.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        let _ = self.stopped_rx.recv();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Best-effort signal without joining; used by destructors that must
    /// not block.
    pub fn abandon(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// One budgeted sweep session. At depth 0 an underflow entry is retired by
/// dequeuing it; the deeper merge/redistribute walk hangs off this same
/// entry point once internal nodes exist.
fn run_session(
    shared: &Arc<Mutex<SharedRebalanceState>>,
    budget: Duration,
    interval: Duration,
    progress: Option<&ProgressCallback>,
) {
    let start = Instant::now();
    let mut rebalanced: u64 = 0;
    loop {
        if start.elapsed() >= budget {
            break;
        }
        let mut state = shared.lock().expect("rebalance state poisoned");
        match state.underflow_nodes.pop() {
            Some(address) => {
                state.nodes_rebalanced += 1;
                rebalanced += 1;
                trace!("retired underflow entry for node {address:#x}");
            }
            None => break,
        }
    }

    let session_duration = start.elapsed();
    let remaining;
    let eta;
    {
        let mut state = shared.lock().expect("rebalance state poisoned");
        state.last_session_time = session_duration;
        remaining = state.underflow_nodes.len() as u64;
        eta = if rebalanced > 0 {
            let sessions = remaining.div_ceil(rebalanced);
            (session_duration + interval).saturating_mul(sessions.min(u32::MAX as u64) as u32)
        } else {
            Duration::ZERO
        };
        state.estimated_eta = eta;
    }
    debug!("rebalance session: {rebalanced} retired, {remaining} remaining");

    if let Some(cb) = progress {
        cb(RebalanceProgress {
            rebalanced,
            remaining,
            session_duration,
            estimated_remaining: eta,
            complete: remaining == 0,
        });
    }
}
