/// The master supervisor: owns the worker pool, reconciles it to the target
/// count, and coordinates shutdown.
///
/// All pool state lives in `SupervisorState`, a pure struct mutated only by
/// the single `run` loop; worker exits and signals arrive as messages on one
/// mpsc queue, so there is no locking anywhere in the master.
use crate::config::Config;
use crate::listener::BoundListener;
use crate::signals::ShutdownKind;
use crate::spawn::{self, WorkerExit};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Lifecycle of one tracked worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, monitor task not yet attached.
    Starting,
    /// Accepting connections.
    Running,
    /// Sent a graceful-stop, exit not yet observed.
    Exiting,
    /// Exit observed; the record is removed once reaped.
    Reaped,
}

/// One spawned worker process as tracked by the supervisor.
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: u64,
    pub pid: u32,
    pub spawned_at: Instant,
    pub state: WorkerState,
}

/// Everything that can wake the supervisor loop.
pub enum SupervisorEvent {
    /// A worker process exited (monitor task).
    WorkerExited(WorkerExit),
    /// A shutdown signal arrived (signal bridge).
    Shutdown(ShutdownKind),
    /// Re-run reconciliation after a failed spawn.
    SpawnRetry,
}

/// Pool bookkeeping, separated from the event loop so the invariants are
/// unit-testable without spawning processes.
pub struct SupervisorState {
    target_worker_count: u32,
    workers: Vec<WorkerRecord>,
    shutdown_requested: bool,
    next_worker_id: u64,
}

impl SupervisorState {
    pub fn new(target_worker_count: u32) -> Self {
        Self {
            target_worker_count,
            workers: Vec::new(),
            shutdown_requested: false,
            next_worker_id: 0,
        }
    }

    /// Track a freshly spawned worker. Returns its record id.
    pub fn record_spawn(&mut self, pid: u32) -> u64 {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.push(WorkerRecord {
            id,
            pid,
            spawned_at: Instant::now(),
            state: WorkerState::Starting,
        });
        id
    }

    /// Mark a worker Running once its monitor task is attached.
    pub fn mark_running(&mut self, id: u64) {
        if let Some(w) = self.workers.iter_mut().find(|w| w.id == id) {
            w.state = WorkerState::Running;
        }
    }

    /// Workers that count toward the target.
    pub fn live_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Starting | WorkerState::Running))
            .count()
    }

    /// How many workers must be spawned to reach the target. Always zero
    /// once shutdown has been requested.
    pub fn deficit(&self) -> u32 {
        if self.shutdown_requested {
            return 0;
        }
        (self.target_worker_count as usize).saturating_sub(self.live_count()) as u32
    }

    /// Mark a worker Reaped and remove it from the tracked set, returning
    /// the record for logging. Unknown pids return None.
    pub fn record_exit(&mut self, pid: u32) -> Option<WorkerRecord> {
        let idx = self.workers.iter().position(|w| w.pid == pid)?;
        let mut record = self.workers.remove(idx);
        record.state = WorkerState::Reaped;
        Some(record)
    }

    /// Request shutdown and return the pids to send a graceful-stop, each
    /// exactly once. A second call returns nothing.
    pub fn begin_drain(&mut self) -> Vec<u32> {
        if self.shutdown_requested {
            return Vec::new();
        }
        self.shutdown_requested = true;
        self.workers
            .iter_mut()
            .filter(|w| matches!(w.state, WorkerState::Starting | WorkerState::Running))
            .map(|w| {
                w.state = WorkerState::Exiting;
                w.pid
            })
            .collect()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// True once shutdown was requested and every worker has been reaped.
    pub fn drained(&self) -> bool {
        self.shutdown_requested && self.workers.is_empty()
    }

    /// Every tracked pid, whatever its state.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.workers.iter().map(|w| w.pid).collect()
    }
}

/// The master's event loop. Owns the listening socket for the life of the
/// process; dropping the supervisor at Terminated closes it.
pub struct Supervisor {
    state: SupervisorState,
    listener: BoundListener,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    retry_delay: Duration,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        listener: BoundListener,
        events_tx: mpsc::Sender<SupervisorEvent>,
        events_rx: mpsc::Receiver<SupervisorEvent>,
    ) -> Self {
        Self {
            state: SupervisorState::new(config.server.worker_count),
            listener,
            events_tx,
            events_rx,
            retry_delay: Duration::from_millis(config.respawn.retry_delay_ms),
        }
    }

    /// Spawn the initial pool, then block on the event queue until drained
    /// (graceful) or forced out (immediate).
    pub async fn run(mut self) {
        self.reconcile();

        while let Some(event) = self.events_rx.recv().await {
            match event {
                SupervisorEvent::WorkerExited(exit) => {
                    self.on_worker_exit(exit);
                    if self.state.drained() {
                        tracing::info!("all workers exited");
                        break;
                    }
                    self.reconcile();
                }
                SupervisorEvent::Shutdown(ShutdownKind::Graceful) => {
                    if self.state.shutdown_requested() {
                        tracing::info!("already draining, ignoring repeated graceful-stop");
                    } else {
                        tracing::info!("graceful-stop received, draining workers");
                        for pid in self.state.begin_drain() {
                            signal_worker(pid, Signal::SIGTERM);
                        }
                    }
                    if self.state.drained() {
                        break;
                    }
                }
                SupervisorEvent::Shutdown(ShutdownKind::Immediate) => {
                    tracing::info!("immediate-stop received, killing workers");
                    self.state.begin_drain();
                    for pid in self.state.tracked_pids() {
                        signal_worker(pid, Signal::SIGKILL);
                    }
                    break;
                }
                SupervisorEvent::SpawnRetry => {
                    self.reconcile();
                }
            }
        }

        tracing::info!("supervisor terminated");
    }

    fn on_worker_exit(&mut self, exit: WorkerExit) {
        let Some(record) = self.state.record_exit(exit.pid) else {
            tracing::debug!(pid = exit.pid, "exit event for untracked worker");
            return;
        };
        let uptime_secs = record.spawned_at.elapsed().as_secs();
        match (exit.code, exit.signal) {
            (Some(code), _) => {
                tracing::info!(pid = exit.pid, worker = record.id, code, uptime_secs, "worker exited")
            }
            (None, Some(sig)) => {
                tracing::warn!(pid = exit.pid, worker = record.id, signal = sig, uptime_secs, "worker killed by signal")
            }
            (None, None) => {
                tracing::warn!(pid = exit.pid, worker = record.id, uptime_secs, "worker exited with unknown status")
            }
        }
    }

    /// One-for-one replacement: spawn until the live count reaches the
    /// target. A failed spawn is logged and retried after `retry_delay`
    /// rather than treated as fatal.
    fn reconcile(&mut self) {
        while self.state.deficit() > 0 {
            match spawn::spawn_worker(self.listener.raw_fd(), self.events_tx.clone()) {
                Ok(worker) => {
                    let id = self.state.record_spawn(worker.pid);
                    self.state.mark_running(id);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_ms = self.retry_delay.as_millis() as u64,
                        "worker spawn failed, will retry"
                    );
                    let tx = self.events_tx.clone();
                    let delay = self.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SupervisorEvent::SpawnRetry).await;
                    });
                    break;
                }
            }
        }
    }
}

fn signal_worker(pid: u32, sig: Signal) {
    if pid == 0 {
        // kill(0, sig) signals our own process group, master included.
        tracing::warn!(signal = %sig, "refusing to signal pid 0");
        return;
    }
    // A worker that already exited races its in-flight exit event; ESRCH
    // here is expected and harmless.
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        tracing::debug!(pid, signal = %sig, error = %e, "signal to worker failed");
    }
}
