/// Signal routing for both roles.
///
/// Master side: SIGINT/SIGTERM mean graceful stop (drain workers, exit 0),
/// SIGQUIT means immediate stop (kill workers, exit without draining). The
/// signals are delivered as messages into the supervisor's single event
/// loop, so supervisor state is only ever touched from one task.
///
/// Worker side: SIGTERM (the supervisor's stop signal) and SIGINT both latch
/// a shutdown watch that the accept loop races against. SIGQUIT keeps its
/// default disposition, so an immediate stop may abort an in-flight
/// connection; that data loss is accepted.
use crate::supervisor::SupervisorEvent;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

/// The two shutdown classes the master understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// SIGINT/SIGTERM: stop spawning, drain workers, exit 0.
    Graceful,
    /// SIGQUIT: kill every worker, exit without waiting.
    Immediate,
}

/// Install the master-side signal handlers and spawn the bridge task that
/// forwards each delivery as a supervisor event.
pub fn spawn_master_bridge(events: mpsc::Sender<SupervisorEvent>) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        loop {
            let kind = tokio::select! {
                _ = sigint.recv() => ShutdownKind::Graceful,
                _ = sigterm.recv() => ShutdownKind::Graceful,
                _ = sigquit.recv() => ShutdownKind::Immediate,
            };
            if events.send(SupervisorEvent::Shutdown(kind)).await.is_err() {
                // Supervisor loop ended, nothing left to notify.
                break;
            }
        }
    });
    Ok(())
}

/// Install the worker-side signal handlers and return the shutdown watch.
///
/// The watch is latched: once true it stays true, so a graceful stop that
/// lands mid-request is observed on the next loop turn.
pub fn worker_shutdown_watch() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!("graceful-stop received");
        let _ = tx.send(true);
    });
    Ok(rx)
}
