/// Worker process creation and exit monitoring.
///
/// A worker is this server's own executable re-run with the master's argv
/// plus the internal `--worker-fd` flag naming the inherited listening
/// descriptor. Re-running the binary (rather than forking in place) keeps
/// the child free of inherited runtime threads while preserving the fork
/// model's crash isolation: separate process, separate address space.
use crate::supervisor::SupervisorEvent;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use tokio::process::Command;
use tokio::sync::mpsc;

/// How a worker process ended, as reported by its monitor task.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub pid: u32,
    /// Exit code; None when killed by a signal.
    pub code: Option<i32>,
    /// Killing signal, if any.
    pub signal: Option<i32>,
}

/// Errors that can occur while spawning a worker.
///
/// These are transient: the supervisor logs them and retries on its next
/// monitoring tick rather than giving up.
#[derive(Debug)]
pub enum SpawnError {
    /// Could not determine our own executable path.
    Exe { source: std::io::Error },
    /// The spawn itself failed (e.g. resource exhaustion).
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Exe { source } => {
                write!(f, "failed to locate server executable: {source}")
            }
            SpawnError::Spawn { source } => {
                write!(f, "failed to spawn worker process: {source}")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Exe { source } => Some(source),
            SpawnError::Spawn { source } => Some(source),
        }
    }
}

/// A freshly spawned worker, identified by pid.
pub struct SpawnedWorker {
    pub pid: u32,
}

/// Spawn one worker process inheriting the shared listening socket.
///
/// The worker repeats the master's argv so both roles resolve identical
/// configuration, and runs in its own process group so terminal Ctrl-C
/// reaches only the master. A monitor task awaits the child and reports its
/// exit into the supervisor's event queue.
pub fn spawn_worker(
    listener_fd: RawFd,
    events: mpsc::Sender<SupervisorEvent>,
) -> Result<SpawnedWorker, SpawnError> {
    let exe = std::env::current_exe().map_err(|e| SpawnError::Exe { source: e })?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut child = Command::new(&exe)
        .args(&args)
        .arg("--worker-fd")
        .arg(listener_fd.to_string())
        .process_group(0)
        .spawn()
        .map_err(|e| SpawnError::Spawn { source: e })?;

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            // id() is None only once the child has been reaped; there is
            // nothing to track or signal, so report a failed spawn.
            return Err(SpawnError::Spawn {
                source: std::io::Error::other("worker process exited before it could be tracked"),
            });
        }
    };
    tracing::info!(pid, "worker started");

    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => WorkerExit {
                pid,
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed waiting on worker");
                WorkerExit {
                    pid,
                    code: None,
                    signal: None,
                }
            }
        };
        // Err means the supervisor loop already ended; nothing to report.
        let _ = events.send(SupervisorEvent::WorkerExited(exit)).await;
    });

    Ok(SpawnedWorker { pid })
}
