//! End-to-end lifecycle scenarios against the compiled binary: pool size,
//! one-for-one respawn, client isolation, graceful and forced shutdown, and
//! bind-conflict startup failure.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_prefork");

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_master(worker_count: u32, port: u16) -> Child {
    Command::new(BIN)
        .args(["-w", &worker_count.to_string(), "-p", &port.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

/// Pids of the master's direct children, read from /proc.
fn worker_pids(master_pid: u32) -> Vec<i32> {
    let master = master_pid.to_string();
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // The comm field is parenthesized and may contain spaces; the ppid
        // is the second field after it.
        let Some(rest) = stat.rsplit(')').next() else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() > 1 && fields[1] == master {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn wait_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("process did not exit within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn pid_gone(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_err()
}

fn http_get(port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn test_pool_respawn_and_graceful_shutdown() {
    let port = free_port();
    let mut master = start_master(3, port);
    let master_pid = master.id();

    assert!(
        wait_for(|| worker_pids(master_pid).len() == 3, Duration::from_secs(10)),
        "pool never reached 3 workers"
    );
    let before = worker_pids(master_pid);

    let response = http_get(port);
    assert!(response.contains("Hello!"));

    // Kill one worker externally; the supervisor replaces it one-for-one.
    kill(Pid::from_raw(before[0]), Signal::SIGKILL).unwrap();
    assert!(
        wait_for(
            || {
                let now = worker_pids(master_pid);
                now.len() == 3 && now != before
            },
            Duration::from_secs(10)
        ),
        "killed worker was not replaced"
    );

    // Two concurrent clients each get a complete, independent response.
    let (a, b) = std::thread::scope(|s| {
        let first = s.spawn(|| http_get(port));
        let second = s.spawn(|| http_get(port));
        (first.join().unwrap(), second.join().unwrap())
    });
    for response in [a, b] {
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("<html><body>Hello!</body></html>"));
    }

    let workers = worker_pids(master_pid);

    // Graceful stop, delivered twice: the repeat is a no-op.
    kill(Pid::from_raw(master_pid as i32), Signal::SIGTERM).unwrap();
    kill(Pid::from_raw(master_pid as i32), Signal::SIGTERM).unwrap();

    let status = wait_exit(&mut master, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    assert!(
        wait_for(
            || workers.iter().all(|&pid| pid_gone(pid)),
            Duration::from_secs(5)
        ),
        "workers survived graceful shutdown"
    );
}

#[test]
fn test_immediate_stop_kills_workers() {
    let port = free_port();
    let mut master = start_master(2, port);
    let master_pid = master.id();

    assert!(
        wait_for(|| worker_pids(master_pid).len() == 2, Duration::from_secs(10)),
        "pool never reached 2 workers"
    );
    let workers = worker_pids(master_pid);

    kill(Pid::from_raw(master_pid as i32), Signal::SIGQUIT).unwrap();

    let status = wait_exit(&mut master, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    assert!(
        wait_for(
            || workers.iter().all(|&pid| pid_gone(pid)),
            Duration::from_secs(5)
        ),
        "workers survived immediate stop"
    );
}

#[test]
fn test_bind_conflict_fails_startup_without_spawning_workers() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let mut master = start_master(3, port);
    let master_pid = master.id();

    let status = wait_exit(&mut master, Duration::from_secs(10));
    assert_ne!(status.code(), Some(0));
    assert!(worker_pids(master_pid).is_empty());
    drop(holder);
}

#[test]
fn test_zero_worker_count_is_rejected_at_startup() {
    let mut master = start_master(0, free_port());
    let status = wait_exit(&mut master, Duration::from_secs(10));
    assert_ne!(status.code(), Some(0));
}
