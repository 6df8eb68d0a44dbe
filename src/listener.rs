/// One TCP listening socket shared by every worker process.
///
/// The master creates the socket without close-on-exec, so each spawned
/// worker inherits the same kernel socket at the same descriptor number and
/// can accept from it directly. That inheritance is the entire sharing
/// mechanism: the socket is configured once here and only ever accepted from
/// afterwards.
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// The bound listening socket, owned by the master for the life of the
/// process. Dropping it closes the socket.
#[derive(Debug)]
pub struct BoundListener {
    socket: Socket,
    local_addr: SocketAddr,
}

/// Errors that can occur while binding the listener. All of them are fatal
/// at startup: no worker is ever spawned after a bind failure.
#[derive(Debug)]
pub enum BindError {
    /// Failed to resolve the host name.
    Resolve {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    /// The host resolved to no usable address.
    NoAddress { host: String, port: u16 },
    /// Socket creation, configuration, bind, or listen failed.
    Socket {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Resolve { host, port, source } => {
                write!(f, "failed to resolve {host}:{port}: {source}")
            }
            BindError::NoAddress { host, port } => {
                write!(f, "{host}:{port} resolved to no address")
            }
            BindError::Socket { addr, source } => {
                write!(f, "failed to bind {addr}: {source}")
            }
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::Resolve { source, .. } => Some(source),
            BindError::Socket { source, .. } => Some(source),
            BindError::NoAddress { .. } => None,
        }
    }
}

/// Bind the listening socket: resolve host:port, set SO_REUSEADDR so a
/// restarted master can bind immediately after a prior instance's shutdown,
/// and listen with the configured backlog.
pub fn bind(host: &str, port: u16, backlog: u32) -> Result<BoundListener, BindError> {
    let addr = resolve(host, port)?;

    // new_raw leaves close-on-exec unset, so spawned workers inherit the
    // same kernel socket at the same descriptor.
    let socket = Socket::new_raw(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| BindError::Socket { addr, source: e })?;
    socket
        .set_reuse_address(true)
        .map_err(|e| BindError::Socket { addr, source: e })?;
    socket
        .bind(&addr.into())
        .map_err(|e| BindError::Socket { addr, source: e })?;
    socket
        .listen(backlog as i32)
        .map_err(|e| BindError::Socket { addr, source: e })?;
    // Accepting is driven by each worker's reactor, never by a blocking call.
    socket
        .set_nonblocking(true)
        .map_err(|e| BindError::Socket { addr, source: e })?;

    let local_addr = socket
        .local_addr()
        .ok()
        .and_then(|sa| sa.as_socket())
        .unwrap_or(addr);
    tracing::info!(%local_addr, backlog, "listening");

    Ok(BoundListener { socket, local_addr })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, BindError> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|e| BindError::Resolve {
        host: host.to_string(),
        port,
        source: e,
    })?;
    addrs.next().ok_or_else(|| BindError::NoAddress {
        host: host.to_string(),
        port,
    })
}

impl BoundListener {
    /// The address the socket actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The raw descriptor workers inherit; named by `--worker-fd`.
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Give up ownership of the descriptor without closing it.
    #[cfg(test)]
    pub fn into_raw_fd(self) -> RawFd {
        use std::os::fd::IntoRawFd;
        self.socket.into_raw_fd()
    }
}

/// Worker side: adopt the inherited listening descriptor into a Tokio
/// listener. The descriptor number comes from the master via `--worker-fd`.
pub fn adopt(fd: RawFd) -> std::io::Result<tokio::net::TcpListener> {
    // Safety: the descriptor was inherited from the master, which created it
    // in `bind` and passed its number on our command line; nothing else in
    // this process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(std_listener)
}
