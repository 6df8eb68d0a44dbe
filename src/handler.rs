/// Request handling: the seam between the accept loop and whatever produces
/// a response, plus the default toy handler.
///
/// One request per connection, handled synchronously, `Connection: close`.
/// Handler failures never cross the worker boundary; the accept loop logs
/// them and drops the connection.
use crate::config::LimitsConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RESPONSE_BODY: &str = "<html><body>Hello!</body></html>";

/// Per-connection errors. Caught inside the worker's accept loop; the worker
/// keeps serving.
#[derive(Debug)]
pub enum HandlerError {
    /// The client sent nothing within the read timeout.
    ReadTimeout { after: Duration },
    /// I/O failure on the connection.
    Io { source: std::io::Error },
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::ReadTimeout { after } => {
                write!(f, "request read timed out after {}s", after.as_secs())
            }
            HandlerError::Io { source } => write!(f, "connection I/O error: {source}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Io { source } => Some(source),
            HandlerError::ReadTimeout { .. } => None,
        }
    }
}

/// Handles one accepted connection to completion.
///
/// The accept loop awaits `handle` before accepting again, so a handler
/// holds its worker for the duration of one exchange.
#[allow(async_fn_in_trait)]
pub trait RequestHandler {
    async fn handle(&self, stream: TcpStream) -> Result<(), HandlerError>;
}

/// The default handler: bounded single read, fixed HTML response.
pub struct HelloHandler {
    max_request_bytes: usize,
    read_timeout: Duration,
}

impl HelloHandler {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            max_request_bytes: limits.max_request_bytes,
            read_timeout: Duration::from_secs(limits.read_timeout_secs),
        }
    }
}

impl RequestHandler for HelloHandler {
    async fn handle(&self, mut stream: TcpStream) -> Result<(), HandlerError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        // Single bounded read; the response goes out regardless of whether
        // the read succeeded, so a silent client still gets the page.
        let mut buf = vec![0u8; self.max_request_bytes];
        let read_err = match tokio::time::timeout(self.read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                tracing::debug!(bytes = n, request = %String::from_utf8_lossy(&buf[..n]), "request");
                None
            }
            Ok(Err(e)) => Some(HandlerError::Io { source: e }),
            Err(_) => Some(HandlerError::ReadTimeout {
                after: self.read_timeout,
            }),
        };

        let response = render_response();
        stream
            .write_all(&response)
            .await
            .map_err(|e| HandlerError::Io { source: e })?;
        stream
            .shutdown()
            .await
            .map_err(|e| HandlerError::Io { source: e })?;
        tracing::debug!(bytes = response.len(), "response sent");

        match read_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn render_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/html\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        RESPONSE_BODY.len(),
        RESPONSE_BODY
    )
    .into_bytes()
}
