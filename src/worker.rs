/// The accept loop run inside a worker process.
///
/// Each worker owns one serial loop over the shared listening socket;
/// concurrency comes from multiple worker processes accepting on the same
/// socket, with the OS delivering each connection to exactly one of them.
use crate::handler::RequestHandler;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Accept connections until the shutdown watch latches.
///
/// Each accepted connection is handled to completion before the next accept,
/// so a graceful stop that arrives mid-request is observed on the following
/// loop turn and the in-flight exchange always finishes. Handler and accept
/// failures are logged and absorbed; they never end the loop.
pub async fn serve<H: RequestHandler>(
    listener: TcpListener,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let pid = std::process::id();
    tracing::info!(pid, "worker accepting connections");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let accepted = tokio::select! {
            res = listener.accept() => res,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Signal bridge gone; treat as shutdown.
                    break;
                }
                continue;
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                if let Err(e) = handler.handle(stream).await {
                    tracing::warn!(%peer, error = %e, "request handling failed");
                }
            }
            Err(e) => {
                // ECONNABORTED and friends; the worker keeps serving.
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_PAUSE).await;
            }
        }
    }

    tracing::info!(pid, "worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::handler::{HandlerError, HelloHandler};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    async fn bound_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_serve_exits_promptly_on_shutdown() {
        let (listener, _) = bound_listener().await;
        let (tx, rx) = watch::channel(false);
        let handler = HelloHandler::new(&LimitsConfig::default());

        let task = tokio::spawn(serve(listener, handler, rx));
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not exit after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    /// Signals when a connection reaches it, then serves slowly.
    struct SlowHandler {
        started: mpsc::UnboundedSender<()>,
    }

    impl RequestHandler for SlowHandler {
        async fn handle(&self, mut stream: TcpStream) -> Result<(), HandlerError> {
            self.started.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream
                .write_all(b"done")
                .await
                .map_err(|e| HandlerError::Io { source: e })?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_in_flight_connection_finishes_before_exit() {
        let (listener, addr) = bound_listener().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve(
            listener,
            SlowHandler { started: started_tx },
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Shutdown lands while the handler is mid-exchange.
        started_rx.recv().await.unwrap();
        shutdown_tx.send(true).unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"done");

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not exit after in-flight connection")
            .unwrap();
        assert!(result.is_ok());
    }

    /// Always fails without writing anything.
    struct FailingHandler;

    impl RequestHandler for FailingHandler {
        async fn handle(&self, _stream: TcpStream) -> Result<(), HandlerError> {
            Err(HandlerError::Io {
                source: std::io::Error::other("boom"),
            })
        }
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_end_the_loop() {
        let (listener, addr) = bound_listener().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(serve(listener, FailingHandler, shutdown_rx));

        // Two connections in a row both get accepted (and dropped) even
        // though the handler fails every time.
        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        }

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("serve did not exit after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
