// Accept loop for one SOCKS listener

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::relay::handler::Handler;
use crate::relay::socks::SocksListener;
use crate::relay::{is_listener_closed, ConnectionId, NegotiationListener};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, Instrument};

/// Counters reported when a listener terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    /// Connections accepted since launch
    pub accepted: u64,
}

/// Owns one server socket and every handler spawned from it
pub struct Listener<L> {
    id: String,
    socket: L,
    timeout: Duration,
    close: CancellationToken,
}

impl Listener<SocksListener> {
    /// Bind a SOCKS listener from its configuration
    ///
    /// `shutdown` is the run-wide shutdown token; the listener closes when it
    /// fires or when its own `close_token` is cancelled.
    pub async fn bind(id: impl Into<String>, config: &ListenerConfig, shutdown: &CancellationToken) -> Result<Self> {
        let socket = SocksListener::bind(&config.network, &config.bind_address()).await?;
        Ok(Self::new(id, socket, config.copy_timeout(), shutdown.child_token()))
    }
}

impl<L: NegotiationListener> Listener<L> {
    pub fn new(id: impl Into<String>, socket: L, timeout: Duration, close: CancellationToken) -> Self {
        Self {
            id: id.into(),
            socket,
            timeout,
            close,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket(&self) -> &L {
        &self.socket
    }

    /// Token that stops this listener's accept loop when cancelled
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Accept until closed, then wait for every in-flight handler
    pub async fn listen(self) -> ListenerStats {
        let span = tracing::info_span!("listener", id = %self.id);
        self.run().instrument(span).await
    }

    async fn run(self) -> ListenerStats {
        let handlers = TaskTracker::new();
        let mut accepted: u64 = 0;

        info!("started");

        loop {
            tokio::select! {
                biased;

                _ = self.close.cancelled() => {
                    debug!("listener was closed, terminating");
                    break;
                }
                result = self.socket.accept() => match result {
                    Ok(conn) => {
                        accepted += 1;
                        debug!("total connections since launch: {}", accepted);

                        let id = ConnectionId::new(self.id.clone(), accepted);
                        let handler = Handler::new(id, self.timeout, conn);

                        debug!("starting handler {}", handler.id());
                        handlers.spawn(
                            async move {
                                let id = handler.id().clone();
                                handler.handle().await;
                                info!("handler {} terminated", id);
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) if is_listener_closed(&e) => {
                        debug!("listener was closed, terminating");
                        break;
                    }
                    Err(e) => {
                        error!("fatal error accepting connection: {}", e);
                        break;
                    }
                }
            }
        }

        debug!("waiting for handlers to finish");
        handlers.close();
        handlers.wait().await;

        debug!("terminating");
        drop(self.socket);

        ListenerStats { accepted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::NegotiatedConn;
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
    use tokio::sync::{mpsc, Mutex};

    /// Connection whose target is always unreachable
    struct StubConn {
        stream: DuplexStream,
    }

    impl AsyncRead for StubConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StubConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl NegotiatedConn for StubConn {
        fn target(&self) -> &str {
            "127.0.0.1:1"
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        async fn grant(&mut self, _remote: SocketAddr) -> io::Result<()> {
            Ok(())
        }

        async fn reject(&mut self) {}
    }

    /// Listener fed from a channel; a closed channel reads as a closed socket
    struct ChannelListener {
        rx: Mutex<mpsc::Receiver<io::Result<StubConn>>>,
        accepts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NegotiationListener for ChannelListener {
        type Conn = StubConn;

        async fn accept(&self) -> io::Result<StubConn> {
            let next = self.rx.lock().await.recv().await;
            self.accepts.fetch_add(1, Ordering::SeqCst);
            next.unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::NotConnected)))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn channel_listener() -> (ChannelListener, mpsc::Sender<io::Result<StubConn>>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::channel(8);
        let accepts = Arc::new(AtomicUsize::new(0));
        let listener = ChannelListener {
            rx: Mutex::new(rx),
            accepts: accepts.clone(),
        };
        (listener, tx, accepts)
    }

    fn stub() -> StubConn {
        let (stream, _peer) = tokio::io::duplex(64);
        StubConn { stream }
    }

    #[tokio::test]
    async fn test_counts_connections_until_socket_closes() {
        let (socket, tx, _) = channel_listener();
        let listener = Listener::new("7", socket, Duration::from_millis(100), CancellationToken::new());

        for _ in 0..3 {
            tx.send(Ok(stub())).await.unwrap();
        }
        drop(tx);

        let stats = listener.listen().await;
        assert_eq!(stats.accepted, 3);
    }

    #[tokio::test]
    async fn test_fatal_accept_error_ends_loop() {
        let (socket, tx, _) = channel_listener();
        let listener = Listener::new("8", socket, Duration::from_millis(100), CancellationToken::new());

        tx.send(Ok(stub())).await.unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::Other, "boom"))).await.unwrap();
        tx.send(Ok(stub())).await.unwrap();

        let stats = listener.listen().await;
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let (socket, tx, accepts) = channel_listener();
        let close = CancellationToken::new();
        let listener = Listener::new("9", socket, Duration::from_millis(100), close.clone());

        close.cancel();
        tx.send(Ok(stub())).await.unwrap();

        let stats = listener.listen().await;
        assert_eq!(stats.accepted, 0);
        assert_eq!(accepts.load(Ordering::SeqCst), 0);
    }
}
