// Per-connection relay handler

use crate::relay::copy::{copy_with_timeout, CopyEnd, CopyOutcome};
use crate::relay::deadline::{DeadlineReader, DeadlineWriter};
use crate::relay::{ConnectionId, DisplayAddr, NegotiatedConn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn, Instrument};

/// How a handler finished
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Dial or grant failed; nothing was relayed
    Rejected,
    /// Both copy directions ran to completion
    Relayed {
        to_remote: CopyOutcome,
        to_client: CopyOutcome,
    },
    /// A copy task panicked; its streams were dropped with it
    Aborted,
}

/// Relays one accepted connection to its requested target
///
/// Single use: `handle` consumes the handler.
pub struct Handler<C> {
    id: ConnectionId,
    timeout: Duration,
    conn: C,
}

impl<C: NegotiatedConn> Handler<C> {
    pub fn new(id: ConnectionId, timeout: Duration, conn: C) -> Self {
        Self { id, timeout, conn }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Dial, grant or reject, relay, then close both connections
    pub async fn handle(self) -> HandlerOutcome {
        let span = tracing::info_span!("handler", id = %self.id);
        self.run().instrument(span).await
    }

    async fn run(self) -> HandlerOutcome {
        let Handler { timeout, mut conn, .. } = self;
        let client_addr = conn.peer_addr();
        let target = conn.target().to_string();

        info!("started");

        let remote = match TcpStream::connect(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                conn.reject().await;
                error!("connection to remote ({}) failed: {}", target, e);
                close_client(conn, client_addr).await;
                return HandlerOutcome::Rejected;
            }
        };

        let remote_addr = match remote.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                conn.reject().await;
                error!("remote ({}) went away right after connecting: {}", target, e);
                close_remote(remote, None).await;
                close_client(conn, client_addr).await;
                return HandlerOutcome::Rejected;
            }
        };

        debug!("successfully connected to remote ({})", remote_addr);

        if let Err(e) = conn.grant(remote_addr).await {
            warn!("failed to grant request for {}: {}", remote_addr, e);
            close_remote(remote, Some(remote_addr)).await;
            close_client(conn, client_addr).await;
            return HandlerOutcome::Rejected;
        }

        debug!(
            "exchanging data between {} and {}",
            DisplayAddr(client_addr),
            remote_addr
        );

        match exchange(timeout, conn, remote, client_addr, Some(remote_addr)).await {
            Some((conn, remote, to_remote, to_client)) => {
                close_remote(remote, Some(remote_addr)).await;
                close_client(conn, client_addr).await;
                debug!("terminating");
                HandlerOutcome::Relayed {
                    to_remote,
                    to_client,
                }
            }
            None => HandlerOutcome::Aborted,
        }
    }
}

async fn close_remote(mut remote: TcpStream, addr: Option<SocketAddr>) {
    debug!("closing remote connection to {}", DisplayAddr(addr));
    let _ = remote.shutdown().await;
}

async fn close_client<C: NegotiatedConn>(mut conn: C, addr: Option<SocketAddr>) {
    debug!("closing client ({}) connection", DisplayAddr(addr));
    let _ = conn.shutdown().await;
}

/// Run both copy directions as independent tasks and wait for both
///
/// Neither direction stops the other: each ends on its own timeout, EOF or
/// error. Returns the reassembled streams with both outcomes.
async fn exchange<A, B>(
    timeout: Duration,
    a: A,
    b: B,
    a_addr: Option<SocketAddr>,
    b_addr: Option<SocketAddr>,
) -> Option<(A, B, CopyOutcome, CopyOutcome)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_read, a_write) = split(a);
    let (b_read, b_write) = split(b);

    let forward = tokio::spawn(
        direction(timeout, a_read, b_write, DisplayAddr(a_addr), DisplayAddr(b_addr))
            .in_current_span(),
    );
    let backward = tokio::spawn(
        direction(timeout, b_read, a_write, DisplayAddr(b_addr), DisplayAddr(a_addr))
            .in_current_span(),
    );

    let (forward, backward) = tokio::join!(forward, backward);

    match (forward, backward) {
        (Ok((a_read, b_write, to_b)), Ok((b_read, a_write, to_a))) => {
            Some((a_read.unsplit(a_write), b_read.unsplit(b_write), to_b, to_a))
        }
        (forward, backward) => {
            if let Err(e) = forward {
                error!("copy task panicked: {}", e);
            }
            if let Err(e) = backward {
                error!("copy task panicked: {}", e);
            }
            None
        }
    }
}

async fn direction<R, W>(
    timeout: Duration,
    src: ReadHalf<R>,
    dst: WriteHalf<W>,
    src_addr: DisplayAddr,
    dst_addr: DisplayAddr,
) -> (ReadHalf<R>, WriteHalf<W>, CopyOutcome)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut src = DeadlineReader::new(src);
    let mut dst = DeadlineWriter::new(dst);

    let outcome = copy_with_timeout(timeout, &mut dst, &mut src).await;

    match &outcome.end {
        CopyEnd::Timeout => debug!("reading timeout occurred, terminating copy"),
        CopyEnd::Eof => debug!("EOF reached, terminating copy"),
        CopyEnd::Error(e) => error!("error performing copy operation: {}", e),
    }
    debug!("{} --- {} ---> {}", src_addr, outcome.bytes, dst_addr);

    (src.into_inner(), dst.into_inner(), outcome)
}
