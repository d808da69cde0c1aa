// SOCKS relay
//
// A listener accepts already-negotiated connections from the negotiation
// layer, and a handler per connection dials the requested target and copies
// bytes both ways under a sliding idle timeout.

pub mod copy;
pub mod deadline;
pub mod handler;
pub mod listener;
pub mod socks;

pub use copy::{copy_with_timeout, CopyEnd, CopyOutcome};
pub use deadline::{set_deadlines, DeadlineReader, DeadlineWriter};
pub use handler::{Handler, HandlerOutcome};
pub use listener::{Listener, ListenerStats};
pub use socks::{SocksConn, SocksListener};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A client connection whose accept-time handshake has completed
///
/// The handler owns it for its whole life: it either grants or rejects the
/// request, then relays bytes through the `AsyncRead`/`AsyncWrite` impls.
#[async_trait]
pub trait NegotiatedConn: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Target requested by the client, as `host:port`
    fn target(&self) -> &str;

    /// Address of the client, if known
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Tell the client its request succeeded
    async fn grant(&mut self, remote: SocketAddr) -> io::Result<()>;

    /// Tell the client its request failed
    async fn reject(&mut self);
}

/// Server socket that hands out negotiated connections
///
/// Implementations report a closed socket with `io::ErrorKind::NotConnected`;
/// any other error is fatal to the accept loop.
#[async_trait]
pub trait NegotiationListener: Send + Sync + 'static {
    type Conn: NegotiatedConn;

    async fn accept(&self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Whether an accept error means the socket was closed
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected
}

/// Listener id plus per-listener sequence number, e.g. `2.17`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub listener: String,
    pub seq: u64,
}

impl ConnectionId {
    pub fn new(listener: impl Into<String>, seq: u64) -> Self {
        Self {
            listener: listener.into(),
            seq,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.listener, self.seq)
    }
}

/// Formats an optional address for log lines
pub(crate) struct DisplayAddr(pub Option<SocketAddr>);

impl fmt::Display for DisplayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("?"),
        }
    }
}
