// SOCKS5 negotiation adapter
//
// Accepts TCP connections and runs the SOCKS5 greeting/request exchange
// (no authentication, CONNECT only), one task per client, before handing the
// connection to a relay handler. The handler answers the request through
// `grant`/`reject`.

use crate::error::{Error, Result};
use crate::relay::{NegotiatedConn, NegotiationListener};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, Instrument};

/// Time a client gets to finish the greeting and request
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 server socket
///
/// Each client's handshake runs in its own task, so a client that stalls its
/// handshake never delays the others. `accept` hands out connections in the
/// order their handshakes complete.
pub struct SocksListener {
    inner: TcpListener,
    pending: Mutex<JoinSet<Option<SocksConn>>>,
}

impl SocksListener {
    /// Bind on `network` (`tcp`, `tcp4`, `tcp6`) at `host:port`
    pub async fn bind(network: &str, address: &str) -> Result<Self> {
        let wants: fn(&SocketAddr) -> bool = match network {
            "tcp" => |_| true,
            "tcp4" => SocketAddr::is_ipv4,
            "tcp6" => SocketAddr::is_ipv6,
            other => return Err(Error::UnsupportedNetwork(other.to_string())),
        };

        let bind_error = |source| Error::Bind {
            network: network.to_string(),
            address: address.to_string(),
            source,
        };

        let candidates: Vec<SocketAddr> = lookup_host(address)
            .await
            .map_err(bind_error)?
            .filter(wants)
            .collect();

        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no address of the requested family",
        );
        for addr in candidates {
            match TcpListener::bind(addr).await {
                Ok(inner) => {
                    return Ok(Self {
                        inner,
                        pending: Mutex::new(JoinSet::new()),
                    })
                }
                Err(e) => last_err = e,
            }
        }

        Err(bind_error(last_err))
    }
}

async fn negotiate(mut stream: TcpStream, peer: SocketAddr) -> Option<SocksConn> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream)).await {
        Ok(Ok(target)) => {
            debug!("socks request from {} for {}", peer, target);
            Some(SocksConn {
                stream,
                target,
                peer,
            })
        }
        Ok(Err(e)) => {
            debug!("socks handshake with {} failed: {}", peer, e);
            None
        }
        Err(_) => {
            debug!("socks handshake with {} timed out", peer);
            None
        }
    }
}

#[async_trait]
impl NegotiationListener for SocksListener {
    type Conn = SocksConn;

    /// Next client that completed a valid handshake
    ///
    /// Clients that fail or stall the handshake are dropped and never
    /// surface here. Handshakes still pending are aborted when the listener
    /// is dropped.
    async fn accept(&self) -> io::Result<SocksConn> {
        let mut pending = self.pending.lock().await;
        loop {
            tokio::select! {
                accepted = self.inner.accept() => {
                    let (stream, peer) = accepted?;
                    pending.spawn(negotiate(stream, peer).in_current_span());
                }
                Some(done) = pending.join_next() => {
                    if let Ok(Some(conn)) = done {
                        return Ok(conn);
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read the greeting and the request, returning the requested `host:port`
async fn handshake(stream: &mut TcpStream) -> io::Result<String> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(protocol_error("not a SOCKS5 client"));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(protocol_error("client does not offer no-auth"));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(protocol_error("bad request version"));
    }
    if request[1] != CMD_CONNECT {
        write_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        return Err(protocol_error("only CONNECT is supported"));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| protocol_error("domain is not UTF-8"))?
        }
        _ => {
            write_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(protocol_error("unsupported address type"));
        }
    };
    let port = stream.read_u16().await?;

    Ok(format!("{}:{}", host, port))
}

async fn write_reply(stream: &mut TcpStream, code: u8, bound: Option<SocketAddr>) -> io::Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS_VERSION, code, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());

    stream.write_all(&reply).await
}

/// A SOCKS5 client waiting for its CONNECT reply
pub struct SocksConn {
    stream: TcpStream,
    target: String,
    peer: SocketAddr,
}

#[async_trait]
impl NegotiatedConn for SocksConn {
    fn target(&self) -> &str {
        &self.target
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn grant(&mut self, remote: SocketAddr) -> io::Result<()> {
        write_reply(&mut self.stream, REPLY_SUCCEEDED, Some(remote)).await
    }

    async fn reject(&mut self) {
        if let Err(e) = write_reply(&mut self.stream, REPLY_GENERAL_FAILURE, None).await {
            debug!("failed to send socks rejection to {}: {}", self.peer, e);
        }
    }
}

impl AsyncRead for SocksConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SocksConn {
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
