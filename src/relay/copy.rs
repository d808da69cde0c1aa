// One direction of a relayed connection

use crate::relay::deadline::{set_deadlines, DeadlineReader, DeadlineWriter};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Size of each chunk read from the source
pub const COPY_BUFFER_SIZE: usize = 1024;

/// Why a copy direction stopped
///
/// None of these is fatal to the handler: each simply ends one direction.
#[derive(Debug)]
pub enum CopyEnd {
    /// No activity within the copy timeout
    Timeout,
    /// Source reached end of stream
    Eof,
    /// Any other I/O error
    Error(io::Error),
}

impl CopyEnd {
    fn from_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => CopyEnd::Timeout,
            io::ErrorKind::UnexpectedEof => CopyEnd::Eof,
            _ => CopyEnd::Error(err),
        }
    }
}

impl fmt::Display for CopyEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyEnd::Timeout => f.write_str("timeout"),
            CopyEnd::Eof => f.write_str("eof"),
            CopyEnd::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Bytes moved and termination cause of one copy run
#[derive(Debug)]
pub struct CopyOutcome {
    pub bytes: u64,
    pub end: CopyEnd,
}

/// Copy from `src` to `dst` until timeout, EOF or error
///
/// Deadlines are refreshed before every read and again before writing each
/// chunk, so the timeout bounds idle time rather than total transfer time.
pub async fn copy_with_timeout<R, W>(
    timeout: Duration,
    dst: &mut DeadlineWriter<W>,
    src: &mut DeadlineReader<R>,
) -> CopyOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    let end = loop {
        if let Err(e) = set_deadlines(timeout, src, dst) {
            break CopyEnd::from_error(e);
        }

        let n = match src.read(&mut buf).await {
            Ok(0) => break CopyEnd::Eof,
            Ok(n) => n,
            Err(e) => break CopyEnd::from_error(e),
        };

        if let Err(e) = set_deadlines(timeout, src, dst) {
            break CopyEnd::from_error(e);
        }

        match write_all(dst, &buf[..n]).await {
            Ok(written) => total += written as u64,
            Err((written, e)) => {
                total += written as u64;
                break CopyEnd::from_error(e);
            }
        }
    };

    CopyOutcome { bytes: total, end }
}

/// Write the whole chunk, looping over partial writes
///
/// On failure, reports how much of the chunk made it out.
async fn write_all<W>(dst: &mut DeadlineWriter<W>, chunk: &[u8]) -> Result<usize, (usize, io::Error)>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < chunk.len() {
        match dst.write(&chunk[written..]).await {
            Ok(0) => {
                return Err((
                    written,
                    io::Error::new(io::ErrorKind::WriteZero, "destination accepted no bytes"),
                ))
            }
            Ok(n) => written += n,
            Err(e) => return Err((written, e)),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copies_until_eof() {
        let (mut client, relay_in) = duplex(4096);
        let (relay_out, mut server) = duplex(4096);

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        drop(client);

        let mut src = DeadlineReader::new(relay_in);
        let mut dst = DeadlineWriter::new(relay_out);
        let outcome = copy_with_timeout(Duration::from_secs(5), &mut dst, &mut src).await;

        assert!(matches!(outcome.end, CopyEnd::Eof));
        assert_eq!(outcome.bytes, payload.len() as u64);

        drop(dst);
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_stops_on_idle_timeout() {
        let (mut client, relay_in) = duplex(64);
        let (relay_out, mut server) = duplex(64);

        client.write_all(b"0123456789").await.unwrap();

        let mut src = DeadlineReader::new(relay_in);
        let mut dst = DeadlineWriter::new(relay_out);

        let started = Instant::now();
        let outcome = copy_with_timeout(Duration::from_millis(100), &mut dst, &mut src).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome.end, CopyEnd::Timeout));
        assert_eq!(outcome.bytes, 10);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[tokio::test]
    async fn test_write_stall_times_out() {
        // Destination never drains, so the second write blocks on a full pipe.
        let (mut client, relay_in) = duplex(4096);
        let (relay_out, _server) = duplex(16);

        client.write_all(&[7u8; 64]).await.unwrap();

        let mut src = DeadlineReader::new(relay_in);
        let mut dst = DeadlineWriter::new(relay_out);
        let outcome = copy_with_timeout(Duration::from_millis(100), &mut dst, &mut src).await;

        assert!(matches!(outcome.end, CopyEnd::Timeout));
        assert_eq!(outcome.bytes, 16);
    }

    #[tokio::test]
    async fn test_other_errors_are_reported() {
        let (mut client, relay_in) = duplex(64);
        let (relay_out, server) = duplex(64);
        drop(server);

        client.write_all(b"abc").await.unwrap();

        let mut src = DeadlineReader::new(relay_in);
        let mut dst = DeadlineWriter::new(relay_out);
        let outcome = copy_with_timeout(Duration::from_secs(1), &mut dst, &mut src).await;

        assert!(matches!(outcome.end, CopyEnd::Error(_)));
        assert_eq!(outcome.bytes, 0);
    }
}
