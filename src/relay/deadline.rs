// Read/write deadlines for relay legs
//
// Tokio streams have no socket deadlines, so each half of a relayed stream is
// wrapped with the instant its next operation must finish by. An operation
// still pending at the deadline fails with `io::ErrorKind::TimedOut`.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

/// Read side of a relay leg
#[derive(Debug)]
pub struct DeadlineReader<R> {
    inner: R,
    deadline: Option<Instant>,
}

impl<R: AsyncRead + Unpin> DeadlineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            deadline: None,
        }
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) -> io::Result<()> {
        self.deadline = Some(deadline);
        Ok(())
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Read once, failing with `TimedOut` if the deadline passes first
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.deadline {
            Some(deadline) => timeout_at(deadline, self.inner.read(buf))
                .await
                .map_err(|_| timed_out())?,
            None => self.inner.read(buf).await,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write side of a relay leg
#[derive(Debug)]
pub struct DeadlineWriter<W> {
    inner: W,
    deadline: Option<Instant>,
    shut_down: bool,
}

impl<W: AsyncWrite + Unpin> DeadlineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            deadline: None,
            shut_down: false,
        }
    }

    /// Fails once the writer has been shut down
    pub fn set_write_deadline(&mut self, deadline: Instant) -> io::Result<()> {
        if self.shut_down {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write side already shut down",
            ));
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Write once, failing with `TimedOut` if the deadline passes first
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.deadline {
            Some(deadline) => timeout_at(deadline, self.inner.write(buf))
                .await
                .map_err(|_| timed_out())?,
            None => self.inner.write(buf).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.shut_down = true;
        self.inner.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Set `now + timeout` as the read deadline of `src` and the write deadline
/// of `dst`
///
/// Must be called before every read and every write so an idle leg times out
/// relative to its last activity.
pub fn set_deadlines<R, W>(
    timeout: Duration,
    src: &mut DeadlineReader<R>,
    dst: &mut DeadlineWriter<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "deadline out of range"))?;

    src.set_read_deadline(deadline)?;
    dst.set_write_deadline(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_set_deadlines_applies_same_instant() {
        let (a, b) = duplex(64);
        let mut reader = DeadlineReader::new(a);
        let mut writer = DeadlineWriter::new(b);

        set_deadlines(Duration::from_millis(500), &mut reader, &mut writer).unwrap();

        let read = reader.read_deadline().unwrap();
        assert_eq!(Some(read), writer.write_deadline());
        assert!(read > Instant::now());
    }

    #[tokio::test]
    async fn test_read_times_out_when_idle() {
        let (a, _b) = duplex(64);
        let (_c, d) = duplex(64);
        let mut reader = DeadlineReader::new(a);
        let mut writer = DeadlineWriter::new(d);

        set_deadlines(Duration::from_millis(50), &mut reader, &mut writer).unwrap();

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_rejected_after_shutdown() {
        let (a, b) = duplex(64);
        let mut reader = DeadlineReader::new(a);
        let mut writer = DeadlineWriter::new(b);

        writer.shutdown().await.unwrap();

        let err = set_deadlines(Duration::from_secs(1), &mut reader, &mut writer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_rejected() {
        let (a, b) = duplex(64);
        let mut reader = DeadlineReader::new(a);
        let mut writer = DeadlineWriter::new(b);

        let err = set_deadlines(Duration::MAX, &mut reader, &mut writer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
