//! Byte-level read/write loops with the retry and timeout policy.
//!
//! A read attempt that transfers nothing within `delay` counts as a stall
//! (not EOF); stalls are retried up to `retries` times. End-of-stream is a
//! hard channel error. Writes loop until the whole frame is out and give up
//! after one full no-progress window.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Retry policy for reads that stall mid-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Stalled attempts tolerated before giving up.
    pub retries: u32,
    /// Wait per attempt.
    pub delay: Duration,
}

impl ReadPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Same delay, different retry budget.
    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_millis(200),
        }
    }
}

/// Fill `buf` completely from `reader`.
pub async fn read_fully<R>(reader: &mut R, buf: &mut [u8], policy: ReadPolicy) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    let mut stalls = 0u32;
    while filled < buf.len() {
        match tokio::time::timeout(policy.delay, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(n)) => {
                filled += n;
                stalls = 0;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => {
                stalls += 1;
                if stalls > policy.retries {
                    return Err(TransportError::ReadTimeout {
                        retries: policy.retries,
                    });
                }
                tracing::trace!(filled, want = buf.len(), stalls, "read stalled, retrying");
            }
        }
    }
    Ok(())
}

/// Read and discard `len` bytes, keeping the stream on a frame boundary.
pub async fn skip_bytes<R>(reader: &mut R, mut len: usize, policy: ReadPolicy) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 512];
    while len > 0 {
        let chunk = len.min(scratch.len());
        read_fully(reader, &mut scratch[..chunk], policy).await?;
        len -= chunk;
    }
    Ok(())
}

/// Write all of `data`, failing after `no_progress` without a single byte written.
pub async fn write_fully<W>(writer: &mut W, data: &[u8], no_progress: Duration) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let timeout_err = || TransportError::WriteTimeout {
        timeout_ms: no_progress.as_millis() as u64,
    };

    let mut written = 0;
    while written < data.len() {
        match tokio::time::timeout(no_progress, writer.write(&data[written..])).await {
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => return Err(timeout_err()),
        }
    }

    match tokio::time::timeout(no_progress, writer.flush()).await {
        Ok(result) => result.map_err(TransportError::Io),
        Err(_) => Err(timeout_err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_fully_across_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client.write_all(b"he").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"llo").await.unwrap();
        });

        let mut buf = [0u8; 5];
        read_fully(&mut server, &mut buf, ReadPolicy::default()).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_fully_reports_closed_channel() {
        let mut data: &[u8] = b"abc";
        let mut buf = [0u8; 8];
        let err = read_fully(&mut data, &mut buf, ReadPolicy::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn read_fully_times_out_after_retries() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = [0u8; 4];
        let policy = ReadPolicy::new(3, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        let err = read_fully(&mut server, &mut buf, policy).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout { retries: 3 }));
        // Initial attempt plus three retries.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_stall_budget() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for byte in b"abcd" {
                tokio::time::sleep(Duration::from_millis(150)).await;
                client.write_all(&[*byte]).await.unwrap();
            }
        });

        // Each byte arrives after one stall; never more than one in a row.
        let mut buf = [0u8; 4];
        read_fully(&mut server, &mut buf, ReadPolicy::new(1, Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn skip_keeps_following_bytes() {
        let mut stream = vec![0u8; 1200];
        stream.extend_from_slice(b"tail");
        let mut data: &[u8] = &stream;
        skip_bytes(&mut data, 1200, ReadPolicy::default()).await.unwrap();
        let mut tail = [0u8; 4];
        read_fully(&mut data, &mut tail, ReadPolicy::default()).await.unwrap();
        assert_eq!(&tail, b"tail");
    }

    #[tokio::test]
    async fn write_fully_delivers_everything() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let payload = vec![7u8; 100];
        let expected = payload.clone();

        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; 100];
            server.read_exact(&mut got).await.unwrap();
            got
        });

        write_fully(&mut client, &payload, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn write_fully_gives_up_without_progress() {
        // Nobody drains the other end; the 8-byte pipe fills and stalls.
        let (mut client, _server) = tokio::io::duplex(8);
        let err = write_fully(&mut client, &[1u8; 64], Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::WriteTimeout { timeout_ms: 500 }));
    }
}
