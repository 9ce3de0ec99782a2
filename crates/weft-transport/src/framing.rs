//! Length-prefixed framing: `u32` big-endian length, then the body.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Write a length-prefixed frame and flush.
///
/// Callers enforce the size limit; this only refuses lengths that do not
/// fit the `u32` prefix.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), anyhow::Error> {
    let len = u32::try_from(data.len())
        .map_err(|_| anyhow::anyhow!("frame of {} bytes overflows length prefix", data.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream between frames. Waiting
/// for the next frame header is unbounded (pipes idle between
/// conversations); once a header byte has arrived, the rest of the frame
/// must arrive within `body_timeout`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
    body_timeout: Duration,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_buf = [0u8; 4];
    let first = reader
        .read(&mut len_buf)
        .await
        .map_err(|e| TransportError::Receive(e.into()))?;
    if first == 0 {
        return Ok(None);
    }

    let body = async {
        if first < len_buf.len() {
            reader
                .read_exact(&mut len_buf[first..])
                .await
                .map_err(|e| TransportError::Receive(e.into()))?;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_size {
            return Err(TransportError::MessageTooLarge {
                size: len,
                max: max_size,
            });
        }

        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Receive(e.into()))?;
        Ok(buf)
    };

    match tokio::time::timeout(body_timeout, body).await {
        Ok(result) => result.map(Some),
        Err(_) => Err(TransportError::Timeout {
            operation: "frame read",
            after: body_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;
    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, b"hello frame").await.unwrap();
        let got = read_frame(&mut b, LIMIT, DEADLINE).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello frame"[..]));
    }

    #[tokio::test]
    async fn consecutive_frames_preserve_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for i in 0..5u8 {
            write_frame(&mut a, &[i; 3]).await.unwrap();
        }
        for i in 0..5u8 {
            let got = read_frame(&mut b, LIMIT, DEADLINE).await.unwrap().unwrap();
            assert_eq!(got, vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        let got = read_frame(&mut b, LIMIT, DEADLINE).await.unwrap();
        assert_eq!(got, Some(Vec::new()));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, LIMIT, DEADLINE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &[0u8; 100]).await.unwrap();
        let err = read_frame(&mut b, 10, DEADLINE).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 100, max: 10 }));
    }

    #[tokio::test]
    async fn truncated_body_is_receive_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b, LIMIT, DEADLINE).await.unwrap_err();
        assert!(matches!(err, TransportError::Receive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"ab").await.unwrap();
        let err = read_frame(&mut b, LIMIT, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        drop(a);
    }
}
