//! Helpers for running blocking tar code against Tokio streams.

use core::fmt::{Debug, Display};
use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::Result;

/// Flatten a nested Result<Result<T>>, defaulting to converting the error type to an `anyhow::Error`.
/// See https://doc.rust-lang.org/std/result/enum.Result.html#method.flatten
pub(crate) fn flatten_anyhow<T, E>(r: std::result::Result<Result<T>, E>) -> Result<T>
where
    E: Display + Debug + Send + Sync + 'static,
{
    match r {
        Ok(x) => x,
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// A wrapper around [`tokio::task::spawn_blocking`] that flattens nested results.
pub(crate) async fn spawn_blocking_flatten<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    flatten_anyhow(tokio::task::spawn_blocking(f).await)
}

/// Run `f` on a worker thread, copying everything it writes into `dest`.
pub(crate) async fn spawn_blocking_writer<F>(dest: impl AsyncWrite + Unpin, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
{
    let (tx_buf, mut rx_buf) = tokio::io::duplex(8192);
    let producer = spawn_blocking_flatten(move || {
        let mut tx_buf = tokio_util::io::SyncIoBridge::new(tx_buf);
        f(&mut tx_buf)?;
        tx_buf.flush()?;
        Ok(())
    });
    // The receiving end is owned by this future, so that if writing to
    // `dest` fails it is dropped and the producer sees a broken pipe
    // instead of blocking forever.
    let copier = async move {
        let mut dest = dest;
        tokio::io::copy(&mut rx_buf, &mut dest).await?;
        dest.flush().await?;
        Ok::<_, anyhow::Error>(())
    };
    let (produced, copied) = tokio::join!(producer, copier);
    // A producer failure just looks like EOF to the copier, but a copier
    // failure makes the producer fail with a less useful error.
    copied?;
    produced
}

/// Run `f` on a worker thread, reading everything from `src`.
pub(crate) async fn spawn_blocking_reader<F>(src: impl AsyncRead + Unpin, f: F) -> Result<()>
where
    F: FnOnce(&mut dyn Read) -> Result<()> + Send + 'static,
{
    let (mut tx_buf, rx_buf) = tokio::io::duplex(8192);
    let consumer = spawn_blocking_flatten(move || {
        let mut rx_buf = tokio_util::io::SyncIoBridge::new(rx_buf);
        f(&mut rx_buf)
    });
    let feeder = async move {
        let mut src = src;
        tokio::io::copy(&mut src, &mut tx_buf).await?;
        tx_buf.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    let (consumed, fed) = tokio::join!(consumer, feeder);
    match (consumed, fed) {
        // The consumer stopped reading; its error says why.
        (Err(e), Err(fe)) if fe.kind() == std::io::ErrorKind::BrokenPipe => Err(e),
        // A source failure looks like a truncated stream to the consumer.
        (_, Err(fe)) => Err(anyhow::Error::new(fe).context("Reading input stream")),
        (consumed, Ok(())) => consumed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer() -> Result<()> {
        let mut out = Vec::new();
        spawn_blocking_writer(&mut out, |w| {
            for i in 0..10000u32 {
                writeln!(w, "{i}")?;
            }
            Ok(())
        })
        .await?;
        let s = String::from_utf8(out)?;
        assert_eq!(s.lines().count(), 10000);
        assert_eq!(s.lines().last(), Some("9999"));
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_error() {
        let mut out = Vec::new();
        let r = spawn_blocking_writer(&mut out, |w| {
            w.write_all(b"partial")?;
            anyhow::bail!("failed halfway")
        })
        .await;
        assert_eq!(r.unwrap_err().to_string(), "failed halfway");
        assert_eq!(out, b"partial");
    }

    #[tokio::test]
    async fn test_reader() -> Result<()> {
        let (mut tx, rx) = tokio::io::duplex(64);
        let feeder = async move {
            tx.write_all(&[7u8; 4096]).await?;
            Ok::<_, anyhow::Error>(())
        };
        let consumer = spawn_blocking_reader(rx, |r| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            anyhow::ensure!(buf.len() == 4096);
            Ok(())
        });
        let (fed, consumed) = tokio::join!(feeder, consumer);
        fed?;
        consumed?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reader_stops_early() {
        let src = std::io::Cursor::new(vec![0u8; 1 << 20]);
        let r = spawn_blocking_reader(src, |r| {
            let mut buf = [0u8; 16];
            r.read_exact(&mut buf)?;
            anyhow::bail!("bad header")
        })
        .await;
        assert_eq!(r.unwrap_err().to_string(), "bad header");
    }
}
