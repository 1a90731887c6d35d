//! Adapters between blocking transport clients (FTP, SFTP) and async streams

use bytes::Bytes;
use futures::StreamExt;
use std::io::{self, Read};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use super::ByteReader;

const CHUNK: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Producer side of [`spawn_reader`]
pub(crate) struct ChunkSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChunkSink {
    /// Forward `reader` to the async side until EOF.
    ///
    /// Returns `false` if the consumer hung up early.
    pub(crate) fn forward<R: Read + ?Sized>(&self, reader: &mut R) -> io::Result<bool> {
        let mut buffer = vec![0u8; CHUNK];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                return Ok(true);
            }
            if self
                .tx
                .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..read])))
                .is_err()
            {
                return Ok(false);
            }
        }
    }
}

/// Run a blocking producer on the blocking pool and expose its output as an
/// async reader.
///
/// Waits for the first chunk so connection and open failures surface here
/// rather than on the first read.
pub(crate) async fn spawn_reader<F>(produce: F) -> io::Result<ByteReader>
where
    F: FnOnce(&ChunkSink) -> io::Result<()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let sink = ChunkSink { tx };
        if let Err(e) = produce(&sink) {
            let _ = sink.tx.blocking_send(Err(e));
        }
    });

    let first = match rx.recv().await {
        Some(Err(e)) => return Err(e),
        other => other,
    };

    let rest = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let stream = futures::stream::iter(first).chain(rest);

    Ok(Box::new(StreamReader::new(Box::pin(stream))))
}

/// Blocking `Read` over chunks sent from an async task
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                None => return Ok(0),
                Some(Err(e)) => return Err(e),
                Some(Ok(chunk)) => self.current = chunk,
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// Feed exactly `length` bytes of `source` to a blocking consumer.
///
/// A read error or a source shorter than `length` is delivered to the
/// consumer as a read error, so a half-written upload fails rather than
/// completing truncated.
pub(crate) async fn pump_into_blocking<T, F>(source: ByteReader, length: u64, consume: F) -> io::Result<T>
where
    F: FnOnce(&mut ChannelReader) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

    let consumer = tokio::task::spawn_blocking(move || {
        let mut reader = ChannelReader {
            rx,
            current: Bytes::new(),
        };
        consume(&mut reader)
    });

    let mut source = source.take(length);
    let mut buffer = vec![0u8; CHUNK];
    let mut sent = 0u64;
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => {
                if sent < length {
                    let short = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source ended after {} of {} bytes", sent, length),
                    );
                    let _ = tx.send(Err(short)).await;
                }
                break;
            }
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buffer[..n]))).await.is_err() {
                    break;
                }
                sent += n as u64;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    drop(tx);

    consumer.await.map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_spawn_reader_streams_blocking_output() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 13) as u8).collect();
        let expected = data.clone();

        let mut reader = spawn_reader(move |sink| {
            sink.forward(&mut Cursor::new(data))?;
            Ok(())
        })
        .await
        .unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_spawn_reader_reports_open_failure() {
        let result = spawn_reader(|_sink| Err(io::Error::other("connection refused"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pump_delivers_exact_length() {
        let source: ByteReader = Box::new(&b"0123456789"[..]);
        let received = pump_into_blocking(source, 4, |reader| {
            let mut out = Vec::new();
            reader.read_to_end(&mut out)?;
            Ok(out)
        })
        .await
        .unwrap();
        assert_eq!(received, b"0123");
    }

    #[tokio::test]
    async fn test_pump_fails_consumer_on_short_source() {
        let source: ByteReader = Box::new(&b"01"[..]);
        let result = pump_into_blocking(source, 4, |reader| {
            let mut out = Vec::new();
            reader.read_to_end(&mut out)?;
            Ok(out)
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
