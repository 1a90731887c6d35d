use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::debug;

use super::{Digester, Hash, HashError, HashStrategy, Result};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

struct Slot {
    strategy: HashStrategy,
    digester: Digester,
    consumed: u64,
}

/// Feeds bytes at increasing absolute offsets to every strategy whose range
/// contains them.
///
/// Used directly by tools that read a stream in their own loop (multipart
/// uploads) and by [`HashEngine`] for plain one-pass digests.
pub struct StreamHasher {
    slots: Vec<Slot>,
    position: u64,
}

impl StreamHasher {
    pub fn new(strategies: &[HashStrategy]) -> Self {
        let slots = strategies
            .iter()
            .map(|strategy| Slot {
                strategy: *strategy,
                digester: Digester::new(strategy.algorithm),
                consumed: 0,
            })
            .collect();

        Self { slots, position: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        let start = self.position;
        let end = start + data.len() as u64;

        for slot in &mut self.slots {
            let lo = slot.strategy.offset.max(start);
            let hi = slot.strategy.end().map_or(end, |e| e.min(end));
            if lo < hi {
                slot.digester
                    .update(&data[(lo - start) as usize..(hi - start) as usize]);
                slot.consumed += hi - lo;
            }
        }

        self.position = end;
    }

    /// Absolute offset of the next byte
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once every strategy's upper bound has been passed
    pub fn is_saturated(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| matches!(slot.strategy.end(), Some(end) if end <= self.position))
    }

    /// One [`Hash`] per strategy, in input order
    pub fn finish(self) -> Vec<Hash> {
        self.slots
            .into_iter()
            .map(|slot| Hash {
                hash_algorithm: slot.strategy.algorithm,
                hash: slot.digester.finish(),
                offset: Some(slot.strategy.offset),
                length: Some(slot.consumed),
            })
            .collect()
    }
}

/// One-pass multi-strategy digesting over an async reader
#[derive(Debug, Clone)]
pub struct HashEngine {
    buffer_size: usize,
}

impl Default for HashEngine {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl HashEngine {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Read `reader` once and compute every strategy.
    ///
    /// Reading stops early once all ranges are bounded and passed. A read
    /// error discards all partial digests.
    pub async fn digest<R>(&self, reader: &mut R, strategies: &[HashStrategy]) -> Result<Vec<Hash>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hasher = StreamHasher::new(strategies);
        let mut buffer = vec![0u8; self.buffer_size];

        while !hasher.is_saturated() {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|source| HashError::Read {
                    position: hasher.position(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        debug!(
            bytes = hasher.position(),
            strategies = strategies.len(),
            "Stream digested"
        );

        Ok(hasher.finish())
    }
}

/// Snapshot of what a [`HashingReader`] has seen
#[derive(Debug, Clone, Default)]
pub struct ReadTally {
    pub bytes: u64,
    pub hashes: Vec<Hash>,
}

/// `AsyncRead` adapter that digests and counts everything read through it.
///
/// The tally is shared so the caller can collect it after handing the reader
/// to a consumer that takes ownership.
pub struct HashingReader<R> {
    inner: R,
    hasher: Arc<Mutex<Option<StreamHasher>>>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, strategies: &[HashStrategy]) -> (Self, HashingHandle) {
        let hasher = Arc::new(Mutex::new(Some(StreamHasher::new(strategies))));
        (
            Self {
                inner,
                hasher: Arc::clone(&hasher),
            },
            HashingHandle { hasher },
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                if let Ok(mut guard) = this.hasher.lock() {
                    if let Some(hasher) = guard.as_mut() {
                        hasher.update(fresh);
                    }
                }
            }
        }

        poll
    }
}

/// Collects the digests of a [`HashingReader`]
pub struct HashingHandle {
    hasher: Arc<Mutex<Option<StreamHasher>>>,
}

impl HashingHandle {
    /// Finalise the digests. Returns an empty tally if already taken.
    pub fn finish(self) -> ReadTally {
        let taken = self.hasher.lock().ok().and_then(|mut guard| guard.take());
        match taken {
            Some(hasher) => ReadTally {
                bytes: hasher.position(),
                hashes: hasher.finish(),
            },
            None => ReadTally::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashAlgorithm, digest_bytes, tree_hash};
    use tokio::io::AsyncReadExt;

    fn generated(len: usize) -> Vec<u8> {
        // Deterministic pseudo-random bytes (LCG)
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_whole_stream_md5() {
        let data = generated(200_000);
        let mut reader = &data[..];

        let hashes = HashEngine::default()
            .digest(&mut reader, &[HashStrategy::whole(HashAlgorithm::Md5)])
            .await
            .unwrap();

        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].hash, digest_bytes(HashAlgorithm::Md5, &data));
        assert_eq!(hashes[0].offset, Some(0));
        assert_eq!(hashes[0].length, Some(200_000));
    }

    #[tokio::test]
    async fn test_disjoint_ranges_match_isolated_digests() {
        let data = generated(2 * 1024 * 1024);
        let strategies = [
            HashStrategy::range(HashAlgorithm::Sha256, 0, 1_048_575).unwrap(),
            HashStrategy::range(HashAlgorithm::Sha256, 1_048_576, 2_097_151).unwrap(),
        ];

        // Odd buffer size so range boundaries fall mid-buffer
        let engine = HashEngine::with_buffer_size(10_007);
        let mut reader = &data[..];
        let hashes = engine.digest(&mut reader, &strategies).await.unwrap();

        let first = digest_bytes(HashAlgorithm::Sha256, &data[..1_048_576]);
        let second = digest_bytes(HashAlgorithm::Sha256, &data[1_048_576..]);
        assert_eq!(hashes[0].hash, first);
        assert_eq!(hashes[1].hash, second);
        assert_ne!(hashes[0].hash, hashes[1].hash);
        assert_eq!(hashes[1].offset, Some(1_048_576));
        assert_eq!(hashes[1].length, Some(1_048_576));
    }

    #[tokio::test]
    async fn test_tree_hash_of_four_mib_is_reproducible() {
        let data = generated(4 * 1024 * 1024);
        let strategy = [HashStrategy::whole(HashAlgorithm::TreeHash)];
        let engine = HashEngine::default();

        let mut first_reader = &data[..];
        let first = engine.digest(&mut first_reader, &strategy).await.unwrap();
        let mut second_reader = &data[..];
        let second = engine.digest(&mut second_reader, &strategy).await.unwrap();

        assert_eq!(first[0].hash.len(), 64);
        assert_eq!(first, second);
        assert_eq!(first[0].hash, hex::encode(tree_hash(&data)));
        assert_eq!(
            first[0].hash,
            "1657c64445db68b7bad6a981e4e2ccb9fc27872c8f88a6171517482738670ed4"
        );
    }

    #[tokio::test]
    async fn test_stops_reading_after_bounded_ranges() {
        let data = generated(100_000);
        let mut reader = &data[..];
        let engine = HashEngine::with_buffer_size(1000);

        let hashes = engine
            .digest(
                &mut reader,
                &[HashStrategy::range(HashAlgorithm::Md5, 0, 4999).unwrap()],
            )
            .await
            .unwrap();

        assert_eq!(hashes[0].hash, digest_bytes(HashAlgorithm::Md5, &data[..5000]));
        // Stream left positioned just past the range
        assert_eq!(reader.len(), 95_000);
    }

    #[tokio::test]
    async fn test_zero_length_range_and_empty_stream() {
        let mut reader: &[u8] = &[];
        let hashes = HashEngine::default()
            .digest(
                &mut reader,
                &[
                    HashStrategy::whole(HashAlgorithm::TreeHash),
                    HashStrategy::span(HashAlgorithm::Md5, Some(0), Some(0)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(hashes[0].hash, digest_bytes(HashAlgorithm::Sha256, b""));
        assert_eq!(hashes[1].hash, digest_bytes(HashAlgorithm::Md5, b""));
        assert_eq!(hashes[1].length, Some(0));
    }

    #[tokio::test]
    async fn test_read_error_is_propagated() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::other("disk on fire")))
            }
        }

        let result = HashEngine::default()
            .digest(&mut Failing, &[HashStrategy::whole(HashAlgorithm::Md5)])
            .await;
        assert!(matches!(result, Err(HashError::Read { position: 0, .. })));
    }

    #[tokio::test]
    async fn test_hashing_reader_tallies() {
        let data = generated(70_000);
        let (mut reader, handle) =
            HashingReader::new(&data[..], &[HashStrategy::whole(HashAlgorithm::Md5)]);

        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        let tally = handle.finish();
        assert_eq!(tally.bytes, 70_000);
        assert_eq!(tally.hashes[0].hash, digest_bytes(HashAlgorithm::Md5, &data));
    }
}
