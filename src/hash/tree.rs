//! Glacier tree-hash
//!
//! SHA-256 over consecutive 1 MiB chunks, then pairwise SHA-256 of the
//! concatenated child digests until a single root remains. An unpaired digest
//! at the end of a level is carried up unchanged.

use sha2::{Digest, Sha256};

/// Leaf chunk size fixed by the Glacier tree-hash definition
pub const TREE_HASH_CHUNK_SIZE: usize = 1024 * 1024;

pub type Digest32 = [u8; 32];

/// Incremental tree-hash over a byte stream
#[derive(Debug, Clone, Default)]
pub struct TreeHasher {
    leaves: Vec<Digest32>,
    chunk: Sha256,
    chunk_len: usize,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (TREE_HASH_CHUNK_SIZE - self.chunk_len).min(data.len());
            self.chunk.update(&data[..take]);
            self.chunk_len += take;
            data = &data[take..];

            if self.chunk_len == TREE_HASH_CHUNK_SIZE {
                let full = std::mem::take(&mut self.chunk);
                self.leaves.push(full.finalize().into());
                self.chunk_len = 0;
            }
        }
    }

    /// Finish and return the root digest.
    ///
    /// Zero bytes of input yields the SHA-256 of an empty chunk.
    pub fn finish(mut self) -> Digest32 {
        if self.chunk_len > 0 || self.leaves.is_empty() {
            self.leaves.push(self.chunk.finalize().into());
        }
        // leaves is non-empty here
        combine(&self.leaves).unwrap_or_default()
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.finish())
    }
}

/// Reduce a level of digests to the tree root. `None` for an empty slice.
pub fn combine(leaves: &[Digest32]) -> Option<Digest32> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two digests"),
            })
            .collect();
    }

    Some(level[0])
}

/// Tree-hash of an in-memory buffer.
pub fn tree_hash(data: &[u8]) -> Digest32 {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(data: &[u8]) -> Digest32 {
        Sha256::digest(data).into()
    }

    fn pair(left: &Digest32, right: &Digest32) -> Digest32 {
        let mut joined = Vec::with_capacity(64);
        joined.extend_from_slice(left);
        joined.extend_from_slice(right);
        sha(&joined)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_empty_input_is_sha256_of_nothing() {
        assert_eq!(tree_hash(b""), sha(b""));
    }

    #[test]
    fn test_single_partial_chunk_is_plain_sha256() {
        let data = patterned(1000);
        assert_eq!(tree_hash(&data), sha(&data));
    }

    #[test]
    fn test_exactly_one_chunk() {
        let data = patterned(TREE_HASH_CHUNK_SIZE);
        assert_eq!(tree_hash(&data), sha(&data));
    }

    #[test]
    fn test_odd_leaf_is_carried_up() {
        let data = patterned(3 * TREE_HASH_CHUNK_SIZE);
        let leaves: Vec<Digest32> = data.chunks(TREE_HASH_CHUNK_SIZE).map(sha).collect();

        let expected = pair(&pair(&leaves[0], &leaves[1]), &leaves[2]);
        assert_eq!(tree_hash(&data), expected);
    }

    #[test]
    fn test_short_final_chunk() {
        let data = patterned(2 * TREE_HASH_CHUNK_SIZE + 17);
        let leaves: Vec<Digest32> = data.chunks(TREE_HASH_CHUNK_SIZE).map(sha).collect();
        assert_eq!(leaves.len(), 3);

        let expected = pair(&pair(&leaves[0], &leaves[1]), &leaves[2]);
        assert_eq!(tree_hash(&data), expected);
    }

    #[test]
    fn test_incremental_updates_match_one_shot() {
        let data = patterned(TREE_HASH_CHUNK_SIZE * 2 + 12345);

        let mut hasher = TreeHasher::new();
        for piece in data.chunks(7919) {
            hasher.update(piece);
        }

        assert_eq!(hasher.finish(), tree_hash(&data));
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex::encode(tree_hash(&patterned(3 * TREE_HASH_CHUNK_SIZE))),
            "2e7d51c0ffe06ce95fe74beed9a4ab35d18837f4ab2a9f4f066a60359eb999a1"
        );
        assert_eq!(
            hex::encode(tree_hash(&patterned(4 * TREE_HASH_CHUNK_SIZE))),
            "c7d749cd55cefa8ed8fbc208202e18d019b7701f29886f7c5d662d77b3903833"
        );
    }

    #[test]
    fn test_combine_empty() {
        assert!(combine(&[]).is_none());
    }
}
