//! Part-wise upload sessions for the S3 and Glacier upload tools

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::Result;
use crate::hash::HashAlgorithm;

/// One part of a multipart upload
#[derive(Debug, Clone)]
pub struct PartUpload {
    /// 1-based part number
    pub number: u32,
    /// Absolute byte offset of the part in the source
    pub offset: u64,
    pub body: Bytes,
    /// Part digest in the target's [`MultipartTarget::part_checksum`] form
    pub checksum: String,
}

/// Storage service that accepts multipart uploads
#[async_trait]
pub trait MultipartTarget: Send + Sync {
    /// Digest the service verifies for each part
    fn part_checksum(&self) -> HashAlgorithm;

    /// Digest of the whole payload required on completion, if any
    fn completion_checksum(&self) -> Option<HashAlgorithm> {
        None
    }

    /// Open an upload session for `destination`
    async fn begin(&self, destination: &Url, part_size: u64) -> Result<Box<dyn MultipartSession>>;
}

#[async_trait]
pub trait MultipartSession: Send {
    /// Upload one part, returning the service's receipt (ETag or checksum)
    async fn upload_part(&mut self, part: PartUpload) -> Result<String>;

    /// Assemble the uploaded parts. Returns the final location, if the
    /// service reports one.
    async fn complete(&mut self, total_length: u64, checksum: Option<String>) -> Result<Option<String>>;

    async fn abort(&mut self) -> Result<()>;
}
