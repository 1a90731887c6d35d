//! Amazon Glacier handler, multipart target and archive retrieval

use async_trait::async_trait;
use aws_sdk_glacier::Client;
use aws_sdk_glacier::error::DisplayErrorContext;
use aws_sdk_glacier::primitives::ByteStream;
use aws_sdk_glacier::types::JobParameters;
use tracing::{debug, info, warn};
use url::Url;

use super::aws::{GlacierLocation, GlacierResource, redact};
use super::multipart::{MultipartSession, MultipartTarget, PartUpload};
use super::{ByteReader, ProtocolError, ProtocolHandler, Result, buffer_exact};
use crate::hash::{HashAlgorithm, digest_bytes};
use crate::humanize::ByteSize;

/// Glacier account id meaning "the credentials' own account"
const ACCOUNT: &str = "-";

fn sdk_error<E: std::error::Error>(uri: &str, error: E) -> ProtocolError {
    ProtocolError::transport(uri, DisplayErrorContext(error))
}

/// Public URI of an archive, without the secret key
fn archive_location(base: &Url, vault: &str, archive_id: &str) -> String {
    redact(&GlacierLocation::archive_uri(base, vault, archive_id))
}

struct Bound {
    uri: String,
    base: Url,
    location: GlacierLocation,
    client: Client,
}

/// Glacier access bound to a vault, an archive or a retrieval job.
///
/// - vault URI: `copy_to` uploads a new archive
/// - archive URI: `delete` removes it; reads require a retrieval job first
/// - job URI: `open_stream` reads the completed job's output and
///   `content_length` reports the archive size
pub struct GlacierHandler {
    limit: ByteSize,
    bound: Option<Bound>,
    /// Archive written by the last `copy_to`
    uploaded: Option<String>,
}

impl GlacierHandler {
    pub fn new(limit: ByteSize) -> Self {
        Self {
            limit,
            bound: None,
            uploaded: None,
        }
    }

    fn bound(&self) -> Result<&Bound> {
        self.bound.as_ref().ok_or(ProtocolError::NotInitialized)
    }
}

#[async_trait]
impl ProtocolHandler for GlacierHandler {
    fn scheme(&self) -> &'static str {
        "glacier"
    }

    async fn init(&mut self, uri: &Url) -> Result<()> {
        if uri.scheme() != "glacier" {
            return Err(ProtocolError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let location = GlacierLocation::parse(uri)?;
        let client = location.client();
        self.bound = Some(Bound {
            uri: redact(uri),
            base: uri.clone(),
            location,
            client,
        });
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<ByteReader> {
        let bound = self.bound()?;
        let job_id = match &bound.location.resource {
            GlacierResource::Job(id) => id,
            GlacierResource::Archive(_) => {
                return Err(ProtocolError::invalid_uri(
                    &bound.uri,
                    "archives cannot be read directly; restore the archive and read its job URI",
                ));
            }
            GlacierResource::Vault => return Err(self.unsupported("open_stream")),
        };

        let output = bound
            .client
            .get_job_output()
            .account_id(ACCOUNT)
            .vault_name(&bound.location.vault)
            .job_id(job_id)
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn content_length(&mut self) -> Result<u64> {
        let bound = self.bound()?;
        let GlacierResource::Job(job_id) = &bound.location.resource else {
            return Err(self.unsupported("content_length"));
        };

        let job = bound
            .client
            .describe_job()
            .account_id(ACCOUNT)
            .vault_name(&bound.location.vault)
            .job_id(job_id)
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        job.archive_size_in_bytes()
            .and_then(|size| u64::try_from(size).ok())
            .ok_or_else(|| ProtocolError::transport(&bound.uri, "job reports no archive size"))
    }

    async fn copy_to(&mut self, source: ByteReader, length: u64) -> Result<()> {
        self.uploaded = None;
        let limit = self.limit;
        let bound = self.bound()?;
        if bound.location.resource != GlacierResource::Vault {
            return Err(ProtocolError::invalid_uri(&bound.uri, "uploads target a vault URI"));
        }

        let body = buffer_exact(&bound.uri, source, length, limit).await?;
        let checksum = digest_bytes(HashAlgorithm::TreeHash, &body);

        let output = bound
            .client
            .upload_archive()
            .account_id(ACCOUNT)
            .vault_name(&bound.location.vault)
            .checksum(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        info!(
            uri = %bound.uri,
            length,
            archive_id = output.archive_id().unwrap_or_default(),
            "Glacier archive uploaded"
        );
        // Same credentials as the vault URI, so the archive can be deleted again
        self.uploaded = output.archive_id().map(|id| {
            GlacierLocation::archive_uri(&bound.base, &bound.location.vault, id).to_string()
        });
        Ok(())
    }

    fn location(&self) -> Option<String> {
        self.uploaded.clone()
    }

    async fn delete(&mut self) -> Result<()> {
        let bound = self.bound()?;
        let GlacierResource::Archive(archive_id) = &bound.location.resource else {
            return Err(ProtocolError::invalid_uri(&bound.uri, "only archives can be deleted"));
        };

        let result = bound
            .client
            .delete_archive()
            .account_id(ACCOUNT)
            .vault_name(&bound.location.vault)
            .archive_id(archive_id)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(uri = %bound.uri, "Glacier archive deleted");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .is_some_and(|service| service.is_resource_not_found_exception()) =>
            {
                debug!(uri = %bound.uri, "Glacier archive already absent");
                Ok(())
            }
            Err(e) => Err(sdk_error(&bound.uri, e)),
        }
    }
}

/// Starts archive-retrieval jobs
#[async_trait]
pub trait ArchiveRetriever: Send + Sync {
    /// Request retrieval of `archive`, returning the URI of the job whose
    /// output will hold the archive bytes.
    async fn request_retrieval(&self, archive: &Url) -> Result<Url>;
}

#[derive(Debug, Default, Clone)]
pub struct GlacierRetriever;

#[async_trait]
impl ArchiveRetriever for GlacierRetriever {
    async fn request_retrieval(&self, archive: &Url) -> Result<Url> {
        let uri = redact(archive);
        let location = GlacierLocation::parse(archive)?;
        let GlacierResource::Archive(archive_id) = &location.resource else {
            return Err(ProtocolError::invalid_uri(&uri, "expected an archive URI"));
        };

        let parameters = JobParameters::builder()
            .r#type("archive-retrieval")
            .archive_id(archive_id)
            .build();
        let output = location
            .client()
            .initiate_job()
            .account_id(ACCOUNT)
            .vault_name(&location.vault)
            .job_parameters(parameters)
            .send()
            .await
            .map_err(|e| sdk_error(&uri, e))?;

        let job_id = output
            .job_id()
            .ok_or_else(|| ProtocolError::transport(&uri, "no job id returned"))?;

        let mut job_uri = archive.clone();
        if let Ok(mut segments) = job_uri.path_segments_mut() {
            segments
                .clear()
                .extend(["-", "vaults", location.vault.as_str(), "jobs", job_id]);
        }
        info!(uri, job_id, "Glacier retrieval job started");
        Ok(job_uri)
    }
}

/// Glacier multipart uploads; parts and the archive are verified by tree-hash
#[derive(Debug, Default, Clone)]
pub struct GlacierMultipartTarget;

#[async_trait]
impl MultipartTarget for GlacierMultipartTarget {
    fn part_checksum(&self) -> HashAlgorithm {
        HashAlgorithm::TreeHash
    }

    fn completion_checksum(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::TreeHash)
    }

    async fn begin(&self, destination: &Url, part_size: u64) -> Result<Box<dyn MultipartSession>> {
        let uri = redact(destination);
        let location = GlacierLocation::parse(destination)?;
        if location.resource != GlacierResource::Vault {
            return Err(ProtocolError::invalid_uri(&uri, "uploads target a vault URI"));
        }
        let client = location.client();

        let output = client
            .initiate_multipart_upload()
            .account_id(ACCOUNT)
            .vault_name(&location.vault)
            .part_size(part_size.to_string())
            .send()
            .await
            .map_err(|e| sdk_error(&uri, e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| ProtocolError::transport(&uri, "no upload id returned"))?
            .to_string();

        debug!(uri, upload_id, part_size, "Glacier multipart upload started");
        Ok(Box::new(GlacierSession {
            base: destination.clone(),
            uri,
            location,
            client,
            upload_id,
        }))
    }
}

struct GlacierSession {
    base: Url,
    uri: String,
    location: GlacierLocation,
    client: Client,
    upload_id: String,
}

#[async_trait]
impl MultipartSession for GlacierSession {
    async fn upload_part(&mut self, part: PartUpload) -> Result<String> {
        let length = part.body.len() as u64;
        let range = match length {
            0 => return Err(ProtocolError::transport(&self.uri, "empty multipart part")),
            _ => format!("bytes {}-{}/*", part.offset, part.offset + length - 1),
        };

        let output = self
            .client
            .upload_multipart_part()
            .account_id(ACCOUNT)
            .vault_name(&self.location.vault)
            .upload_id(&self.upload_id)
            .range(range)
            .checksum(&part.checksum)
            .body(ByteStream::from(part.body))
            .send()
            .await
            .map_err(|e| sdk_error(&self.uri, e))?;

        debug!(uri = %self.uri, part = part.number, length, "Glacier part uploaded");
        Ok(output.checksum().map(str::to_string).unwrap_or(part.checksum))
    }

    async fn complete(&mut self, total_length: u64, checksum: Option<String>) -> Result<Option<String>> {
        let checksum = checksum
            .ok_or_else(|| ProtocolError::transport(&self.uri, "archive tree-hash is required"))?;

        let output = self
            .client
            .complete_multipart_upload()
            .account_id(ACCOUNT)
            .vault_name(&self.location.vault)
            .upload_id(&self.upload_id)
            .archive_size(total_length.to_string())
            .checksum(checksum)
            .send()
            .await
            .map_err(|e| sdk_error(&self.uri, e))?;

        info!(uri = %self.uri, total_length, "Glacier multipart upload completed");
        Ok(output
            .archive_id()
            .map(|id| archive_location(&self.base, &self.location.vault, id)))
    }

    async fn abort(&mut self) -> Result<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .account_id(ACCOUNT)
            .vault_name(&self.location.vault)
            .upload_id(&self.upload_id)
            .send()
            .await;

        if let Err(e) = result {
            warn!(uri = %self.uri, error = %DisplayErrorContext(&e), "Failed to abort Glacier upload");
            return Err(sdk_error(&self.uri, e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: &str = "glacier://A:B@glacier.us-west-2.amazonaws.com/-/vaults/media";

    #[tokio::test]
    async fn test_archive_reads_require_retrieval() {
        let mut handler = GlacierHandler::new(ByteSize(1024));
        handler
            .init(&Url::parse(&format!("{}/archives/abc", VAULT)).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            handler.open_stream().await,
            Err(ProtocolError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_content_length_is_unsupported() {
        let mut handler = GlacierHandler::new(ByteSize(1024));
        handler.init(&Url::parse(VAULT).unwrap()).await.unwrap();
        assert!(matches!(
            handler.content_length().await,
            Err(ProtocolError::Unsupported { operation: "content_length", .. })
        ));
    }

    #[tokio::test]
    async fn test_no_location_before_upload() {
        let mut handler = GlacierHandler::new(ByteSize(2));
        handler.init(&Url::parse(VAULT).unwrap()).await.unwrap();
        let _ = handler.copy_to(Box::new(&b"abc"[..]), 3).await;
        assert_eq!(handler.location(), None);
    }

    #[tokio::test]
    async fn test_upload_respects_buffer_limit() {
        let mut handler = GlacierHandler::new(ByteSize(2));
        handler.init(&Url::parse(VAULT).unwrap()).await.unwrap();
        let result = handler.copy_to(Box::new(&b"abc"[..]), 3).await;
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_archive_location_is_redacted() {
        let base = Url::parse(VAULT).unwrap();
        let location = archive_location(&base, "media", "ARCH1");
        assert!(location.ends_with("/-/vaults/media/archives/ARCH1"));
        assert!(!location.contains(":B@"));
    }
}
