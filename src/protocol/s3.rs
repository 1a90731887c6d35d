//! Amazon S3 handler and multipart target

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, warn};
use url::Url;

use super::aws::{S3Location, redact};
use super::multipart::{MultipartSession, MultipartTarget, PartUpload};
use super::{ByteReader, ProtocolError, ProtocolHandler, Result, buffer_exact};
use crate::hash::{HashAlgorithm, HashEngine, HashStrategy};
use crate::humanize::ByteSize;

fn sdk_error<E: std::error::Error>(uri: &str, error: E) -> ProtocolError {
    ProtocolError::transport(uri, DisplayErrorContext(error))
}

/// Content-MD5 and base64 SHA-256 checksum of a buffered body, in one pass
async fn upload_checksums(uri: &str, body: &[u8]) -> Result<(String, String)> {
    let strategies = [
        HashStrategy::whole(HashAlgorithm::Md5Base64),
        HashStrategy::whole(HashAlgorithm::Sha256),
    ];
    let mut reader = body;
    let hashes = HashEngine::default()
        .digest(&mut reader, &strategies)
        .await
        .map_err(|e| ProtocolError::transport(uri, e))?;

    let mut values = hashes.into_iter().map(|hash| hash.hash);
    let (Some(content_md5), Some(sha256)) = (values.next(), values.next()) else {
        return Err(ProtocolError::transport(uri, "missing upload checksum"));
    };
    let sha256 = hex::decode(&sha256)
        .map(|raw| BASE64.encode(raw))
        .map_err(|e| ProtocolError::transport(uri, e))?;
    Ok((content_md5, sha256))
}

struct Bound {
    uri: String,
    location: S3Location,
    client: Client,
}

/// Single-object S3 access. Writes are buffered in memory up to the
/// configured limit; larger payloads go through [`S3MultipartTarget`].
pub struct S3Handler {
    limit: ByteSize,
    bound: Option<Bound>,
}

impl S3Handler {
    pub fn new(limit: ByteSize) -> Self {
        Self { limit, bound: None }
    }

    fn bound(&self) -> Result<&Bound> {
        self.bound.as_ref().ok_or(ProtocolError::NotInitialized)
    }
}

#[async_trait]
impl ProtocolHandler for S3Handler {
    fn scheme(&self) -> &'static str {
        "s3"
    }

    async fn init(&mut self, uri: &Url) -> Result<()> {
        if uri.scheme() != "s3" {
            return Err(ProtocolError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let location = S3Location::parse(uri)?;
        let client = location.client();
        self.bound = Some(Bound {
            uri: redact(uri),
            location,
            client,
        });
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<ByteReader> {
        let bound = self.bound()?;
        let output = bound
            .client
            .get_object()
            .bucket(&bound.location.bucket)
            .key(&bound.location.key)
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn content_length(&mut self) -> Result<u64> {
        let bound = self.bound()?;
        let output = bound
            .client
            .head_object()
            .bucket(&bound.location.bucket)
            .key(&bound.location.key)
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        output
            .content_length()
            .and_then(|length| u64::try_from(length).ok())
            .ok_or_else(|| ProtocolError::transport(&bound.uri, "no content length reported"))
    }

    async fn copy_to(&mut self, source: ByteReader, length: u64) -> Result<()> {
        let limit = self.limit;
        let bound = self.bound()?;
        let body = buffer_exact(&bound.uri, source, length, limit).await?;
        let (content_md5, checksum_sha256) = upload_checksums(&bound.uri, &body).await?;

        bound
            .client
            .put_object()
            .bucket(&bound.location.bucket)
            .key(&bound.location.key)
            .content_length(length as i64)
            .content_md5(content_md5)
            .checksum_sha256(checksum_sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;

        info!(uri = %bound.uri, length, "S3 object written");
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let bound = self.bound()?;
        // DeleteObject succeeds for absent keys
        bound
            .client
            .delete_object()
            .bucket(&bound.location.bucket)
            .key(&bound.location.key)
            .send()
            .await
            .map_err(|e| sdk_error(&bound.uri, e))?;
        debug!(uri = %bound.uri, "S3 object deleted");
        Ok(())
    }
}

/// S3 multipart uploads; parts are verified by their Content-MD5
#[derive(Debug, Default, Clone)]
pub struct S3MultipartTarget;

#[async_trait]
impl MultipartTarget for S3MultipartTarget {
    fn part_checksum(&self) -> HashAlgorithm {
        HashAlgorithm::Md5Base64
    }

    async fn begin(&self, destination: &Url, _part_size: u64) -> Result<Box<dyn MultipartSession>> {
        let uri = redact(destination);
        let location = S3Location::parse(destination)?;
        let client = location.client();

        let output = client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| sdk_error(&uri, e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| ProtocolError::transport(&uri, "no upload id returned"))?
            .to_string();

        debug!(uri, upload_id, "S3 multipart upload started");
        Ok(Box::new(S3Session {
            uri,
            location,
            client,
            upload_id,
            parts: Vec::new(),
        }))
    }
}

struct S3Session {
    uri: String,
    location: S3Location,
    client: Client,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

#[async_trait]
impl MultipartSession for S3Session {
    async fn upload_part(&mut self, part: PartUpload) -> Result<String> {
        let length = part.body.len();
        let output = self
            .client
            .upload_part()
            .bucket(&self.location.bucket)
            .key(&self.location.key)
            .upload_id(&self.upload_id)
            .part_number(part.number as i32)
            .content_length(length as i64)
            .content_md5(part.checksum)
            .body(ByteStream::from(part.body))
            .send()
            .await
            .map_err(|e| sdk_error(&self.uri, e))?;

        let e_tag = output
            .e_tag()
            .ok_or_else(|| ProtocolError::transport(&self.uri, "part receipt has no ETag"))?
            .to_string();

        self.parts.push(
            CompletedPart::builder()
                .part_number(part.number as i32)
                .e_tag(&e_tag)
                .build(),
        );
        debug!(uri = %self.uri, part = part.number, length, "S3 part uploaded");
        Ok(e_tag)
    }

    async fn complete(&mut self, total_length: u64, _checksum: Option<String>) -> Result<Option<String>> {
        self.parts.sort_by_key(|part| part.part_number());
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.location.bucket)
            .key(&self.location.key)
            .upload_id(&self.upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| sdk_error(&self.uri, e))?;

        info!(uri = %self.uri, total_length, "S3 multipart upload completed");
        Ok(output.location().map(str::to_string))
    }

    async fn abort(&mut self) -> Result<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.location.bucket)
            .key(&self.location.key)
            .upload_id(&self.upload_id)
            .send()
            .await;

        if let Err(e) = result {
            warn!(uri = %self.uri, error = %DisplayErrorContext(&e), "Failed to abort S3 upload");
            return Err(sdk_error(&self.uri, e));
        }
        Ok(())
    }
}
