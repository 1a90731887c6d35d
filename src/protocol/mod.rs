//! URI-addressed I/O over heterogeneous transports
//!
//! Every tool talks to storage through a [`ProtocolHandler`] obtained from the
//! [`ProtocolHandlerResolver`]. A handler is bound to one URI by `init` and is
//! used for one logical operation.
//!
//! ## Schemes
//!
//! - `file` - local filesystem via `object_store`
//! - `http`, `https` - read-only, via `reqwest`
//! - `ftp` - via `suppaftp`
//! - `sftp` - via `ssh2`
//! - `s3` - via `aws-sdk-s3`; credentials in the URI user-info
//! - `glacier` - via `aws-sdk-glacier`; credentials in the URI user-info

pub mod aws;
mod bridge;
pub mod ftp;
pub mod glacier;
pub mod http;
pub mod multipart;
pub mod object;
mod resolver;
pub mod s3;
pub mod sftp;

pub use multipart::{MultipartSession, MultipartTarget, PartUpload};
pub use resolver::{HandlerFactory, ProtocolHandlerResolver, factory};

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::humanize::ByteSize;
use self::http::HttpConfig;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("protocol handler used before init")]
    NotInitialized,

    #[error("{operation} is not supported for {scheme} URIs")]
    Unsupported {
        scheme: &'static str,
        operation: &'static str,
    },

    #[error("{uri}: {message}")]
    Transport { uri: String, message: String },

    #[error("{uri}: payload of {length} bytes exceeds the {limit} buffer limit")]
    PayloadTooLarge {
        uri: String,
        length: u64,
        limit: ByteSize,
    },

    #[error("{uri}: expected {expected} bytes, source ended after {actual}")]
    ShortRead {
        uri: String,
        expected: u64,
        actual: u64,
    },

    #[error("{uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: io::Error,
    },
}

impl ProtocolError {
    pub fn transport(uri: impl Into<String>, message: impl ToString) -> Self {
        ProtocolError::Transport {
            uri: uri.into(),
            message: message.to_string(),
        }
    }

    pub fn io(uri: impl Into<String>, source: io::Error) -> Self {
        ProtocolError::Io {
            uri: uri.into(),
            source,
        }
    }

    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Raised before any I/O could happen
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnsupportedScheme(_)
                | ProtocolError::InvalidUri { .. }
                | ProtocolError::NotInitialized
                | ProtocolError::Unsupported { .. }
                | ProtocolError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Readable byte stream handed out by [`ProtocolHandler::open_stream`]
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Settings shared by the built-in handlers
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Upper bound for handlers that buffer a whole payload (S3, Glacier)
    pub max_buffer_bytes: ByteSize,
    pub http: HttpConfig,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_buffer_bytes: ByteSize(64 * 1024 * 1024),
            http: HttpConfig::default(),
        }
    }
}

/// Uniform capability set over one URI.
///
/// `init` must succeed before any other call; the remaining operations fail
/// with [`ProtocolError::NotInitialized`] otherwise. Unsupported operations
/// fail with [`ProtocolError::Unsupported`]. Connections are released by
/// `close` or when the handler is dropped.
#[async_trait]
pub trait ProtocolHandler: Send {
    fn scheme(&self) -> &'static str;

    async fn init(&mut self, uri: &Url) -> Result<()>;

    async fn open_stream(&mut self) -> Result<ByteReader> {
        Err(self.unsupported("open_stream"))
    }

    async fn content_length(&mut self) -> Result<u64> {
        Err(self.unsupported("content_length"))
    }

    /// Write exactly `length` bytes from `source` to the bound URI
    async fn copy_to(&mut self, _source: ByteReader, _length: u64) -> Result<()> {
        Err(self.unsupported("copy_to"))
    }

    /// URI of what the last `copy_to` wrote, when it is not the bound URI
    /// itself (a vault upload creates an archive)
    fn location(&self) -> Option<String> {
        None
    }

    /// Remove the bound resource. Removing an absent resource succeeds.
    async fn delete(&mut self) -> Result<()> {
        Err(self.unsupported("delete"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn unsupported(&self, operation: &'static str) -> ProtocolError {
        ProtocolError::Unsupported {
            scheme: self.scheme(),
            operation,
        }
    }
}

/// Read exactly `length` bytes of `source` into memory, refusing payloads
/// above `limit` before reading anything.
pub(crate) async fn buffer_exact(
    uri: &str,
    source: ByteReader,
    length: u64,
    limit: ByteSize,
) -> Result<Vec<u8>> {
    if length > limit.as_u64() {
        return Err(ProtocolError::PayloadTooLarge {
            uri: uri.to_string(),
            length,
            limit,
        });
    }

    let mut buffer = Vec::with_capacity(length as usize);
    source
        .take(length)
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| ProtocolError::io(uri, e))?;

    if (buffer.len() as u64) < length {
        return Err(ProtocolError::ShortRead {
            uri: uri.to_string(),
            expected: length,
            actual: buffer.len() as u64,
        });
    }

    Ok(buffer)
}

/// Read `source` to its end into memory, failing once more than `limit`
/// bytes arrive. For sources that cannot report their length up front.
pub(crate) async fn buffer_to_end(uri: &str, source: ByteReader, limit: ByteSize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    source
        .take(limit.as_u64().saturating_add(1))
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| ProtocolError::io(uri, e))?;

    if buffer.len() as u64 > limit.as_u64() {
        return Err(ProtocolError::PayloadTooLarge {
            uri: uri.to_string(),
            length: buffer.len() as u64,
            limit,
        });
    }
    Ok(buffer)
}

/// URI text fit for logs and status messages: any password is removed
pub fn display_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(parsed) => aws::redact(&parsed),
        Err(_) => uri.to_string(),
    }
}

/// Percent-decoded user-info of a URI as `(user, password)`
pub(crate) fn user_info(uri: &Url) -> (String, Option<String>) {
    let decode = |raw: &str| {
        percent_encoding::percent_decode_str(raw)
            .decode_utf8_lossy()
            .into_owned()
    };
    (decode(uri.username()), uri.password().map(decode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_exact_rejects_oversized_payload() {
        let source: ByteReader = Box::new(&b"0123456789"[..]);
        let result = buffer_exact("s3://b/k", source, 10, ByteSize(4)).await;
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { length: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_buffer_exact_detects_short_source() {
        let source: ByteReader = Box::new(&b"0123"[..]);
        let result = buffer_exact("s3://b/k", source, 10, ByteSize(1024)).await;
        assert!(matches!(
            result,
            Err(ProtocolError::ShortRead { expected: 10, actual: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_buffer_to_end_is_bounded() {
        let data = buffer_to_end("x://y", Box::new(&b"hello"[..]), ByteSize(5)).await.unwrap();
        assert_eq!(data, b"hello");

        let result = buffer_to_end("x://y", Box::new(&b"hello!"[..]), ByteSize(5)).await;
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_buffer_exact_takes_only_length() {
        let source: ByteReader = Box::new(&b"0123456789"[..]);
        let buffer = buffer_exact("s3://b/k", source, 4, ByteSize(1024)).await.unwrap();
        assert_eq!(buffer, b"0123");
    }

    #[test]
    fn test_display_uri_hides_password() {
        let shown = display_uri("s3://AKID:secret@bucket.s3.amazonaws.com/key");
        assert_eq!(shown, "s3://AKID@bucket.s3.amazonaws.com/key");
        assert_eq!(display_uri("file:///tmp/a"), "file:///tmp/a");
    }

    #[test]
    fn test_user_info_is_decoded() {
        let uri = Url::parse("s3://AKID:se%2Fcret%2Bkey@bucket.s3.amazonaws.com/key").unwrap();
        let (user, password) = user_info(&uri);
        assert_eq!(user, "AKID");
        assert_eq!(password.as_deref(), Some("se/cret+key"));
    }
}
