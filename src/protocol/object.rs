//! `object_store`-backed handler: local files, and any keyed store in tests

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StoragePath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

use super::{ByteReader, ProtocolError, ProtocolHandler, Result};

const WRITE_BUFFER: usize = 64 * 1024;
const MAX_INFLIGHT_PARTS: usize = 4;

type Locator = fn(&Url) -> Result<StoragePath>;

/// Handler over any [`ObjectStore`].
///
/// The `file` scheme maps absolute paths onto [`LocalFileSystem`]; keyed
/// stores map `scheme://host/path` to the key `host/path`.
pub struct ObjectStoreHandler {
    scheme: &'static str,
    store: Arc<dyn ObjectStore>,
    locate: Locator,
    target: Option<(String, StoragePath)>,
}

impl ObjectStoreHandler {
    /// Local filesystem handler for `file://` URIs
    pub fn local() -> Self {
        Self {
            scheme: "file",
            store: Arc::new(LocalFileSystem::new()),
            locate: locate_file,
            target: None,
        }
    }

    /// Handler over a shared store keyed by `host/path`
    pub fn keyed(scheme: &'static str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            scheme,
            store,
            locate: locate_key,
            target: None,
        }
    }

    fn target(&self) -> Result<(&str, &StoragePath)> {
        self.target
            .as_ref()
            .map(|(uri, path)| (uri.as_str(), path))
            .ok_or(ProtocolError::NotInitialized)
    }
}

fn locate_file(uri: &Url) -> Result<StoragePath> {
    let path = uri
        .to_file_path()
        .map_err(|_| ProtocolError::invalid_uri(uri.as_str(), "not an absolute file path"))?;
    StoragePath::from_absolute_path(&path)
        .map_err(|e| ProtocolError::invalid_uri(uri.as_str(), e.to_string()))
}

fn locate_key(uri: &Url) -> Result<StoragePath> {
    let host = uri
        .host_str()
        .ok_or_else(|| ProtocolError::invalid_uri(uri.as_str(), "missing host"))?;
    let key = format!("{}{}", host, uri.path());
    StoragePath::parse(key.trim_end_matches('/'))
        .map_err(|e| ProtocolError::invalid_uri(uri.as_str(), e.to_string()))
}

fn store_error(uri: &str, error: object_store::Error) -> ProtocolError {
    ProtocolError::transport(uri, error)
}

/// Stream up to `length` bytes into the multipart writer, returning the
/// number actually written.
async fn write_parts(writer: &mut WriteMultipart, source: ByteReader, length: u64) -> io::Result<u64> {
    let mut source = source.take(length);
    let mut buffer = vec![0u8; WRITE_BUFFER];
    let mut written = 0u64;

    loop {
        let read = source.read(&mut buffer).await?;
        if read == 0 {
            return Ok(written);
        }
        writer
            .wait_for_capacity(MAX_INFLIGHT_PARTS)
            .await
            .map_err(io::Error::other)?;
        writer.write(&buffer[..read]);
        written += read as u64;
    }
}

#[async_trait]
impl ProtocolHandler for ObjectStoreHandler {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn init(&mut self, uri: &Url) -> Result<()> {
        if !uri.scheme().eq_ignore_ascii_case(self.scheme) {
            return Err(ProtocolError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let path = (self.locate)(uri)?;
        self.target = Some((uri.to_string(), path));
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<ByteReader> {
        let (uri, path) = self.target()?;
        let result = self
            .store
            .get(path)
            .await
            .map_err(|e| store_error(uri, e))?;

        let stream = result.into_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn content_length(&mut self) -> Result<u64> {
        let (uri, path) = self.target()?;
        let meta = self
            .store
            .head(path)
            .await
            .map_err(|e| store_error(uri, e))?;
        Ok(meta.size)
    }

    async fn copy_to(&mut self, source: ByteReader, length: u64) -> Result<()> {
        let (uri, path) = self.target()?;

        if length == 0 {
            self.store
                .put(path, PutPayload::default())
                .await
                .map_err(|e| store_error(uri, e))?;
            return Ok(());
        }

        let upload = self
            .store
            .put_multipart(path)
            .await
            .map_err(|e| store_error(uri, e))?;
        let mut writer = WriteMultipart::new(upload);

        match write_parts(&mut writer, source, length).await {
            Ok(written) if written == length => {
                writer.finish().await.map_err(|e| store_error(uri, e))?;
                info!(uri, length, "Object written");
                Ok(())
            }
            Ok(written) => {
                let _ = writer.abort().await;
                Err(ProtocolError::ShortRead {
                    uri: uri.to_string(),
                    expected: length,
                    actual: written,
                })
            }
            Err(e) => {
                let _ = writer.abort().await;
                Err(ProtocolError::io(uri, e))
            }
        }
    }

    async fn delete(&mut self) -> Result<()> {
        let (uri, path) = self.target()?;
        match self.store.delete(path).await {
            Ok(()) => {
                debug!(uri, "Object deleted");
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => {
                debug!(uri, "Object already absent");
                Ok(())
            }
            Err(e) => Err(store_error(uri, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_round_trip_and_idempotent_delete() {
        let dir = TempDir::new().unwrap();
        let uri = Url::from_file_path(dir.path().join("nested/clip.mov")).unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        let mut handler = ObjectStoreHandler::local();
        handler.init(&uri).await.unwrap();
        handler
            .copy_to(Box::new(std::io::Cursor::new(data.clone())), data.len() as u64)
            .await
            .unwrap();

        assert_eq!(handler.content_length().await.unwrap(), 300_000);

        let mut read_back = Vec::new();
        handler
            .open_stream()
            .await
            .unwrap()
            .read_to_end(&mut read_back)
            .await
            .unwrap();
        assert_eq!(read_back, data);

        handler.delete().await.unwrap();
        handler.delete().await.unwrap();
        assert!(!dir.path().join("nested/clip.mov").exists());
    }

    #[tokio::test]
    async fn test_short_source_aborts_write() {
        let store = Arc::new(InMemory::new());
        let uri = Url::parse("mem://bucket/short.bin").unwrap();

        let mut handler = ObjectStoreHandler::keyed("mem", store.clone());
        handler.init(&uri).await.unwrap();
        let result = handler.copy_to(Box::new(&b"abc"[..]), 10).await;

        assert!(matches!(
            result,
            Err(ProtocolError::ShortRead { expected: 10, actual: 3, .. })
        ));
        assert!(store.head(&StoragePath::from("bucket/short.bin")).await.is_err());
    }

    #[tokio::test]
    async fn test_keyed_store_uses_host_and_path() {
        let store = Arc::new(InMemory::new());
        let mut handler = ObjectStoreHandler::keyed("mem", store.clone());
        handler
            .init(&Url::parse("mem://bucket/a/b.txt").unwrap())
            .await
            .unwrap();
        handler.copy_to(Box::new(&b"hello"[..]), 5).await.unwrap();

        let meta = store.head(&StoragePath::from("bucket/a/b.txt")).await.unwrap();
        assert_eq!(meta.size, 5);
    }

    #[tokio::test]
    async fn test_foreign_scheme_is_rejected() {
        let mut handler = ObjectStoreHandler::local();
        let result = handler.init(&Url::parse("http://host/x").unwrap()).await;
        assert!(matches!(result, Err(ProtocolError::UnsupportedScheme(_))));
    }
}
