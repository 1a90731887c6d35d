use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::aws::redact;
use super::ftp::FtpHandler;
use super::glacier::GlacierHandler;
use super::http::HttpHandler;
use super::object::ObjectStoreHandler;
use super::s3::S3Handler;
use super::sftp::SftpHandler;
use super::{ProtocolError, ProtocolHandler, ProtocolSettings, Result};

/// Builds a fresh, unbound handler
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ProtocolHandler> + Send + Sync>;

/// Wrap a handler constructor as a [`HandlerFactory`]
pub fn factory<H, F>(make: F) -> HandlerFactory
where
    H: ProtocolHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || -> Box<dyn ProtocolHandler> { Box::new(make()) })
}

/// Registry mapping URI schemes to handler factories
#[derive(Clone)]
pub struct ProtocolHandlerResolver {
    factories: BTreeMap<String, HandlerFactory>,
}

impl ProtocolHandlerResolver {
    /// Empty resolver; see [`ProtocolHandlerResolver::with_defaults`]
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory for `scheme` (case-insensitive), replacing any
    /// previous registration.
    pub fn register(&mut self, scheme: &str, factory: HandlerFactory) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Resolver with every built-in scheme registered
    pub fn with_defaults(settings: &ProtocolSettings) -> Result<Self> {
        let mut resolver = Self::new();

        resolver.register("file", factory(ObjectStoreHandler::local));

        let client = settings.http.build_client()?;
        let http_config = settings.http.clone();
        for scheme in ["http", "https"] {
            let client = client.clone();
            let http_config = http_config.clone();
            resolver.register(
                scheme,
                factory(move || HttpHandler::new(client.clone(), http_config.clone())),
            );
        }

        resolver.register("ftp", factory(FtpHandler::new));
        resolver.register("sftp", factory(SftpHandler::new));

        let limit = settings.max_buffer_bytes;
        resolver.register("s3", factory(move || S3Handler::new(limit)));
        resolver.register("glacier", factory(move || GlacierHandler::new(limit)));

        Ok(resolver)
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Unbound handler for the URI's scheme
    pub fn create(&self, uri: &Url) -> Result<Box<dyn ProtocolHandler>> {
        let scheme = uri.scheme().to_ascii_lowercase();
        let factory = self
            .factories
            .get(&scheme)
            .ok_or_else(|| ProtocolError::UnsupportedScheme(scheme.clone()))?;
        Ok(factory())
    }

    /// Handler bound to `uri`, ready for use
    pub async fn resolve(&self, uri: &Url) -> Result<Box<dyn ProtocolHandler>> {
        let mut handler = self.create(uri)?;
        handler.init(uri).await?;
        debug!(scheme = handler.scheme(), uri = %redact(uri), "Protocol handler initialised");
        Ok(handler)
    }

    /// Parse and resolve a URI string
    pub async fn resolve_str(&self, uri: &str) -> Result<Box<dyn ProtocolHandler>> {
        let parsed = Url::parse(uri).map_err(|e| ProtocolError::invalid_uri(uri, e.to_string()))?;
        self.resolve(&parsed).await
    }
}

impl Default for ProtocolHandlerResolver {
    fn default() -> Self {
        Self::new()
    }
}
