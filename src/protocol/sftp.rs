//! SFTP handler over the blocking `ssh2` client

use async_trait::async_trait;
use ssh2::{ErrorCode, Session, Sftp};
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use super::bridge::{pump_into_blocking, spawn_reader};
use super::{ByteReader, ProtocolError, ProtocolHandler, Result, user_info};

const DEFAULT_PORT: u16 = 22;
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone)]
struct SftpTarget {
    uri: String,
    address: String,
    user: String,
    password: Option<String>,
    path: PathBuf,
}

impl SftpTarget {
    fn parse(uri: &Url) -> Result<Self> {
        let host = uri
            .host_str()
            .ok_or_else(|| ProtocolError::invalid_uri(uri.as_str(), "missing host"))?;
        let (user, password) = user_info(uri);
        if user.is_empty() {
            return Err(ProtocolError::invalid_uri(uri.as_str(), "missing user name"));
        }
        let path = percent_encoding::percent_decode_str(uri.path())
            .decode_utf8_lossy()
            .into_owned();
        if path.is_empty() || path == "/" {
            return Err(ProtocolError::invalid_uri(uri.as_str(), "missing path"));
        }

        Ok(Self {
            uri: uri.to_string(),
            address: format!("{}:{}", host, uri.port().unwrap_or(DEFAULT_PORT)),
            user,
            password,
            path: PathBuf::from(path),
        })
    }

    /// Authenticated SFTP channel; password if given, else the SSH agent
    fn connect(&self) -> io::Result<(Session, Sftp)> {
        let tcp = TcpStream::connect(&self.address)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        match &self.password {
            Some(password) => session.userauth_password(&self.user, password)?,
            None => session.userauth_agent(&self.user)?,
        }
        let sftp = session.sftp()?;
        Ok((session, sftp))
    }
}

fn is_missing(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

#[derive(Default)]
pub struct SftpHandler {
    target: Option<SftpTarget>,
}

impl SftpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self) -> Result<SftpTarget> {
        self.target.clone().ok_or(ProtocolError::NotInitialized)
    }

    async fn run<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&Sftp, &Path) -> std::result::Result<T, ssh2::Error> + Send + 'static,
        T: Send + 'static,
    {
        let target = self.target()?;
        let uri = target.uri.clone();

        tokio::task::spawn_blocking(move || {
            let (_session, sftp) = target.connect()?;
            operation(&sftp, &target.path).map_err(io::Error::from)
        })
        .await
        .map_err(|e| ProtocolError::transport(&uri, e))?
        .map_err(|e| ProtocolError::transport(&uri, e))
    }
}

#[async_trait]
impl ProtocolHandler for SftpHandler {
    fn scheme(&self) -> &'static str {
        "sftp"
    }

    async fn init(&mut self, uri: &Url) -> Result<()> {
        if uri.scheme() != "sftp" {
            return Err(ProtocolError::UnsupportedScheme(uri.scheme().to_string()));
        }
        self.target = Some(SftpTarget::parse(uri)?);
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<ByteReader> {
        let target = self.target()?;
        let uri = target.uri.clone();

        spawn_reader(move |sink| {
            let (_session, sftp) = target.connect()?;
            let mut file = sftp.open(&target.path).map_err(io::Error::from)?;
            sink.forward(&mut file)?;
            Ok(())
        })
        .await
        .map_err(|e| ProtocolError::io(uri, e))
    }

    async fn content_length(&mut self) -> Result<u64> {
        let uri = self.target()?.uri;
        self.run(|sftp, path| sftp.stat(path).map(|stat| stat.size))
            .await?
            .ok_or_else(|| ProtocolError::transport(uri, "server did not report a size"))
    }

    async fn copy_to(&mut self, source: ByteReader, length: u64) -> Result<()> {
        let target = self.target()?;
        let uri = target.uri.clone();

        let written = pump_into_blocking(source, length, move |reader| {
            let (_session, sftp) = target.connect()?;
            let mut file = sftp.create(&target.path).map_err(io::Error::from)?;
            io::copy(reader, &mut file)
        })
        .await
        .map_err(|e| ProtocolError::io(&uri, e))?;

        debug!(uri, written, "SFTP upload finished");
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.run(|sftp, path| match sftp.unlink(path) {
            Err(e) if is_missing(&e) => Ok(()),
            other => other,
        })
        .await
    }
}
