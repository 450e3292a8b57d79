//! Server configuration
//!
//! [`ServerConfig`] is built once through [`ServerConfigBuilder`] and checked
//! in [`ServerConfigBuilder::build`]; per-request code never sees an invalid
//! configuration. A subset can be loaded from TOML via [`FileConfig`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::StatusCode;
use serde::Deserialize;
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::deflate::DeflateOptions;
use crate::error::ConfigError;
use crate::request::UpgradeRequest;

/// Default interface to bind
pub const DEFAULT_HOST: &str = "localhost";

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default maximum message size (100MB)
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Picks the sub-protocol from the client's list, or none
pub type HandleProtocols =
    Arc<dyn Fn(&[String], &UpgradeRequest) -> Option<String> + Send + Sync + 'static>;

/// What a client verification hook gets to look at
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// `Sec-WebSocket-Origin` for version 8 clients, `Origin` otherwise
    pub origin: Option<String>,
    /// Request arrived over TLS
    pub secure: bool,
    pub request: UpgradeRequest,
}

impl ClientInfo {
    pub(crate) fn from_request(request: &UpgradeRequest) -> Self {
        let origin_header = match request.header("sec-websocket-version").map(str::trim) {
            Some("8") => "sec-websocket-origin",
            _ => "origin",
        };

        Self {
            origin: request.header(origin_header).map(String::from),
            secure: request.is_secure(),
            request: request.clone(),
        }
    }
}

/// Outcome of asynchronous client verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject {
        status: StatusCode,
        message: Option<String>,
        headers: Vec<(String, String)>,
    },
}

impl Verdict {
    /// Plain `401 Unauthorized` rejection
    pub fn reject() -> Self {
        Self::reject_with(StatusCode::UNAUTHORIZED)
    }

    /// Rejection with a custom status
    pub fn reject_with(status: StatusCode) -> Self {
        Verdict::Reject {
            status,
            message: None,
            headers: Vec::new(),
        }
    }
}

/// Client verification hook
#[derive(Clone)]
pub enum VerifyClient {
    /// Returns `false` to refuse with 401
    Sync(Arc<dyn Fn(&ClientInfo) -> bool + Send + Sync + 'static>),
    /// Resolves to a [`Verdict`]
    Async(Arc<dyn Fn(ClientInfo) -> BoxFuture<'static, Verdict> + Send + Sync + 'static>),
}

impl VerifyClient {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&ClientInfo) -> bool + Send + Sync + 'static,
    {
        VerifyClient::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        VerifyClient::Async(Arc::new(move |info| f(info).boxed()))
    }

    pub(crate) async fn verify(&self, info: ClientInfo) -> Verdict {
        match self {
            VerifyClient::Sync(f) => {
                if f(&info) {
                    Verdict::Accept
                } else {
                    Verdict::reject()
                }
            }
            VerifyClient::Async(f) => f(info).await,
        }
    }
}

impl fmt::Debug for VerifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyClient::Sync(_) => f.write_str("VerifyClient::Sync(..)"),
            VerifyClient::Async(_) => f.write_str("VerifyClient::Async(..)"),
        }
    }
}

struct SharedInner {
    listener: TcpListener,
    claimed: AtomicBool,
}

/// Externally owned listening socket
///
/// Clones refer to the same socket. Only one server may serve from it at
/// a time.
#[derive(Clone)]
pub struct SharedListener {
    inner: Arc<SharedInner>,
}

impl SharedListener {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                listener,
                claimed: AtomicBool::new(false),
            }),
        }
    }

    /// Bind a new listener to share
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// True while a server is serving from this socket
    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn claim(&self) -> Result<ListenerClaim, ConfigError> {
        self.inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConfigError::ServerAlreadyClaimed)?;
        Ok(ListenerClaim {
            shared: self.clone(),
        })
    }
}

impl fmt::Debug for SharedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedListener")
            .field("local_addr", &self.local_addr().ok())
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

/// Exclusive use of a [`SharedListener`], released on drop
pub(crate) struct ListenerClaim {
    shared: SharedListener,
}

impl ListenerClaim {
    pub(crate) fn listener(&self) -> &TcpListener {
        &self.shared.inner.listener
    }
}

impl Drop for ListenerClaim {
    fn drop(&mut self) {
        self.shared.inner.claimed.store(false, Ordering::Release);
    }
}

/// Where the server accepts connections from
#[derive(Debug, Clone)]
pub enum ListenSource {
    /// Bind `host:port` ourselves
    Port(u16),
    /// Serve from a listener owned by the caller
    Server(SharedListener),
}

/// Upgrade server configuration
///
/// # Example
///
/// ```
/// use mihan_ws::config::ServerConfig;
/// use mihan_ws::deflate::{DeflateOptions, MaxWindowBits};
///
/// let config = ServerConfig::builder()
///     .port(8080)
///     .path("/ws")
///     .per_message_deflate(DeflateOptions {
///         server_max_window_bits: MaxWindowBits::Bits(10),
///         ..DeflateOptions::default()
///     })
///     .build()
///     .unwrap();
/// assert_eq!(config.backlog, 128);
/// ```
#[derive(Clone)]
pub struct ServerConfig {
    /// Interface to bind when listening on a port (default: "localhost")
    pub host: String,
    pub listen: ListenSource,
    /// Listen backlog for a bound port (default: 128)
    pub backlog: u32,
    /// Only accept upgrades for this exact path
    pub path: Option<String>,
    /// Maximum message size (default: 100MB)
    pub max_payload: usize,
    /// permessage-deflate policy, `None` disables the extension
    pub per_message_deflate: Option<DeflateOptions>,
    pub handle_protocols: Option<HandleProtocols>,
    pub verify_client: Option<VerifyClient>,
    /// Bound on reading the request head plus the upgrade
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        FileConfig::from_file(path)?.into_builder().build()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        FileConfig::from_toml_str(s)?.into_builder().build()
    }

    /// True when the server binds its own socket
    pub fn owns_listener(&self) -> bool {
        matches!(self.listen, ListenSource::Port(_))
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("listen", &self.listen)
            .field("backlog", &self.backlog)
            .field("path", &self.path)
            .field("max_payload", &self.max_payload)
            .field("per_message_deflate", &self.per_message_deflate)
            .field("handle_protocols", &self.handle_protocols.is_some())
            .field("verify_client", &self.verify_client)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Builder for [`ServerConfig`]
#[derive(Clone)]
pub struct ServerConfigBuilder {
    host: String,
    port: Option<u16>,
    server: Option<SharedListener>,
    backlog: u32,
    path: Option<String>,
    max_payload: usize,
    per_message_deflate: Option<DeflateOptions>,
    handle_protocols: Option<HandleProtocols>,
    verify_client: Option<VerifyClient>,
    handshake_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            server: None,
            backlog: DEFAULT_BACKLOG,
            path: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            per_message_deflate: Some(DeflateOptions::default()),
            handle_protocols: None,
            verify_client: None,
            handshake_timeout: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Listen on a port (0 picks a free one)
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Serve from an externally owned listener
    pub fn server(mut self, listener: SharedListener) -> Self {
        self.server = Some(listener);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Only accept upgrades for this exact path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn max_payload(mut self, size: usize) -> Self {
        self.max_payload = size;
        self
    }

    /// Enable permessage-deflate with the given policy
    pub fn per_message_deflate(mut self, options: DeflateOptions) -> Self {
        self.per_message_deflate = Some(options);
        self
    }

    /// Never negotiate permessage-deflate
    pub fn disable_per_message_deflate(mut self) -> Self {
        self.per_message_deflate = None;
        self
    }

    pub fn handle_protocols<F>(mut self, f: F) -> Self
    where
        F: Fn(&[String], &UpgradeRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.handle_protocols = Some(Arc::new(f));
        self
    }

    /// Synchronous client verification, `false` refuses with 401
    pub fn verify_client<F>(mut self, f: F) -> Self
    where
        F: Fn(&ClientInfo) -> bool + Send + Sync + 'static,
    {
        self.verify_client = Some(VerifyClient::sync(f));
        self
    }

    /// Asynchronous client verification
    pub fn verify_client_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        self.verify_client = Some(VerifyClient::from_async(f));
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let listen = match (self.port, self.server) {
            (Some(port), None) => ListenSource::Port(port),
            (None, Some(server)) => ListenSource::Server(server),
            (None, None) => return Err(ConfigError::MissingListenSource),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingListenSource),
        };

        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidPath(path.clone()));
            }
        }

        if let Some(options) = &self.per_message_deflate {
            options.validate()?;
        }

        Ok(ServerConfig {
            host: self.host,
            listen,
            backlog: self.backlog,
            path: self.path,
            max_payload: self.max_payload,
            per_message_deflate: self.per_message_deflate,
            handle_protocols: self.handle_protocols,
            verify_client: self.verify_client,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `per_message_deflate` as written in a file: `false` or a table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DeflateSetting {
    Enabled(bool),
    Options(DeflateOptions),
}

impl Default for DeflateSetting {
    fn default() -> Self {
        DeflateSetting::Enabled(true)
    }
}

/// File-backed configuration
///
/// Hooks and external listeners only exist in code, so a file covers the
/// remaining options.
///
/// ```toml
/// host = "0.0.0.0"
/// port = 8080
/// path = "/ws"
/// handshake_timeout_ms = 5000
///
/// [per_message_deflate]
/// server_max_window_bits = 10
/// client_max_window_bits = true
/// concurrency = 4
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: String,
    pub port: Option<u16>,
    pub backlog: u32,
    pub path: Option<String>,
    pub max_payload: usize,
    per_message_deflate: DeflateSetting,
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            backlog: DEFAULT_BACKLOG,
            path: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            per_message_deflate: DeflateSetting::default(),
            handshake_timeout_ms: None,
        }
    }
}

impl FileConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// permessage-deflate policy, `None` when disabled
    pub fn per_message_deflate(&self) -> Option<DeflateOptions> {
        match &self.per_message_deflate {
            DeflateSetting::Enabled(true) => Some(DeflateOptions::default()),
            DeflateSetting::Enabled(false) => None,
            DeflateSetting::Options(options) => Some(options.clone()),
        }
    }

    /// Builder seeded from this file, for further overrides in code
    pub fn into_builder(self) -> ServerConfigBuilder {
        let per_message_deflate = self.per_message_deflate();
        let mut builder = ServerConfigBuilder {
            host: self.host,
            port: self.port,
            backlog: self.backlog,
            path: self.path,
            max_payload: self.max_payload,
            per_message_deflate,
            ..ServerConfigBuilder::new()
        };
        if let Some(ms) = self.handshake_timeout_ms {
            builder = builder.handshake_timeout(Duration::from_millis(ms));
        }
        builder
    }
}
