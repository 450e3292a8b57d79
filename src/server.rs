//! WebSocket upgrade server
//!
//! [`WebSocketServer`] accepts TCP connections, reads the request head,
//! runs the [`Upgrader`] and passes each upgraded [`Connection`] to a
//! handler task. A failed handshake only ends its own connection.
//!
//! # Example
//!
//! ```no_run
//! use mihan_ws::prelude::*;
//!
//! # async fn run() -> mihan_ws::Result<()> {
//! let config = ServerConfig::builder().port(8080).path("/ws").build()?;
//! let server = WebSocketServer::bind(config).await?;
//!
//! server
//!     .serve(|conn, req| async move {
//!         println!("{} upgraded, compressed: {}", req.path(), conn.is_compressed());
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ListenSource, ListenerClaim, ServerConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake;
use crate::request::UpgradeRequest;
use crate::upgrade::{HandshakeSocket, Upgrader};

enum Listener {
    Owned(TcpListener),
    Shared(ListenerClaim),
}

impl Listener {
    fn get(&self) -> &TcpListener {
        match self {
            Listener::Owned(listener) => listener,
            Listener::Shared(claim) => claim.listener(),
        }
    }
}

/// HTTP/1.1 WebSocket upgrade server
pub struct WebSocketServer {
    upgrader: Upgrader,
    listener: Listener,
    local_addr: SocketAddr,
}

impl WebSocketServer {
    /// Bind the configured port, or claim the configured listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = match &config.listen {
            ListenSource::Port(port) => {
                let addr = tokio::net::lookup_host((config.host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("could not resolve {}", config.host),
                        )
                    })?;
                Listener::Owned(bind_listener(addr, config.backlog)?)
            }
            ListenSource::Server(shared) => Listener::Shared(shared.claim()?),
        };

        let local_addr = listener.get().local_addr()?;
        info!(addr = %local_addr, path = ?config.path, "listening");

        Ok(Self {
            upgrader: Upgrader::new(Arc::new(config)),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        self.upgrader.config()
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    /// Number of live upgraded connections
    pub fn connections(&self) -> usize {
        self.upgrader.registry().len()
    }

    /// Accept and upgrade connections until the task is dropped
    pub async fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Connection<TcpStream>, UpgradeRequest) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.serve_with_shutdown(handler, std::future::pending())
            .await
    }

    /// Accept and upgrade connections until `shutdown` resolves
    ///
    /// Connections already handed to `handler` keep running.
    pub async fn serve_with_shutdown<F, Fut, Sig>(&self, handler: F, shutdown: Sig) -> Result<()>
    where
        F: Fn(Connection<TcpStream>, UpgradeRequest) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        Sig: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "server stopped accepting");
                    return Ok(());
                }
                accepted = self.listener.get().accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            // TCP_NODELAY - disable Nagle's algorithm for low latency
            stream.set_nodelay(true).ok();

            let upgrader = self.upgrader.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                match handle_stream(&upgrader, stream, Some(peer), false).await {
                    Ok((conn, req)) => handler(conn, req).await,
                    Err(e) => debug!(peer = %peer, error = %e, "connection closed before upgrade"),
                }
            });
        }
    }

    /// Run the handshake on an already accepted stream (TLS or otherwise)
    pub async fn accept<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
        secure: bool,
    ) -> Result<(Connection<S>, UpgradeRequest)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        handle_stream(&self.upgrader, stream, peer, secure).await
    }
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.local_addr)
            .field("upgrader", &self.upgrader)
            .finish()
    }
}

/// Read the request head and upgrade the stream
async fn handle_stream<S>(
    upgrader: &Upgrader,
    mut stream: S,
    peer: Option<SocketAddr>,
    secure: bool,
) -> Result<(Connection<S>, UpgradeRequest)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = upgrader.config();
    let deadline = config.handshake_timeout.map(|t| Instant::now() + t);

    let read = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, handshake::read_request(&mut stream))
            .await
            .unwrap_or(Err(Error::Timeout)),
        None => handshake::read_request(&mut stream).await,
    };

    let (request, head) = match read {
        Ok(read) => read,
        Err(e @ (Error::ConnectionClosed | Error::ConnectionReset | Error::Io(_))) => return Err(e),
        Err(e) => {
            warn!(peer = ?peer, status = e.status().as_u16(), error = %e, "rejecting request");
            HandshakeSocket::new(&mut stream)
                .abort(e.status(), None, &[])
                .await;
            return Err(e);
        }
    };

    let mut request = request.with_secure(secure);
    if let Some(peer) = peer {
        request = request.with_peer_addr(peer);
    }

    if config.owns_listener() && !request.wants_upgrade() {
        debug!(peer = ?peer, path = request.path(), "plain HTTP request");
        stream
            .write_all(&handshake::build_upgrade_required_response())
            .await?;
        let _ = stream.shutdown().await;
        return Err(Error::HandshakeRejected {
            status: StatusCode::UPGRADE_REQUIRED,
            reason: "upgrade required",
        });
    }

    let upgrade = upgrader.upgrade(&request, stream, head);
    let connection = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, upgrade)
            .await
            .map_err(|_| Error::Timeout)??,
        None => upgrade.await?,
    };

    Ok((connection, request))
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    TcpListener::from_std(socket.into())
}
