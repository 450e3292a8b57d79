//! Upgrade coordination
//!
//! [`Upgrader`] drives one upgrade attempt through
//! `Received -> Validated -> Negotiated -> Completed`, or to `Aborted` on the
//! first failed check. The transport stays inside a [`HandshakeSocket`]
//! until the 101 response is written, so every failure path releases it
//! exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::{ClientInfo, ServerConfig, Verdict};
use crate::connection::{Connection, ConnectionInfo, ConnectionRegistry};
use crate::deflate::{self, Negotiation, PerMessageDeflate};
use crate::error::{Error, Result};
use crate::extension;
use crate::handshake;
use crate::limiter::Limiter;
use crate::request::UpgradeRequest;

/// Progress of one upgrade attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Received,
    Validated,
    Negotiated,
    Completed,
    Aborted,
}

/// Transport guard for the duration of a handshake
///
/// Owns the stream until it is either handed off with
/// [`HandshakeSocket::into_inner`] or destroyed. Once destroyed, nothing is
/// written to it again.
#[derive(Debug)]
pub struct HandshakeSocket<S> {
    stream: Option<S>,
}

impl<S> HandshakeSocket<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.stream.is_none()
    }

    /// Write the whole buffer, destroying the transport on failure
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let result = match stream.write_all(buf).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.destroy();
            return Err(e.into());
        }
        Ok(())
    }

    /// Refuse the handshake with an HTTP error and destroy the transport
    ///
    /// Does nothing if the transport is already gone. Write errors are
    /// swallowed since the transport is being torn down anyway.
    pub async fn abort(
        &mut self,
        status: StatusCode,
        message: Option<&str>,
        headers: &[(String, String)],
    ) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        let response = handshake::build_error_response(status, message, headers);
        if let Err(e) = stream.write_all(&response).await {
            debug!(error = %e, "failed to write handshake error response");
        }
        let _ = stream.shutdown().await;
    }

    /// Drop the transport without writing anything
    pub fn destroy(&mut self) {
        self.stream = None;
    }

    /// Hand the transport off, `None` if it was destroyed
    pub fn into_inner(mut self) -> Option<S> {
        self.stream.take()
    }
}

/// Turns validated upgrade requests into [`Connection`]s
///
/// Cheap to clone; all clones share the compression limiter and the
/// connection registry.
#[derive(Clone)]
pub struct Upgrader {
    config: Arc<ServerConfig>,
    limiter: Limiter,
    registry: ConnectionRegistry,
}

impl Upgrader {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let concurrency = config
            .per_message_deflate
            .as_ref()
            .map(|options| options.concurrency)
            .unwrap_or(0);

        Self {
            config,
            limiter: Limiter::new(concurrency),
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Limiter shared by every compressed connection
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run the upgrade for one request
    ///
    /// `head` holds bytes the client already sent past the request head.
    /// On failure the error response has been written and the transport
    /// dropped.
    pub async fn upgrade<S>(
        &self,
        request: &UpgradeRequest,
        stream: S,
        head: Bytes,
    ) -> Result<Connection<S>>
    where
        S: AsyncWrite + Unpin,
    {
        let peer = request.peer_addr();
        let mut socket = HandshakeSocket::new(stream);
        transition(peer, UpgradeState::Received);

        let key = match handshake::validate(request, self.config.path.as_deref()) {
            Ok(key) => key,
            Err(e) => {
                let status = e.status();
                abort(&mut socket, peer, &e, status, None, &[]).await;
                return Err(e);
            }
        };
        transition(peer, UpgradeState::Validated);

        if let Some(verify) = &self.config.verify_client {
            if let Verdict::Reject {
                status,
                message,
                headers,
            } = verify.verify(ClientInfo::from_request(request)).await
            {
                let e = Error::HandshakeRejected {
                    status,
                    reason: "client verification failed",
                };
                abort(&mut socket, peer, &e, status, message.as_deref(), &headers).await;
                return Err(e);
            }
        }

        let deflate = self.negotiate(request);
        transition(peer, UpgradeState::Negotiated);

        let protocol = self.select_protocol(request);
        let accept = handshake::generate_accept_key(&key);
        let response = handshake::build_response(
            &accept,
            protocol.as_deref(),
            deflate.as_ref().map(|(_, header)| header.as_str()),
        );

        if let Err(e) = socket.write(&response).await {
            transition(peer, UpgradeState::Aborted);
            warn!(peer = ?peer, error = %e, "transport failed during handshake");
            return Err(e);
        }
        let stream = socket.into_inner().ok_or(Error::ConnectionClosed)?;

        let membership = self.registry.register(ConnectionInfo {
            peer_addr: peer,
            path: request.path().to_string(),
            protocol: protocol.clone(),
            compressed: deflate.is_some(),
            connected_at: Instant::now(),
        });

        let mut connection = Connection::new(stream, head, self.config.max_payload)
            .with_protocol(protocol)
            .with_membership(membership);
        if let Some((ext, header)) = deflate {
            connection = connection.with_deflate(ext, header);
        }

        transition(peer, UpgradeState::Completed);
        Ok(connection)
    }

    /// Negotiate permessage-deflate; never fails the handshake
    fn negotiate(&self, request: &UpgradeRequest) -> Option<(PerMessageDeflate, String)> {
        let options = self.config.per_message_deflate.as_ref()?;
        let header = request.header("sec-websocket-extensions")?;

        let extensions = match extension::parse(header) {
            Ok(extensions) => extensions,
            Err(e) => {
                debug!(error = %e, "ignoring malformed Sec-WebSocket-Extensions");
                return None;
            }
        };
        let offers = extensions.get(deflate::EXTENSION_NAME)?;

        let mut ext =
            PerMessageDeflate::new(options.clone(), self.config.max_payload, self.limiter.clone());
        match ext.accept(offers) {
            Negotiation::Accepted(params) => Some((ext, params.to_header())),
            Negotiation::Declined => {
                debug!("no acceptable permessage-deflate offer");
                None
            }
        }
    }

    fn select_protocol(&self, request: &UpgradeRequest) -> Option<String> {
        let protocols = request.protocols();
        if protocols.is_empty() {
            return None;
        }

        match &self.config.handle_protocols {
            Some(select) => select(&protocols, request),
            None => protocols.into_iter().next(),
        }
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

fn transition(peer: Option<SocketAddr>, state: UpgradeState) {
    debug!(peer = ?peer, state = ?state, "upgrade state");
}

async fn abort<S>(
    socket: &mut HandshakeSocket<S>,
    peer: Option<SocketAddr>,
    error: &Error,
    status: StatusCode,
    message: Option<&str>,
    headers: &[(String, String)],
) where
    S: AsyncWrite + Unpin,
{
    transition(peer, UpgradeState::Aborted);
    warn!(peer = ?peer, status = status.as_u16(), error = %error, "handshake aborted");
    socket.abort(status, message, headers).await;
}
