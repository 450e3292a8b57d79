//! Established connections and the live-connection registry

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use crate::deflate::PerMessageDeflate;

/// Connection state as seen by the framing layer
///
/// Starts at `Open`: a [`Connection`] only exists once the 101 was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// Summary of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer_addr: Option<SocketAddr>,
    pub path: String,
    pub protocol: Option<String>,
    pub compressed: bool,
    pub connected_at: Instant,
}

struct RegistryInner {
    connections: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
}

/// Set of live connections, shared across all upgrade tasks
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Insert a connection, returning its membership
    pub fn register(&self, info: ConnectionInfo) -> Membership {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.insert(id, info);
        Membership {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<ConnectionInfo> {
        self.inner.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Ids of every live connection
    pub fn ids(&self) -> Vec<u64> {
        self.inner.connections.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// A connection's entry in the registry
///
/// Dropping it removes the entry. It does not keep the registry alive.
#[derive(Debug)]
pub struct Membership {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl Membership {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.connections.remove(&self.id);
        }
    }
}

/// Handoff record for an upgraded connection
///
/// Owns the transport. Whatever speaks the framing protocol takes it over
/// with [`Connection::into_parts`], or uses it in place.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    head: Bytes,
    protocol: Option<String>,
    extensions: Option<String>,
    deflate: Option<PerMessageDeflate>,
    max_payload: usize,
    ready_state: ReadyState,
    membership: Option<Membership>,
}

/// Owned pieces of a [`Connection`]
#[derive(Debug)]
pub struct Parts<S> {
    pub stream: S,
    /// Bytes the client sent after the request head
    pub head: Bytes,
    pub protocol: Option<String>,
    /// `Sec-WebSocket-Extensions` value sent in the 101 response
    pub extensions: Option<String>,
    pub deflate: Option<PerMessageDeflate>,
    pub max_payload: usize,
    /// Registry entry, removed when dropped
    pub membership: Option<Membership>,
}

impl<S> Connection<S> {
    pub(crate) fn new(stream: S, head: Bytes, max_payload: usize) -> Self {
        Self {
            stream,
            head,
            protocol: None,
            extensions: None,
            deflate: None,
            max_payload,
            ready_state: ReadyState::Open,
            membership: None,
        }
    }

    pub(crate) fn with_protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    pub(crate) fn with_deflate(mut self, deflate: PerMessageDeflate, header: String) -> Self {
        self.deflate = Some(deflate);
        self.extensions = Some(header);
        self
    }

    pub(crate) fn with_membership(mut self, membership: Membership) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Registry id, if tracked
    pub fn id(&self) -> Option<u64> {
        self.membership.as_ref().map(Membership::id)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes that arrived after the request head, to be framed first
    pub fn head(&self) -> &Bytes {
        &self.head
    }

    /// Negotiated sub-protocol
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Negotiated extensions, as sent to the client
    pub fn extensions(&self) -> Option<&str> {
        self.extensions.as_deref()
    }

    pub fn deflate(&self) -> Option<&PerMessageDeflate> {
        self.deflate.as_ref()
    }

    pub fn is_compressed(&self) -> bool {
        self.deflate.is_some()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    /// Record that a close handshake started
    pub fn set_closing(&mut self) {
        if self.ready_state == ReadyState::Open {
            self.ready_state = ReadyState::Closing;
        }
    }

    /// Record that the connection is gone and leave the registry
    pub fn set_closed(&mut self) {
        self.ready_state = ReadyState::Closed;
        self.membership = None;
    }

    pub fn into_parts(self) -> Parts<S> {
        Parts {
            stream: self.stream,
            head: self.head,
            protocol: self.protocol,
            extensions: self.extensions,
            deflate: self.deflate,
            max_payload: self.max_payload,
            membership: self.membership,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
