//! Inbound upgrade request

use std::net::SocketAddr;

use http::{HeaderMap, Method};

/// Immutable view of one inbound HTTP request
///
/// Header lookups are case-insensitive. The transport travels separately so
/// the request can be inspected and logged after the socket is handed off.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    peer_addr: Option<SocketAddr>,
    secure: bool,
}

impl UpgradeRequest {
    /// Create a request from its method, request-target and headers
    pub fn new(method: Method, target: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            target: target.into(),
            headers,
            peer_addr: None,
            secure: false,
        }
    }

    /// Record the remote address
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Mark the request as received over TLS
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Raw request-target, including any query string
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request-target without the query string
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(index) => &self.target[..index],
            None => &self.target,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// True if the client asked for a protocol upgrade at all
    pub fn wants_upgrade(&self) -> bool {
        self.headers.contains_key(http::header::UPGRADE)
    }

    /// Sub-protocols listed in `Sec-WebSocket-Protocol`, in client order
    pub fn protocols(&self) -> Vec<String> {
        self.headers
            .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    }
}

impl From<&http::request::Parts> for UpgradeRequest {
    fn from(parts: &http::request::Parts) -> Self {
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Self::new(parts.method.clone(), target, parts.headers.clone())
    }
}
