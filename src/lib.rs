//! # Mihan-WS: WebSocket upgrade server core
//!
//! Turns inbound HTTP/1.1 requests into established WebSocket connections,
//! negotiates permessage-deflate (RFC 7692) and bounds the compression work
//! that extension creates across every connection of a server.
//!
//! ## Pieces
//!
//! - **Handshake validation**: RFC 6455 §4.2 checks and the accept key
//! - **Extension negotiation**: first acceptable permessage-deflate offer wins,
//!   a failed negotiation never fails the handshake
//! - **Concurrency limiting**: one bounded job queue shared by all compressed
//!   connections
//! - **Upgrade coordination**: 101 or error response, then hand-off of the
//!   transport as a [`Connection`]
//!
//! Frame parsing is not part of this crate; the handler receives the raw
//! transport plus any bytes that arrived after the request head.
//!
//! ## Example
//!
//! ```no_run
//! use mihan_ws::prelude::*;
//! use mihan_ws::deflate::{DeflateOptions, MaxWindowBits};
//!
//! # async fn run() -> mihan_ws::Result<()> {
//! let config = ServerConfig::builder()
//!     .port(8080)
//!     .per_message_deflate(DeflateOptions {
//!         client_max_window_bits: MaxWindowBits::Negotiable,
//!         ..DeflateOptions::default()
//!     })
//!     .handle_protocols(|protocols, _req| {
//!         protocols.iter().find(|p| p.as_str() == "chat").cloned()
//!     })
//!     .build()?;
//!
//! WebSocketServer::bind(config)
//!     .await?
//!     .serve(|conn, req| async move {
//!         // hand `conn` to a framing layer
//!         let _ = (conn, req);
//!     })
//!     .await
//! # }
//! ```

#[cfg(feature = "permessage-deflate")]
pub mod codec;
pub mod config;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod extension;
pub mod handshake;
pub mod limiter;
pub mod request;
pub mod server;
pub mod upgrade;

pub use config::{ClientInfo, ServerConfig, ServerConfigBuilder, SharedListener, Verdict};
pub use connection::{Connection, ConnectionRegistry, ReadyState};
pub use deflate::{DeflateOptions, MaxWindowBits, Negotiation, PerMessageDeflate};
pub use error::{ConfigError, Error, Result};
pub use limiter::Limiter;
pub use request::UpgradeRequest;
pub use server::WebSocketServer;
pub use upgrade::Upgrader;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions accepted in `Sec-WebSocket-Version`
pub const SUPPORTED_VERSIONS: [u8; 2] = [8, 13];

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ClientInfo, ServerConfig, Verdict};
    pub use crate::connection::Connection;
    pub use crate::error::{Error, Result};
    pub use crate::request::UpgradeRequest;
    pub use crate::server::WebSocketServer;
}
