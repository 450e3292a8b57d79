//! Per-Message Deflate Extension (RFC 7692)
//!
//! This module negotiates the permessage-deflate extension for the server
//! role and, once accepted, schedules the per-connection compression work on
//! the server-wide [`Limiter`].
//!
//! Negotiation never fails a handshake: an invalid offer is skipped, a
//! malformed header or a list with no acceptable offer yields
//! [`Negotiation::Declined`] and the connection continues uncompressed.

use serde::Deserialize;

use crate::error::{ConfigError, Error, Result};
use crate::extension::{self, ParamSet, ParamValue};
use crate::limiter::Limiter;

#[cfg(feature = "permessage-deflate")]
use {
    crate::codec::{DeflateDecoder, DeflateEncoder},
    crate::limiter::JobId,
    bytes::Bytes,
    parking_lot::Mutex,
    std::sync::Arc,
    tokio::sync::oneshot,
};

/// Registered extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Default number of concurrent zlib calls across all connections
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default minimum payload size worth compressing
pub const DEFAULT_THRESHOLD: usize = 1024;

/// Server policy for one `*_max_window_bits` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawWindowBits")]
pub enum MaxWindowBits {
    /// Refuse custom window sizes (config value `false`)
    #[default]
    Off,
    /// Accept whatever the client asks for (config value `true`)
    Negotiable,
    /// Pin the window size (config value `8..=15`)
    Bits(u8),
}

impl MaxWindowBits {
    /// Pinned window size, checked against 8..=15
    pub fn bits(bits: u8) -> std::result::Result<Self, ConfigError> {
        if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
            Ok(MaxWindowBits::Bits(bits))
        } else {
            Err(ConfigError::InvalidWindowBits(bits))
        }
    }

    fn validate(self) -> std::result::Result<(), ConfigError> {
        match self {
            MaxWindowBits::Bits(bits) => Self::bits(bits).map(|_| ()),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWindowBits {
    Flag(bool),
    Bits(u8),
}

impl TryFrom<RawWindowBits> for MaxWindowBits {
    type Error = ConfigError;

    fn try_from(raw: RawWindowBits) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawWindowBits::Flag(false) => Ok(MaxWindowBits::Off),
            RawWindowBits::Flag(true) => Ok(MaxWindowBits::Negotiable),
            RawWindowBits::Bits(bits) => MaxWindowBits::bits(bits),
        }
    }
}

/// Server policy for permessage-deflate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeflateOptions {
    /// Accept (and always apply) server_no_context_takeover
    pub server_no_context_takeover: bool,
    /// Always ask the client to reset its context after each message
    pub client_no_context_takeover: bool,
    /// Policy for server_max_window_bits
    pub server_max_window_bits: MaxWindowBits,
    /// Policy for client_max_window_bits
    pub client_max_window_bits: MaxWindowBits,
    /// Concurrent zlib calls allowed server-wide (0 = unbounded)
    pub concurrency: usize,
    /// Payloads smaller than this are sent uncompressed
    pub threshold: usize,
    /// zlib compression level (0-9)
    pub level: u32,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MaxWindowBits::Off,
            client_max_window_bits: MaxWindowBits::Off,
            concurrency: DEFAULT_CONCURRENCY,
            threshold: DEFAULT_THRESHOLD,
            level: 6,
        }
    }
}

impl DeflateOptions {
    /// Check window sizes and compression level
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.server_max_window_bits.validate()?;
        self.client_max_window_bits.validate()?;
        if self.level > 9 {
            return Err(ConfigError::InvalidCompressionLevel(self.level));
        }
        Ok(())
    }
}

/// client_max_window_bits as offered by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientWindowBits {
    /// Bare flag: the client supports the parameter
    Negotiable,
    /// Explicit window size
    Bits(u8),
}

/// One normalized permessage-deflate offer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<ClientWindowBits>,
}

impl OfferParams {
    /// Normalize raw parameters from one offer
    ///
    /// Any repeated parameter with conflicting values, unknown name, or
    /// out-of-range value invalidates the whole offer.
    pub fn from_params(params: &ParamSet) -> Result<Self> {
        let mut offer = Self::default();

        for (name, values) in params {
            let value = match values.as_slice() {
                [first, rest @ ..] if rest.iter().all(|v| v == first) => first,
                _ => {
                    return Err(Error::Negotiation(format!(
                        "parameter {name:?} must have only a single value"
                    )));
                }
            };

            match (name.as_str(), value) {
                ("server_no_context_takeover", ParamValue::Flag) => {
                    offer.server_no_context_takeover = true;
                }
                ("client_no_context_takeover", ParamValue::Flag) => {
                    offer.client_no_context_takeover = true;
                }
                ("server_max_window_bits", ParamValue::Value(v)) => {
                    offer.server_max_window_bits = Some(parse_window_bits(name, v)?);
                }
                ("client_max_window_bits", ParamValue::Flag) => {
                    offer.client_max_window_bits = Some(ClientWindowBits::Negotiable);
                }
                ("client_max_window_bits", ParamValue::Value(v)) => {
                    offer.client_max_window_bits =
                        Some(ClientWindowBits::Bits(parse_window_bits(name, v)?));
                }
                (
                    "server_no_context_takeover"
                    | "client_no_context_takeover"
                    | "server_max_window_bits",
                    _,
                ) => {
                    return Err(Error::Negotiation(format!(
                        "invalid value for parameter {name:?}"
                    )));
                }
                _ => {
                    return Err(Error::Negotiation(format!("unknown parameter {name:?}")));
                }
            }
        }

        Ok(offer)
    }

    /// Format as a request header value (client role)
    pub fn to_header(&self) -> String {
        let mut params = Vec::with_capacity(4);
        if self.server_no_context_takeover {
            params.push(("server_no_context_takeover", None));
        }
        if self.client_no_context_takeover {
            params.push(("client_no_context_takeover", None));
        }
        if let Some(bits) = self.server_max_window_bits {
            params.push(("server_max_window_bits", Some(bits.to_string())));
        }
        match self.client_max_window_bits {
            Some(ClientWindowBits::Negotiable) => params.push(("client_max_window_bits", None)),
            Some(ClientWindowBits::Bits(bits)) => {
                params.push(("client_max_window_bits", Some(bits.to_string())))
            }
            None => {}
        }
        extension::format(EXTENSION_NAME, params)
    }
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    value
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
        .ok_or_else(|| {
            Error::Negotiation(format!("invalid value for parameter {name:?}: {value}"))
        })
}

/// Parameters the server settled on for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl AcceptedParams {
    /// Format as a `Sec-WebSocket-Extensions` response value
    pub fn to_header(&self) -> String {
        let mut params = Vec::with_capacity(4);
        if self.server_no_context_takeover {
            params.push(("server_no_context_takeover", None));
        }
        if self.client_no_context_takeover {
            params.push(("client_no_context_takeover", None));
        }
        if let Some(bits) = self.server_max_window_bits {
            params.push(("server_max_window_bits", Some(bits.to_string())));
        }
        if let Some(bits) = self.client_max_window_bits {
            params.push(("client_max_window_bits", Some(bits.to_string())));
        }
        extension::format(EXTENSION_NAME, params)
    }
}

/// Outcome of server-side negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The first acceptable offer, resolved against server policy
    Accepted(AcceptedParams),
    /// No usable offer; continue without compression
    Declined,
}

/// Normalize every offer, dropping the invalid ones
pub fn normalize(offers: &[ParamSet]) -> Vec<OfferParams> {
    offers
        .iter()
        .filter_map(|params| match OfferParams::from_params(params) {
            Ok(offer) => Some(offer),
            Err(e) => {
                tracing::debug!(error = %e, "discarding permessage-deflate offer");
                None
            }
        })
        .collect()
}

/// Pick the first offer the policy can honor and resolve its parameters
pub fn accept_as_server(offers: &[OfferParams], policy: &DeflateOptions) -> Negotiation {
    let Some(offer) = offers.iter().find(|offer| is_acceptable(offer, policy)) else {
        return Negotiation::Declined;
    };

    let server_max_window_bits = match policy.server_max_window_bits {
        MaxWindowBits::Bits(bits) => Some(bits),
        _ => offer.server_max_window_bits,
    };

    let client_max_window_bits = match (policy.client_max_window_bits, offer.client_max_window_bits)
    {
        (MaxWindowBits::Bits(bits), _) => Some(bits),
        (MaxWindowBits::Off, _) => None,
        // a bare flag cannot be echoed back; the client keeps its default window
        (MaxWindowBits::Negotiable, Some(ClientWindowBits::Bits(bits))) => Some(bits),
        (MaxWindowBits::Negotiable, _) => None,
    };

    Negotiation::Accepted(AcceptedParams {
        server_no_context_takeover: policy.server_no_context_takeover
            || offer.server_no_context_takeover,
        client_no_context_takeover: policy.client_no_context_takeover
            || offer.client_no_context_takeover,
        server_max_window_bits,
        client_max_window_bits,
    })
}

fn is_acceptable(offer: &OfferParams, policy: &DeflateOptions) -> bool {
    if !policy.server_no_context_takeover && offer.server_no_context_takeover {
        return false;
    }

    if let Some(requested) = offer.server_max_window_bits {
        match policy.server_max_window_bits {
            MaxWindowBits::Off => return false,
            MaxWindowBits::Bits(floor) if floor > requested => return false,
            _ => {}
        }
    }

    if matches!(policy.client_max_window_bits, MaxWindowBits::Bits(_))
        && offer.client_max_window_bits.is_none()
    {
        return false;
    }

    true
}

/// Negotiate straight from a `Sec-WebSocket-Extensions` header value
pub fn negotiate(header: &str, policy: &DeflateOptions) -> Negotiation {
    match extension::parse(header) {
        Ok(extensions) => match extensions.get(EXTENSION_NAME) {
            Some(offers) => accept_as_server(&normalize(offers), policy),
            None => Negotiation::Declined,
        },
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed extension header");
            Negotiation::Declined
        }
    }
}

/// permessage-deflate state for one connection
///
/// Holds the negotiated parameters and, once accepted, the codec. Every
/// compress/decompress call runs as a job on the shared [`Limiter`].
pub struct PerMessageDeflate {
    options: DeflateOptions,
    max_payload: usize,
    limiter: Limiter,
    params: Option<AcceptedParams>,
    #[cfg(feature = "permessage-deflate")]
    encoder: Option<Arc<Mutex<DeflateEncoder>>>,
    #[cfg(feature = "permessage-deflate")]
    decoder: Option<Arc<Mutex<DeflateDecoder>>>,
}

impl PerMessageDeflate {
    /// Create the extension for one connection
    pub fn new(options: DeflateOptions, max_payload: usize, limiter: Limiter) -> Self {
        Self {
            options,
            max_payload,
            limiter,
            params: None,
            #[cfg(feature = "permessage-deflate")]
            encoder: None,
            #[cfg(feature = "permessage-deflate")]
            decoder: None,
        }
    }

    /// Server policy in use
    pub fn options(&self) -> &DeflateOptions {
        &self.options
    }

    /// Parameters accepted for this connection, if negotiation succeeded
    pub fn params(&self) -> Option<&AcceptedParams> {
        self.params.as_ref()
    }

    /// Build a client-side offer from the policy
    pub fn offer(&self) -> OfferParams {
        let client_max_window_bits = match self.options.client_max_window_bits {
            MaxWindowBits::Bits(bits) => Some(ClientWindowBits::Bits(bits)),
            MaxWindowBits::Negotiable => Some(ClientWindowBits::Negotiable),
            MaxWindowBits::Off => None,
        };

        OfferParams {
            server_no_context_takeover: self.options.server_no_context_takeover,
            client_no_context_takeover: self.options.client_no_context_takeover,
            server_max_window_bits: match self.options.server_max_window_bits {
                MaxWindowBits::Bits(bits) => Some(bits),
                _ => None,
            },
            client_max_window_bits,
        }
    }

    /// Accept one of the client's offers for this extension
    pub fn accept(&mut self, offers: &[ParamSet]) -> Negotiation {
        let negotiation = accept_as_server(&normalize(offers), &self.options);

        if let Negotiation::Accepted(params) = negotiation {
            self.params = Some(params);
            #[cfg(feature = "permessage-deflate")]
            {
                self.encoder = Some(Arc::new(Mutex::new(DeflateEncoder::new(
                    params.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS),
                    params.server_no_context_takeover,
                    self.options.level,
                ))));
                self.decoder = Some(Arc::new(Mutex::new(DeflateDecoder::new(
                    params.client_no_context_takeover,
                ))));
            }
        }

        negotiation
    }

    /// Whether a payload of `len` bytes is worth compressing
    pub fn should_compress(&self, len: usize) -> bool {
        self.params.is_some() && len >= self.options.threshold
    }

    /// Compress an outgoing message
    ///
    /// Returns `None` when the payload is under the threshold. Calls for one
    /// connection must be awaited in message order.
    #[cfg(feature = "permessage-deflate")]
    pub async fn compress(&self, data: Bytes) -> Result<Option<Bytes>> {
        let encoder = self
            .encoder
            .clone()
            .ok_or_else(|| Error::Compression("extension was not negotiated".into()))?;
        if data.len() < self.options.threshold {
            return Ok(None);
        }

        self.schedule(move || encoder.lock().compress(&data))
            .await
            .map(Some)
    }

    /// Decompress an incoming message, bounded by the maximum payload
    #[cfg(feature = "permessage-deflate")]
    pub async fn decompress(&self, data: Bytes) -> Result<Bytes> {
        let decoder = self
            .decoder
            .clone()
            .ok_or_else(|| Error::Compression("extension was not negotiated".into()))?;
        let max_payload = self.max_payload;

        self.schedule(move || decoder.lock().decompress(&data, max_payload))
            .await
    }

    #[cfg(feature = "permessage-deflate")]
    async fn schedule<F>(&self, work: F) -> Result<Bytes>
    where
        F: FnOnce() -> Result<Bytes> + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Compression("no tokio runtime for compression".into()))?;
        let (tx, rx) = oneshot::channel();

        let id = self.limiter.push(move |done| {
            // caller went away while queued
            if tx.is_closed() {
                return;
            }
            handle.spawn_blocking(move || {
                let result = work();
                // free the slot before the caller resumes
                done.finish();
                let _ = tx.send(result);
            });
        });

        let _queued = QueuedJob {
            limiter: &self.limiter,
            id,
        };
        rx.await.map_err(|_| Error::JobCancelled)?
    }
}

impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("options", &self.options)
            .field("max_payload", &self.max_payload)
            .field("params", &self.params)
            .finish()
    }
}

/// Drops a not-yet-started job when its future is abandoned
#[cfg(feature = "permessage-deflate")]
struct QueuedJob<'a> {
    limiter: &'a Limiter,
    id: JobId,
}

#[cfg(feature = "permessage-deflate")]
impl Drop for QueuedJob<'_> {
    fn drop(&mut self) {
        self.limiter.remove(self.id);
    }
}
