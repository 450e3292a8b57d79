//! WebSocket handshake (RFC 6455 §4.2)
//!
//! This module handles the server side of the HTTP upgrade:
//! - Parsing the request head into an [`UpgradeRequest`]
//! - Validating the upgrade headers
//! - Computing the Sec-WebSocket-Accept key
//! - Building the 101 and error responses

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use sha1::{Digest, Sha1};

use crate::{SUPPORTED_VERSIONS, WS_GUID};
use crate::error::{Error, Result};
use crate::request::UpgradeRequest;

/// Maximum HTTP header size (8KB should be enough for any reasonable request)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Maximum number of request headers
const MAX_HEADERS: usize = 64;

/// Parse an HTTP request head
///
/// Returns the request and the number of bytes consumed, or `None` if the
/// head is incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let method = req
                .method
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .ok_or(Error::InvalidHttp("invalid method"))?;
            let target = req.path.unwrap_or("/");

            let mut map = HeaderMap::with_capacity(req.headers.len());
            for header in req.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| Error::InvalidHttp("invalid header name"))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                map.append(name, value);
            }

            Ok(Some((UpgradeRequest::new(method, target, map), len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::HandshakeRejected {
                    status: StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    reason: "request head too large",
                });
            }
            Ok(None)
        }
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Read a request head from the transport
///
/// Returns the request and any bytes received past the end of the head.
pub async fn read_request<S>(stream: &mut S) -> Result<(UpgradeRequest, Bytes)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        if let Some((req, consumed)) = parse_request(&buf)? {
            let leftover = buf.split_off(consumed).freeze();
            return Ok((req, leftover));
        }
    }
}

fn reject(reason: &'static str) -> Error {
    Error::HandshakeRejected {
        status: StatusCode::BAD_REQUEST,
        reason,
    }
}

/// Check a 16-byte base64 nonce: 22 alphabet characters followed by `==`
fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        && &bytes[22..] == b"=="
}

/// Validate an upgrade request and return its trimmed Sec-WebSocket-Key
///
/// Every failure is a 400; `path` restricts the request path (query
/// string excluded) when set.
pub fn validate(request: &UpgradeRequest, path: Option<&str>) -> Result<String> {
    if request.method() != Method::GET {
        return Err(reject("method must be GET"));
    }

    let upgrade = request
        .header("upgrade")
        .ok_or(reject("missing Upgrade header"))?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(reject("Upgrade header must be websocket"));
    }

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .ok_or(reject("missing Sec-WebSocket-Key"))?;
    if !is_valid_key(key) {
        return Err(reject("invalid Sec-WebSocket-Key"));
    }

    let version = request
        .header("sec-websocket-version")
        .and_then(|v| v.trim().parse::<u8>().ok());
    if !version.is_some_and(|v| SUPPORTED_VERSIONS.contains(&v)) {
        return Err(reject("unsupported WebSocket version"));
    }

    if let Some(path) = path {
        if request.path() != path {
            return Err(reject("path not handled by this server"));
        }
    }

    Ok(key.to_string())
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocol: Option<&str>, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the response that refuses a handshake
///
/// The body defaults to the status reason phrase; `headers` are appended
/// after the standard ones.
pub fn build_error_response(
    status: StatusCode,
    message: Option<&str>,
    headers: &[(String, String)],
) -> Bytes {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = message.unwrap_or(reason);
    let mut buf = BytesMut::with_capacity(128 + body.len());

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-type: text/html\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());

    for (name, value) in headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(body.as_bytes());
    buf.freeze()
}

/// Response for plain HTTP requests sent to a WebSocket-only port
pub fn build_upgrade_required_response() -> Bytes {
    let status = StatusCode::UPGRADE_REQUIRED;
    let body = status.canonical_reason().unwrap_or("Upgrade Required");
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 426 ");
    buf.put_slice(body.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Type: text/plain\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(body.as_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(extra: &str) -> UpgradeRequest {
        let raw = format!(
            "GET /chat?room=1 HTTP/1.1\r\n\
             Host: server.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             {extra}\r\n"
        );
        let (req, _) = parse_request(raw.as_bytes()).unwrap().unwrap();
        req
    }

    fn valid() -> UpgradeRequest {
        request(&format!(
            "Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n"
        ))
    }

    fn status_of(result: Result<String>) -> StatusCode {
        match result {
            Err(e) => e.status(),
            Ok(key) => panic!("expected rejection, accepted key {key}"),
        }
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let accept = generate_accept_key(KEY);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_request() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\nleftover";

        let (req, len) = parse_request(request).unwrap().unwrap();
        assert_eq!(req.path(), "/chat");
        assert_eq!(req.header("sec-websocket-key"), Some(KEY));
        assert_eq!(&request[len..], b"leftover");
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n";

        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_parse_request_too_large() {
        let mut request = b"GET /chat HTTP/1.1\r\nX-Filler: ".to_vec();
        request.extend(std::iter::repeat_n(b'a', MAX_HEADER_SIZE));
        let err = parse_request(&request).unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_read_request_keeps_leftover() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            client.write_all(b"GET /ws HTTP/1.1\r\nUpg").await.unwrap();
            client
                .write_all(b"rade: websocket\r\n\r\n\x81\x00")
                .await
                .unwrap();
        });

        let (req, leftover) = read_request(&mut server).await.unwrap();
        assert_eq!(req.path(), "/ws");
        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(&leftover[..], b"\x81\x00");
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_request(&mut server).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_validate_accepts_versions_8_and_13() {
        assert_eq!(validate(&valid(), None).unwrap(), KEY);

        let v8 = request(&format!(
            "Sec-WebSocket-Key:   {KEY}  \r\nSec-WebSocket-Version: 8\r\n"
        ));
        assert_eq!(validate(&v8, None).unwrap(), KEY);
    }

    #[test]
    fn test_validate_rejects_bad_method() {
        let raw = format!(
            "POST /chat HTTP/1.1\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        let (req, _) = parse_request(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(status_of(validate(&req, None)), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validate_upgrade_header() {
        let upper = UpgradeRequest::new(Method::GET, "/", {
            let mut headers = valid().headers().clone();
            headers.insert("upgrade", HeaderValue::from_static("WebSocket"));
            headers
        });
        assert!(validate(&upper, None).is_ok());

        let mut headers = valid().headers().clone();
        headers.remove("upgrade");
        let missing = UpgradeRequest::new(Method::GET, "/", headers);
        assert_eq!(status_of(validate(&missing, None)), StatusCode::BAD_REQUEST);

        let mut headers = valid().headers().clone();
        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        let other = UpgradeRequest::new(Method::GET, "/", headers);
        assert_eq!(status_of(validate(&other, None)), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validate_key_pattern() {
        for key in [
            "",
            "dGhlIHNhbXBsZSBub25jZQ",
            "dGhlIHNhbXBsZSBub25jZQ=",
            "dGhlIHNhbXBsZSBub25jZ===",
            "dGhlIHNhbXBsZSBub25jZ!==",
            "dGhlIHNhbXBsZSBub25jZQ==AA",
        ] {
            let req = request(&format!(
                "Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n"
            ));
            assert_eq!(status_of(validate(&req, None)), StatusCode::BAD_REQUEST, "{key}");
        }

        let missing = request("Sec-WebSocket-Version: 13\r\n");
        assert_eq!(status_of(validate(&missing, None)), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validate_version() {
        for version in ["12", "14", "abc", ""] {
            let req = request(&format!(
                "Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: {version}\r\n"
            ));
            assert!(validate(&req, None).is_err(), "{version}");
        }

        let missing = request(&format!("Sec-WebSocket-Key: {KEY}\r\n"));
        assert!(validate(&missing, None).is_err());
    }

    #[test]
    fn test_validate_path_filter() {
        assert!(validate(&valid(), Some("/chat")).is_ok());
        assert_eq!(
            status_of(validate(&valid(), Some("/other"))),
            StatusCode::BAD_REQUEST
        );
        assert!(validate(&valid(), Some("/chat?room=1")).is_err());
    }

    #[test]
    fn test_build_response() {
        let accept = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        let response = build_response(accept, Some("chat"), Some("permessage-deflate"));

        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response_str.contains("Upgrade: websocket\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(response_str.ends_with("\r\n\r\n"));

        let bare = build_response(accept, None, None);
        let bare = std::str::from_utf8(&bare).unwrap();
        assert!(!bare.contains("Sec-WebSocket-Protocol"));
        assert!(!bare.contains("Sec-WebSocket-Extensions"));
    }

    #[test]
    fn test_build_error_response() {
        let response = build_error_response(StatusCode::BAD_REQUEST, None, &[]);
        assert_eq!(
            std::str::from_utf8(&response).unwrap(),
            "HTTP/1.1 400 Bad Request\r\n\
             Connection: close\r\n\
             Content-type: text/html\r\n\
             Content-Length: 11\r\n\
             \r\n\
             Bad Request"
        );

        let response = build_error_response(
            StatusCode::UNAUTHORIZED,
            Some("go away"),
            &[("WWW-Authenticate".into(), "Basic".into())],
        );
        let response = std::str::from_utf8(&response).unwrap();
        assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(response.contains("Content-Length: 7\r\n"));
        assert!(response.contains("WWW-Authenticate: Basic\r\n"));
        assert!(response.ends_with("\r\n\r\ngo away"));
    }

    #[test]
    fn test_upgrade_required_response() {
        let response = build_upgrade_required_response();
        let response = std::str::from_utf8(&response).unwrap();
        assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(response.ends_with("\r\n\r\nUpgrade Required"));
    }
}
