//! WebSocket upgrade handshake (server side)
//!
//! Parsing and validation are split: [`parse_request`] only extracts the
//! request line and the headers the upgrade cares about, while
//! [`ServerHandshake::accept`] decides whether the request is an acceptable
//! upgrade and derives the response. A rejected request is answered with
//! [`reject_response`].

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;
use crate::{Config, WS_GUID};

/// Maximum size of the HTTP request head
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// Maximum number of request headers
const MAX_HEADERS: usize = 32;

/// Upgrade request as read off the socket (server-side)
///
/// Values borrow from the read buffer and are not yet validated.
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// The request method
    pub method: &'a str,
    /// The request path
    pub path: &'a str,
    /// The Host header
    pub host: Option<&'a str>,
    /// The Upgrade header
    pub upgrade: Option<&'a str>,
    /// The Connection header
    pub connection: Option<&'a str>,
    /// The Sec-WebSocket-Key header
    pub key: Option<&'a str>,
    /// The Sec-WebSocket-Version header
    pub version: Option<&'a str>,
    /// The Sec-WebSocket-Protocol header, comma-separated
    pub protocol: Option<&'a str>,
}

impl<'a> HandshakeRequest<'a> {
    /// Subprotocols offered by the client, in the order offered
    pub fn offered_protocols(&self) -> impl Iterator<Item = &'a str> {
        self.protocol
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Parse an HTTP/1.1 request head
///
/// Returns the request and the number of bytes it occupied, or `None` if
/// the head is still incomplete. Bytes past the returned length belong to
/// the frame stream.
pub fn parse_request(
    buf: &[u8],
) -> std::result::Result<Option<(HandshakeRequest<'_>, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HANDSHAKE_SIZE {
                return Err(HandshakeError::RequestTooLarge(MAX_HANDSHAKE_SIZE));
            }
            return Ok(None);
        }
        Err(_) => return Err(HandshakeError::MalformedRequest),
    };

    if len > MAX_HANDSHAKE_SIZE {
        return Err(HandshakeError::RequestTooLarge(MAX_HANDSHAKE_SIZE));
    }

    let mut request = HandshakeRequest {
        method: req.method.unwrap_or_default(),
        path: req.path.unwrap_or("/"),
        host: None,
        upgrade: None,
        connection: None,
        key: None,
        version: None,
        protocol: None,
    };

    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| HandshakeError::InvalidHeaderValue)?
            .trim();
        let slot = match header.name.to_ascii_lowercase().as_str() {
            "host" => &mut request.host,
            "upgrade" => &mut request.upgrade,
            "connection" => &mut request.connection,
            "sec-websocket-key" => &mut request.key,
            "sec-websocket-version" => &mut request.version,
            "sec-websocket-protocol" => &mut request.protocol,
            _ => continue,
        };
        *slot = Some(value);
    }

    Ok(Some((request, len)))
}

/// Case-insensitive search for `token` in a comma-separated header value
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Server side of the upgrade negotiation
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    protocols: Vec<String>,
}

impl ServerHandshake {
    /// Create a negotiator supporting the given subprotocols
    pub fn new<I, P>(protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a negotiator from session configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.protocols.iter().cloned())
    }

    /// Validate an upgrade request and derive the 101 response
    pub fn accept(
        &self,
        req: &HandshakeRequest<'_>,
    ) -> std::result::Result<HandshakeResponse, HandshakeError> {
        if req.method != "GET" {
            return Err(HandshakeError::InvalidMethod(req.method.to_string()));
        }

        let upgrade = req.upgrade.ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !has_token(upgrade, "websocket") {
            return Err(HandshakeError::NotWebSocketUpgrade);
        }

        let connection = req
            .connection
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !has_token(connection, "upgrade") {
            return Err(HandshakeError::NotConnectionUpgrade);
        }

        let key = req
            .key
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        match base64::engine::general_purpose::STANDARD.decode(key) {
            Ok(raw) if raw.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        if let Some(version) = req.version {
            if version != "13" {
                return Err(HandshakeError::UnsupportedVersion(version.to_string()));
            }
        }

        let protocol = req
            .offered_protocols()
            .find(|offered| self.protocols.iter().any(|p| p == offered))
            .map(String::from);

        Ok(HandshakeResponse {
            accept_key: generate_accept_key(key),
            protocol,
        })
    }
}

/// Accepted upgrade, ready to be written as `101 Switching Protocols`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The Sec-WebSocket-Accept value
    pub accept_key: String,
    /// Negotiated subprotocol, if any offer matched
    pub protocol: Option<String>,
}

impl HandshakeResponse {
    /// Serialize the response head
    pub fn to_bytes(&self) -> Bytes {
        build_response(&self.accept_key, self.protocol.as_deref())
    }
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
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the `400 Bad Request` written before closing a rejected socket
pub fn reject_response(err: &HandshakeError) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n");
    buf.put_slice(b"Connection: close\r\n");
    if matches!(err, HandshakeError::UnsupportedVersion(_)) {
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    }
    buf.put_slice(b"Content-Length: 0\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn accept(raw: &[u8], server: &ServerHandshake) -> Result<HandshakeResponse, HandshakeError> {
        let (req, _) = parse_request(raw).unwrap().unwrap();
        server.accept(&req)
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_request() {
        let (req, len) = parse_request(SAMPLE).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host, Some("server.example.com"));
        assert_eq!(req.key, Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(req.version, Some("13"));
        assert_eq!(len, SAMPLE.len());
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n";

        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_parse_request_leaves_trailing_frame_bytes() {
        let mut raw = SAMPLE.to_vec();
        raw.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        let (_, len) = parse_request(&raw).unwrap().unwrap();
        assert_eq!(len, SAMPLE.len());
        assert_eq!(&raw[len..], &[0x81, 0x80, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_request_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.resize(MAX_HANDSHAKE_SIZE + 1, b'a');
        assert!(matches!(
            parse_request(&raw),
            Err(HandshakeError::RequestTooLarge(_))
        ));
    }

    #[test]
    fn test_parse_request_garbage() {
        assert!(matches!(
            parse_request(b"\x16\x03\x01\x00\r\n\r\n"),
            Err(HandshakeError::MalformedRequest)
        ));
    }

    #[test]
    fn test_accept_sample() {
        let response = accept(SAMPLE, &ServerHandshake::default()).unwrap();
        assert_eq!(response.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.protocol, None);
    }

    #[test]
    fn test_header_names_case_insensitive_and_tokens() {
        let raw = b"GET / HTTP/1.1\r\n\
            HOST: a\r\n\
            upgrade: WebSocket\r\n\
            CONNECTION: keep-alive, Upgrade\r\n\
            sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(accept(raw, &ServerHandshake::default()).is_ok());
    }

    #[test]
    fn test_reject_missing_upgrade() {
        let raw = b"GET / HTTP/1.1\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(matches!(
            accept(raw, &ServerHandshake::default()),
            Err(HandshakeError::MissingHeader("Upgrade"))
        ));
    }

    #[test]
    fn test_reject_wrong_upgrade_and_connection() {
        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: h2c\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(matches!(
            accept(raw, &ServerHandshake::default()),
            Err(HandshakeError::NotWebSocketUpgrade)
        ));

        // "Upgrade" must be a whole token
        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgraded\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(matches!(
            accept(raw, &ServerHandshake::default()),
            Err(HandshakeError::NotConnectionUpgrade)
        ));
    }

    #[test]
    fn test_reject_bad_keys() {
        for key in ["", "not base64!", "c2hvcnQ="] {
            let raw = format!(
                "GET / HTTP/1.1\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Key: {key}\r\n\
                 \r\n"
            );
            assert!(
                matches!(
                    accept(raw.as_bytes(), &ServerHandshake::default()),
                    Err(HandshakeError::InvalidKey)
                ),
                "key {key:?} accepted"
            );
        }

        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            \r\n";
        assert!(matches!(
            accept(raw, &ServerHandshake::default()),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        ));
    }

    #[test]
    fn test_reject_method_and_version() {
        let raw = b"POST / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";
        assert!(matches!(
            accept(raw, &ServerHandshake::default()),
            Err(HandshakeError::InvalidMethod(m)) if m == "POST"
        ));

        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 8\r\n\
            \r\n";
        let err = accept(raw, &ServerHandshake::default()).unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion(ref v) if v == "8"));
        let response = reject_response(&err);
        assert!(
            std::str::from_utf8(&response)
                .unwrap()
                .contains("Sec-WebSocket-Version: 13\r\n")
        );
    }

    #[test]
    fn test_subprotocol_follows_client_order() {
        let raw = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Protocol: xml, chat ,json\r\n\
            \r\n";
        let server = ServerHandshake::new(["json", "chat"]);
        let response = accept(raw, &server).unwrap();
        assert_eq!(response.protocol.as_deref(), Some("chat"));

        let server = ServerHandshake::new(["mqtt"]);
        let response = accept(raw, &server).unwrap();
        assert_eq!(response.protocol, None);
        let head = response.to_bytes();
        assert!(
            !std::str::from_utf8(&head)
                .unwrap()
                .contains("Sec-WebSocket-Protocol")
        );
    }

    #[test]
    fn test_build_response() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", Some("json"));
        assert_eq!(
            &response[..],
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              Sec-WebSocket-Protocol: json\r\n\
              \r\n"
        );
    }

    #[test]
    fn test_reject_response() {
        let response = reject_response(&HandshakeError::InvalidKey);
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Sec-WebSocket-Version"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
