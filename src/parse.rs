use std::str::FromStr;

use bytes::BytesMut;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::io::{self, AsyncRead};

use crate::util::ReadAhead;

const MAX_HEADERS: usize = 64;

/// Host and port of a resolved forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Hostname or IP literal, without brackets.
    pub host: String,
    /// Port in host byte order.
    pub port: u16,
}

impl Authority {
    /// Splits a `host[:port]` string, tolerating bracketed IPv6 literals
    /// and treating an unbracketed multi-colon value as a bare v6 host.
    pub(crate) fn split(s: &str) -> Option<(&str, Option<u16>)> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']')?;
            if host.is_empty() {
                return None;
            }
            return match rest.strip_prefix(':') {
                Some(port) => Some((host, Some(port.parse().ok()?))),
                None if rest.is_empty() => Some((host, None)),
                None => None,
            };
        }
        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Some((s, None)),
            Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
            Some(_) => None,
            None if s.is_empty() => None,
            None => Some((s, None)),
        }
    }

    /// Parses `host[:port]`, filling in `default_port` when absent.
    pub(crate) fn parse_with_default(s: &str, default_port: u16) -> Option<Self> {
        let (host, port) = Self::split(s)?;
        Some(Self {
            host: host.to_string(),
            port: port.unwrap_or(default_port),
        })
    }

    /// Address form accepted by the resolver when dialing.
    pub(crate) fn dial_addr(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // IPv6 literals need brackets in host:port positions
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One parsed HTTP/1.x request head.
///
/// Headers are case-insensitive and multi-valued; the head is mutated in
/// place during sanitization before it is re-encoded toward the upstream.
#[derive(derive_more::Debug)]
pub struct RequestHead {
    pub method: Method,
    /// The request target exactly as written on the request line.
    pub target: String,
    /// Parsed target for non-CONNECT requests (absolute- or origin-form).
    pub uri: Option<Uri>,
    pub version: Version,
    pub headers: HeaderMap<HeaderValue>,
}

impl RequestHead {
    /// Reads one request head off the stream.
    ///
    /// Returns `None` on a clean end of stream at a request boundary.
    /// Consumes exactly the header section; a request body or pipelined
    /// request stays readable behind it.
    pub(crate) async fn read<R: AsyncRead + Unpin>(
        reader: &mut ReadAhead<R>,
    ) -> Result<Option<Self>> {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffer())? {
                reader.consume(len);
                return Ok(Some(head));
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "request header section exceeds buffer limit",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid request head",
                )
                .into());
            }
        }
    }

    /// Parses a request head from a buffer, `None` when incomplete.
    ///
    /// Returns the length of the header section and the head.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => Self::from_httparse(req).map(|head| Some((len, head))),
        }
    }

    fn from_httparse(req: httparse::Request<'_, '_>) -> Result<Self> {
        let method: Method = req
            .method
            .context("missing method")?
            .parse()
            .std_context("invalid method")?;
        let target = req.path.context("missing request target")?.to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(anyerr!("unsupported HTTP version")),
        };
        let uri = if method == Method::CONNECT {
            // authority-form, handled from the raw target
            None
        } else {
            Some(Uri::from_str(&target).std_context("invalid request target")?)
        };
        let headers = collect_headers(req.headers)?;
        Ok(Self {
            method,
            target,
            uri,
            version,
            headers,
        })
    }

    /// The target to put on the outgoing request line. Always origin-form:
    /// the upstream sees `GET /path HTTP/1.1`, never the absolute form the
    /// client sent to the proxy.
    pub(crate) fn origin_form_target(&self) -> &str {
        match &self.uri {
            Some(uri) if uri.scheme().is_some() => {
                uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
            }
            _ if self.target.is_empty() => "/",
            _ => &self.target,
        }
    }

    /// Serializes the head for the upstream, origin-form and HTTP/1.1.
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.origin_form_target().as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        encode_headers(&self.headers, buf);
        buf.extend_from_slice(b"\r\n");
    }
}

/// One parsed HTTP/1.x response head.
#[derive(derive_more::Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as sent by the upstream, if any.
    pub reason: Option<String>,
    pub headers: HeaderMap<HeaderValue>,
}

impl ResponseHead {
    /// Reads one response head off the stream.
    pub(crate) async fn read<R: AsyncRead + Unpin>(reader: &mut ReadAhead<R>) -> Result<Self> {
        loop {
            if let Some((len, head)) = Self::parse(reader.buffer())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "response header section exceeds buffer limit",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before a complete response head",
                )
                .into());
            }
        }
    }

    /// Parses a response head from a buffer, `None` when incomplete.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    Some(1) => Version::HTTP_11,
                    _ => return Err(anyerr!("unsupported HTTP version")),
                };
                let status = StatusCode::from_u16(res.code.context("missing status code")?)
                    .std_context("invalid status code")?;
                let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
                let headers = collect_headers(res.headers)?;
                Ok(Some((
                    len,
                    Self {
                        version,
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Serializes the head for the client, preserving the upstream's
    /// protocol version and reason phrase.
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let reason = self
            .reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("");
        buf.extend_from_slice(version.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.status.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reason.as_bytes());
        buf.extend_from_slice(b"\r\n");
        encode_headers(&self.headers, buf);
        buf.extend_from_slice(b"\r\n");
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap<HeaderValue>> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name =
            HeaderName::from_bytes(header.name.as_bytes()).std_context("invalid header name")?;
        let value = HeaderValue::from_bytes(header.value).std_context("invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn encode_headers(headers: &HeaderMap<HeaderValue>, buf: &mut BytesMut) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

fn connection_has_token(headers: &HeaderMap<HeaderValue>, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The persistent-connection rule.
///
/// HTTP/1.0 closes by default unless `Connection: keep-alive`; 1.1 and
/// later keep the connection open unless `Connection: close`. Applied to a
/// response head it reports whether the sender will close its side.
pub(crate) fn wants_close(version: Version, headers: &HeaderMap<HeaderValue>) -> bool {
    if version == Version::HTTP_10 {
        !connection_has_token(headers, "keep-alive")
    } else {
        connection_has_token(headers, "close")
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body at all.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Delimited by the upstream closing its side (responses only).
    UntilClose,
}

/// Framing of a request body, from its headers.
pub(crate) fn request_body_framing(headers: &HeaderMap<HeaderValue>) -> Result<BodyFraming> {
    if transfer_encoding_is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::None),
        Some(len) => Ok(BodyFraming::Length(len)),
    }
}

/// Framing of a response body, given the request method it answers.
pub(crate) fn response_body_framing(
    request_method: &Method,
    status: StatusCode,
    headers: &HeaderMap<HeaderValue>,
) -> Result<BodyFraming> {
    if request_method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }
    if status.is_informational() {
        // 101 hands the stream over to another protocol
        return Ok(if status == StatusCode::SWITCHING_PROTOCOLS {
            BodyFraming::UntilClose
        } else {
            BodyFraming::None
        });
    }
    if transfer_encoding_is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(len) => Ok(BodyFraming::Length(len)),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn transfer_encoding_is_chunked(headers: &HeaderMap<HeaderValue>) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap<HeaderValue>) -> Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => {
            let len = value
                .to_str()
                .std_context("invalid Content-Length")?
                .trim()
                .parse::<u64>()
                .std_context("invalid Content-Length")?;
            Ok(Some(len))
        }
    }
}
