//! Plain-HTTP forwarding through the shared upstream connection pool.
//!
//! One call forwards one exchange: the sanitized head and any request body
//! travel to the upstream in origin-form HTTP/1.1, the response streams
//! back through pooled buffers, and the connection returns to the pool
//! when neither side asked to close.
//!
//! The upstream dial is always plain TCP. An https absolute-form target
//! keeps port 443 but is not wrapped in TLS; this gateway terminates
//! nothing and trusts its LAN side, so the downgrade is intentional
//! behavior rather than an oversight.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::Mutex,
    time::Duration,
};

use http::{
    HeaderValue, Uri,
    header::{CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION},
};
use n0_error::{anyerr, e, AnyError};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    time::{Instant, timeout},
};
use tracing::{debug, trace};

use crate::{
    config::{HEADER_SECTION_MAX_LENGTH, PoolConfig},
    deadline::{DeadlineRead, DeadlineWrite},
    error::SessionError,
    parse::{
        Authority, BodyFraming, RequestHead, ResponseHead, request_body_framing,
        response_body_framing, wants_close,
    },
    session::Proxy,
    util::{ReadAhead, copy_chunked, copy_exact, copy_until_eof},
};

/// Resolves the upstream authority for a non-CONNECT request.
///
/// The absolute-form target's own scheme and authority win; the `Host`
/// header is the fallback, with any scheme prefix stripped via URI
/// parsing. Port defaults to 80, or 443 when the scheme was https.
pub(crate) fn resolve_target(head: &RequestHead) -> Result<Authority, SessionError> {
    if let Some(uri) = head.uri.as_ref() {
        if let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
            let host = authority.host().trim_start_matches('[').trim_end_matches(']');
            let port = authority.port_u16().unwrap_or(default_port(scheme));
            return Ok(Authority {
                host: host.to_string(),
                port,
            });
        }
    }

    let host_value = head
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| e!(SessionError::BadRequest, anyerr!("request names no target host")))?;

    if host_value.contains("://") {
        let uri = Uri::from_str(host_value)
            .map_err(|err| e!(SessionError::BadRequest, AnyError::from_std(err)))?;
        let authority = uri
            .authority()
            .ok_or_else(|| e!(SessionError::BadRequest, anyerr!("host header has no authority")))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        let port = authority
            .port_u16()
            .unwrap_or(default_port(uri.scheme_str().unwrap_or("http")));
        return Ok(Authority {
            host: host.to_string(),
            port,
        });
    }

    Authority::parse_with_default(host_value, 80)
        .ok_or_else(|| e!(SessionError::BadRequest, anyerr!("invalid host header")))
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Strips proxy-only and hop-by-hop headers and fixes up the outgoing
/// head: `Connection` is re-synthesized from the close rule, and a
/// missing `Host` is filled with the resolved authority.
fn sanitize_request(head: &mut RequestHead, target: &Authority, close: bool) {
    head.headers.remove("proxy-connection");
    head.headers.remove(PROXY_AUTHENTICATE);
    head.headers.remove(PROXY_AUTHORIZATION);
    head.headers.remove(CONNECTION);
    if close {
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    if !head.headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&target.to_string()) {
            head.headers.insert(HOST, value);
        }
    }
}

struct ExchangeOutcome {
    close_client: bool,
    reuse_upstream: bool,
}

impl Proxy {
    /// Forwards one plain HTTP exchange. Returns whether the client
    /// connection must close afterwards. Never retries, never keeps
    /// partial state across calls.
    pub(crate) async fn forward_exchange(
        &self,
        client_rd: &mut ReadAhead<DeadlineRead<OwnedReadHalf>>,
        client_wr: &mut DeadlineWrite<OwnedWriteHalf>,
        mut head: RequestHead,
    ) -> Result<bool, SessionError> {
        let target = resolve_target(&head)?;
        let close_requested = wants_close(head.version, &head.headers);
        let req_framing = request_body_framing(&head.headers)
            .map_err(|source| e!(SessionError::BadRequest { source }))?;
        debug!(%target, method = %head.method, "forward");

        sanitize_request(&mut head, &target, close_requested);

        let mut conn = self
            .upstreams
            .checkout(&target, self.config.connect_timeout)
            .await?;
        trace!(reused = conn.reused, "upstream connection ready");

        let outcome = self
            .run_exchange(client_rd, client_wr, &head, req_framing, close_requested, &mut conn)
            .await?;

        if outcome.reuse_upstream {
            self.upstreams.checkin(conn);
        }
        Ok(outcome.close_client)
    }

    async fn run_exchange(
        &self,
        client_rd: &mut ReadAhead<DeadlineRead<OwnedReadHalf>>,
        client_wr: &mut DeadlineWrite<OwnedWriteHalf>,
        head: &RequestHead,
        req_framing: BodyFraming,
        close_requested: bool,
        conn: &mut UpstreamConn,
    ) -> Result<ExchangeOutcome, SessionError> {
        let body_timeout = self.config.body_timeout;

        // Request head and body toward the upstream. Everything up to the
        // response head is an upstream failure as far as the client is
        // concerned: a synthetic 502 is still possible.
        {
            let mut up_wr = DeadlineWrite::new(&mut conn.stream, body_timeout);
            let mut scratch = self.scratch.acquire();
            head.encode(&mut scratch);
            up_wr
                .write_all(&scratch)
                .await
                .map_err(|err| e!(SessionError::Upstream, err.into()))?;
            drop(scratch);

            if req_framing != BodyFraming::None {
                client_rd.get_mut().set_idle(body_timeout);
                let mut buf = self.buffers.acquire();
                let copied = match req_framing {
                    BodyFraming::Length(len) => {
                        copy_exact(client_rd, &mut up_wr, len, &mut buf).await
                    }
                    BodyFraming::Chunked => copy_chunked(client_rd, &mut up_wr, &mut buf).await,
                    BodyFraming::None | BodyFraming::UntilClose => Ok(()),
                };
                client_rd.get_mut().clear_idle();
                copied.map_err(|err| e!(SessionError::Upstream, err.into()))?;
            }
        }

        // Response phase.
        client_wr.set_idle(body_timeout);
        let result = self
            .pipe_response(client_wr, head, close_requested, conn)
            .await;
        client_wr.clear_idle();
        result
    }

    async fn pipe_response(
        &self,
        client_wr: &mut DeadlineWrite<OwnedWriteHalf>,
        head: &RequestHead,
        close_requested: bool,
        conn: &mut UpstreamConn,
    ) -> Result<ExchangeOutcome, SessionError> {
        let mut up_rd = ReadAhead::new(
            DeadlineRead::new(&mut conn.stream, self.config.body_timeout),
            HEADER_SECTION_MAX_LENGTH,
        );

        let mut resp = ResponseHead::read(&mut up_rd)
            .await
            .map_err(|source| e!(SessionError::Upstream { source }))?;

        // Interim responses are forwarded as-is; the final head follows.
        while resp.status.is_informational()
            && resp.status != http::StatusCode::SWITCHING_PROTOCOLS
        {
            trace!(status = %resp.status, "interim response");
            let mut scratch = self.scratch.acquire();
            resp.encode(&mut scratch);
            client_wr.write_all(&scratch).await?;
            drop(scratch);
            resp = ResponseHead::read(&mut up_rd)
                .await
                .map_err(|source| e!(SessionError::Upstream { source }))?;
        }

        let resp_framing = response_body_framing(&head.method, resp.status, &resp.headers)
            .map_err(|source| e!(SessionError::Upstream { source }))?;

        let close_after = close_requested
            || wants_close(resp.version, &resp.headers)
            || resp_framing == BodyFraming::UntilClose;
        if close_after {
            resp.headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        debug!(status = %resp.status, ?resp_framing, close_after, "response");

        let mut scratch = self.scratch.acquire();
        resp.encode(&mut scratch);
        client_wr.write_all(&scratch).await?;
        drop(scratch);

        if resp_framing != BodyFraming::None {
            let mut buf = self.buffers.acquire();
            match resp_framing {
                BodyFraming::Length(len) => {
                    copy_exact(&mut up_rd, client_wr, len, &mut buf).await?
                }
                BodyFraming::Chunked => copy_chunked(&mut up_rd, client_wr, &mut buf).await?,
                BodyFraming::UntilClose => {
                    copy_until_eof(&mut up_rd, client_wr, &mut buf).await.map(|_| ())?
                }
                BodyFraming::None => {}
            }
        }
        client_wr.flush().await?;

        // Bytes past the response end mean the framing cannot be trusted.
        let reuse_upstream = !close_after && up_rd.buffer().is_empty();
        Ok(ExchangeOutcome {
            close_client: close_after,
            reuse_upstream,
        })
    }
}

/// Keyed cache of idle upstream connections, shared by all sessions.
///
/// Bounded in total and per destination; parked entries expire lazily at
/// checkout. A failed checkout or exchange never retries and never
/// poisons the pool.
#[derive(Debug)]
pub(crate) struct UpstreamPool {
    config: PoolConfig,
    idle: Mutex<IdleConns>,
}

#[derive(Debug, Default)]
struct IdleConns {
    by_authority: HashMap<String, Vec<ParkedConn>>,
    total: usize,
}

#[derive(Debug)]
struct ParkedConn {
    stream: TcpStream,
    parked_at: Instant,
}

/// One checked-out upstream connection.
#[derive(Debug)]
pub(crate) struct UpstreamConn {
    stream: TcpStream,
    key: String,
    reused: bool,
}

impl UpstreamPool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(IdleConns::default()),
        }
    }

    /// Reuses an idle connection to `target` or dials a new one within
    /// `connect_timeout`.
    pub(crate) async fn checkout(
        &self,
        target: &Authority,
        connect_timeout: Duration,
    ) -> Result<UpstreamConn, SessionError> {
        let key = target.to_string();
        if let Some(stream) = self.take_idle(&key) {
            return Ok(UpstreamConn {
                stream,
                key,
                reused: true,
            });
        }

        let addr = target.dial_addr();
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| e!(SessionError::Upstream, anyerr!("connect to {addr} timed out")))?
            .map_err(|err| e!(SessionError::Upstream, err.into()))?;
        Ok(UpstreamConn {
            stream,
            key,
            reused: false,
        })
    }

    /// Parks a connection for reuse, unless the pool bounds say otherwise.
    pub(crate) fn checkin(&self, conn: UpstreamConn) {
        let mut idle = self.idle.lock().expect("upstream pool lock");
        if idle.total >= self.config.max_idle {
            return;
        }
        let parked = idle.by_authority.entry(conn.key).or_default();
        if parked.len() >= self.config.max_idle_per_host {
            return;
        }
        parked.push(ParkedConn {
            stream: conn.stream,
            parked_at: Instant::now(),
        });
        idle.total += 1;
    }

    fn take_idle(&self, key: &str) -> Option<TcpStream> {
        let mut idle = self.idle.lock().expect("upstream pool lock");
        let parked = idle.by_authority.get_mut(key)?;
        let mut found = None;
        while let Some(conn) = parked.pop() {
            if conn.parked_at.elapsed() <= self.config.idle_expiry {
                found = Some(conn.stream);
                break;
            }
            // expired entries are simply dropped
        }
        if parked.is_empty() {
            idle.by_authority.remove(key);
        }
        idle.total = idle.by_authority.values().map(Vec::len).sum();
        found
    }
}
