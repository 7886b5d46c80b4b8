//! CONNECT tunneling: an opaque bidirectional relay the proxy never
//! decrypts or inspects.

use n0_error::{anyerr, e};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::debug;

use crate::{
    deadline::{DeadlineRead, DeadlineWrite},
    error::SessionError,
    parse::{Authority, RequestHead},
    pool::BufferPool,
    session::Proxy,
    util::{ReadAhead, copy_until_eof},
};

/// The confirmation clients expect, byte for byte: no headers, this exact
/// status line.
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Resolves the CONNECT target from the request's own authority-form
/// target, never from headers. CONNECT carries no scheme; 443 is the
/// default port because HTTPS is its one use case through this gateway.
pub(crate) fn connect_target(head: &RequestHead) -> Result<Authority, SessionError> {
    let target = head.target.trim();
    if target.is_empty() {
        return Err(e!(
            SessionError::BadRequest,
            anyerr!("CONNECT without authority")
        ));
    }
    Authority::parse_with_default(target, 443).ok_or_else(|| {
        e!(
            SessionError::BadRequest,
            anyerr!("invalid CONNECT authority {target:?}")
        )
    })
}

impl Proxy {
    /// Establishes and relays one CONNECT tunnel.
    ///
    /// Terminal for the session: the connection carries opaque bytes for
    /// its remaining lifetime and no further requests are read from it.
    /// The relay completes only once both directions have finished.
    pub(crate) async fn tunnel(
        &self,
        client_rd: &mut ReadAhead<DeadlineRead<OwnedReadHalf>>,
        client_wr: &mut DeadlineWrite<OwnedWriteHalf>,
        head: &RequestHead,
    ) -> Result<(), SessionError> {
        let target = connect_target(head)?;
        debug!(%target, "tunnel");

        let addr = target.dial_addr();
        let upstream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| e!(SessionError::Upstream, anyerr!("connect to {addr} timed out")))?
            .map_err(|err| e!(SessionError::Upstream, err.into()))?;

        // A failure here aborts silently: the tunnel never started.
        client_wr.write_all(CONNECT_ESTABLISHED).await?;

        let idle = self.config.idle_timeout;
        client_rd.get_mut().set_idle(idle);
        client_wr.set_idle(idle);
        let (up_rd, up_wr) = upstream.into_split();
        let mut up_rd = DeadlineRead::new(up_rd, idle);
        let mut up_wr = DeadlineWrite::new(up_wr, idle);

        // Bytes already read past the CONNECT head sit in `client_rd` and
        // drain into the relay first.
        let (to_upstream, to_client) = tokio::join!(
            relay_direction(client_rd, &mut up_wr, &self.buffers),
            relay_direction(&mut up_rd, client_wr, &self.buffers),
        );
        debug!(?to_upstream, ?to_client, "tunnel finished");
        Ok(())
    }
}

/// Copies one direction until end of stream or error, then half-closes
/// the destination so the opposite direction can keep draining.
async fn relay_direction(
    src: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    buffers: &BufferPool,
) -> io::Result<u64> {
    let mut buf = buffers.acquire();
    let result = copy_until_eof(src, dst, &mut buf).await;
    dst.shutdown().await.ok();
    result
}
