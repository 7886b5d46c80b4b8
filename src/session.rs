//! Shared proxy state and the per-connection control loop.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::Method;
use n0_error::{Result, e};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    allow::AllowList,
    config::{HEADER_SECTION_MAX_LENGTH, ProxyConfig},
    deadline::{DeadlineRead, DeadlineWrite},
    error::{ConfigError, SessionError},
    forward::UpstreamPool,
    parse::{RequestHead, wants_close},
    pool::{BufferPool, ScratchPool},
    util::{ReadAhead, send_error_response},
};

/// The proxy: immutable configuration, the allow list, and the pools
/// shared by every connection.
#[derive(Debug)]
pub struct Proxy {
    pub(crate) config: ProxyConfig,
    pub(crate) allow: AllowList,
    pub(crate) upstreams: UpstreamPool,
    pub(crate) buffers: BufferPool,
    pub(crate) scratch: ScratchPool,
}

impl Proxy {
    /// Builds the shared proxy state. Fails on an invalid allow
    /// specification, before anything starts listening.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let allow = AllowList::parse(&config.allow)?;
        let upstreams = UpstreamPool::new(config.pool.clone());
        Ok(Self {
            config,
            allow,
            upstreams,
            buffers: BufferPool::default(),
            scratch: ScratchPool::default(),
        })
    }

    /// Accepts connections and serves each in its own task.
    ///
    /// Runs until the listener fails. Dropping the returned future reaps
    /// the connection tasks through the cancellation guard.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let mut id: u64 = 0;
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%peer, "accepted connection");
                        if let Err(err) = this.handle_client(stream, peer).await {
                            match &err {
                                SessionError::NotAllowed { .. } => info!("{err:#}"),
                                _ => warn!("connection closed with error: {err:#}"),
                            }
                        }
                    })
                    .instrument(error_span!("client", id)),
            );
            id += 1;
        }
    }

    /// One client connection: admission once, then requests until
    /// something closes the session.
    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        let addr = peer.ip();
        if !self.allow.is_allowed(addr) {
            // Silent close: a filtered client cannot tell admission from a
            // network error.
            return Err(e!(SessionError::NotAllowed { addr }));
        }

        let (read_half, write_half) = stream.into_split();
        let mut client_rd = ReadAhead::new(
            DeadlineRead::new(read_half, Duration::ZERO),
            HEADER_SECTION_MAX_LENGTH,
        );
        let mut client_wr = DeadlineWrite::new(write_half, Duration::ZERO);

        loop {
            client_rd.get_mut().set_idle(self.config.header_timeout);
            let head = match RequestHead::read(&mut client_rd).await {
                Ok(Some(head)) => head,
                // clean end of stream at a request boundary
                Ok(None) => return Ok(()),
                Err(err) => {
                    debug!("failed to read request: {err:#}");
                    return Ok(());
                }
            };
            client_rd.get_mut().clear_idle();

            if head.method == Method::CONNECT {
                // A tunnel consumes the connection for good.
                let res = self.tunnel(&mut client_rd, &mut client_wr, &head).await;
                return self.finish(res, &mut client_wr).await;
            }

            let close_requested = wants_close(head.version, &head.headers);
            match self
                .forward_exchange(&mut client_rd, &mut client_wr, head)
                .await
            {
                Ok(close_after) => {
                    if close_after || close_requested {
                        return Ok(());
                    }
                }
                Err(err) => return self.finish(Err(err), &mut client_wr).await,
            }
        }
    }

    /// Sends the synthetic response owed for `res`, if any, and hands the
    /// error up so the accept loop can log it.
    async fn finish(
        &self,
        res: Result<(), SessionError>,
        client_wr: &mut DeadlineWrite<tokio::net::tcp::OwnedWriteHalf>,
    ) -> Result<(), SessionError> {
        if let Err(err) = &res {
            if let Some(status) = err.response_status() {
                send_error_response(client_wr, status).await.ok();
            }
        }
        res
    }
}
