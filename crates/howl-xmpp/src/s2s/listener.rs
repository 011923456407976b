//! S2S listener.
//!
//! Accepts connections from remote servers on port 5269 (STARTTLS) or on a
//! direct TLS port (XEP-0368) and runs an in-stream for each.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::in_stream::InStreamContext;
use crate::transport::Transport;
use crate::XmppError;

/// S2S listener accepting connections from remote XMPP servers.
pub struct S2sListener {
    listener: TcpListener,
    ctx: Arc<InStreamContext>,
    direct_tls: bool,
}

impl S2sListener {
    /// Bind `addr`. With `direct_tls`, TLS is negotiated before the stream
    /// header and the context's acceptor is required.
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<InStreamContext>,
        direct_tls: bool,
    ) -> Result<Self, XmppError> {
        if direct_tls && ctx.tls.is_none() {
            return Err(XmppError::config("direct TLS S2S listener without certificates"));
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx,
            direct_tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        info!(addr = %self.local_addr()?, direct_tls = self.direct_tls, "XMPP S2S server listening");

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept S2S connection");
                        continue;
                    }
                },
            };
            let ctx = self.ctx.clone();
            let direct_tls = self.direct_tls;
            tokio::spawn(
                async move {
                    let transport = match (&ctx.tls, direct_tls) {
                        (Some(acceptor), true) => match Transport::accept_tls(socket, acceptor).await {
                            Ok(transport) => transport,
                            Err(e) => {
                                warn!(error = %e, "S2S TLS handshake failed");
                                return;
                            }
                        },
                        _ => Transport::new(socket),
                    };
                    ctx.serve(transport).await;
                }
                .instrument(info_span!(
                    "xmpp.s2s.connection.lifecycle",
                    peer_ip = %peer_addr,
                    transport = if direct_tls { "tcp+tls" } else { "tcp" },
                )),
            );
        }
        info!("XMPP S2S listener stopped");
        Ok(())
    }
}
