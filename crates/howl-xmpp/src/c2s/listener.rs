//! C2S listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::C2sContext;
use crate::transport::Transport;
use crate::XmppError;

/// Accepts client connections and runs a stream task for each.
pub struct C2sListener {
    listener: TcpListener,
    ctx: Arc<C2sContext>,
}

impl C2sListener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<C2sContext>) -> Result<Self, XmppError> {
        if ctx.config.direct_tls && ctx.tls.is_none() {
            return Err(XmppError::config("direct TLS C2S listener without certificates"));
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Streams already running
    /// are closed through the C2S hub.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        let direct_tls = self.ctx.config.direct_tls;
        info!(addr = %self.local_addr()?, direct_tls, "XMPP C2S server listening");

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept C2S connection");
                        continue;
                    }
                },
            };
            if let Err(e) = socket.set_nodelay(true) {
                warn!(error = %e, "Failed to set TCP_NODELAY");
            }

            let ctx = self.ctx.clone();
            tokio::spawn(
                async move {
                    let transport = match (&ctx.tls, direct_tls) {
                        (Some(acceptor), true) => match Transport::accept_tls(socket, acceptor).await {
                            Ok(transport) => transport,
                            Err(e) => {
                                warn!(error = %e, "C2S TLS handshake failed");
                                return;
                            }
                        },
                        _ => Transport::new(socket),
                    };
                    ctx.serve(transport).await;
                }
                .instrument(info_span!(
                    "xmpp.c2s.connection.lifecycle",
                    client_ip = %peer_addr,
                    transport = if direct_tls { "tcp+tls" } else { "tcp" },
                )),
            );
        }
        info!("XMPP C2S listener stopped");
        Ok(())
    }
}
