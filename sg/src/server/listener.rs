//! Accept loop for the broker server

use std::net::SocketAddr;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionContext, serve};
use crate::broker::BrokerHandle;
use crate::config::ServerConfig;

/// TCP front end for a broker
pub struct BrokerServer {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl BrokerServer {
    /// Bind the listen address from `config`; port 0 picks a free port
    pub async fn bind(config: &ServerConfig, broker: BrokerHandle) -> Result<Self> {
        debug!(listen = %config.listen, "BrokerServer::bind: called");
        let listener = TcpListener::bind(&config.listen)
            .await
            .context(format!("Failed to bind {}", config.listen))?;

        let ctx = ConnectionContext {
            server_id: Uuid::now_v7().to_string(),
            auth_token: config.auth_token.clone(),
            max_payload_bytes: config.max_payload_bytes,
            max_frame_bytes: config.max_frame_bytes(),
            broker,
        };

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read listen address")
    }

    pub fn server_id(&self) -> &str {
        &self.ctx.server_id
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), server_id = %self.ctx.server_id, "Broker server listening");

        loop {
            tokio::select! {
                result = shutdown.wait_for(|stop| *stop) => {
                    if result.is_err() {
                        debug!("BrokerServer::run: shutdown sender dropped");
                    }
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted connection");
                            tokio::spawn(serve(stream, self.ctx.clone()));
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        info!("Broker server stopped");
        Ok(())
    }
}
