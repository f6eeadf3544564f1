//! SMTP submission listener

use crate::relay::Relay;
use crate::reload::ConfigHandle;
use crate::signing::SigningPipeline;
use crate::smtp::{Session, SessionLimits, SmtpHandler};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// SMTP Server
pub struct SmtpServer {
    config: Arc<ConfigHandle>,
    pipeline: Arc<SigningPipeline>,
    relay: Arc<dyn Relay>,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    /// Create a new SMTP server
    ///
    /// The connection limit is fixed at creation time.
    pub fn new(
        config: Arc<ConfigHandle>,
        pipeline: Arc<SigningPipeline>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let max_connections = config.current().server.max_connections;
        Self {
            config,
            pipeline,
            relay,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.current().server.address.clone();
        let listener = TcpListener::bind(&addr).await?;
        info!("SMTP server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            let domain = self.config.current().server.domain.clone();
                            tokio::spawn(reject_busy(stream, domain));
                            continue;
                        }
                    };

                    // Limits come from the snapshot current at connect time
                    let server_config = self.config.current().server.clone();
                    let session = Session::new(
                        SessionLimits::from(&server_config),
                        self.pipeline.clone(),
                        self.relay.clone(),
                    );
                    let handler = SmtpHandler::new(server_config, session, peer_addr.to_string());

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Tell a client over the connection limit to come back later
async fn reject_busy(mut stream: TcpStream, domain: String) {
    let reply = format!("421 4.3.2 {} Too many connections, try again later\r\n", domain);
    if let Err(e) = stream.write_all(reply.as_bytes()).await {
        debug!("Failed to send busy reply: {}", e);
    }
    let _ = stream.shutdown().await;
}
