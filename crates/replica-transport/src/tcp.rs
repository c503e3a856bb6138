//! TCP transport for the storage service

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::error::ChannelResult;
use crate::service::StorageService;

/// TCP server hosting a [`StorageService`]
pub struct TcpServer {
    service: StorageService,
    addr: SocketAddr,
    client_counter: Arc<AtomicU64>,
}

impl TcpServer {
    pub fn new(service: StorageService, addr: SocketAddr) -> Self {
        Self {
            service,
            addr,
            client_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(&self) -> ChannelResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> ChannelResult<()> {
        info!(addr = %listener.local_addr()?, "Replica TCP server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let service = self.service.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, &client_id, service).await {
                            error!(client = %client_id, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, client_id: &str, service: StorageService) -> ChannelResult<()> {
        stream.set_nodelay(true)?;
        service.serve(stream, client_id).await
    }
}
