//! TCP server for backup connections.
//!
//! Accepts connections and runs each one on its own task. Connections share
//! nothing but the storage backend.

use crate::config::Config;
use crate::protocols::backup::handle_connection;
use crate::storage::{Storage, StorageOptions};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
}

impl Server {
    /// Create a new server instance, preparing the storage directories.
    pub fn new(config: Config) -> io::Result<Self> {
        let storage = Storage::new(
            config.base_dir.clone(),
            StorageOptions {
                chunk_size: config.chunk_size,
                atomic_store: config.atomic_store,
                serialize_writes: config.serialize_writes,
            },
        )?;

        Ok(Server { config, storage })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = resolve_addr(&self.config.listen_addr())?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %addr, "Server listening");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let storage = Arc::clone(&self.storage);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, storage).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        debug!(peer = %addr, "Client disconnected");
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a reference to the storage (for testing)
    #[cfg(test)]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

fn resolve_addr(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' did not resolve to an address", listen),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
