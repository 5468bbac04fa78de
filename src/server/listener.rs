//! Gateway listener
//!
//! Handles the TCP accept loop and spawns connection handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::fanout::{Broker, MemoryBroker, RedisBroker};
use crate::server::config::{GatewayConfig, StoreBackend};
use crate::server::connection::Connection;
use crate::server::gateway::Gateway;
use crate::store::{CacheStore, MemoryStore, RedisStore};

/// Gateway server
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl GatewayServer {
    /// Create a server over already connected adapters
    pub fn new(config: GatewayConfig, store: Arc<dyn CacheStore>, broker: Arc<dyn Broker>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            gateway: Arc::new(Gateway::new(config, store, broker)),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Create a server with the adapters selected by `config.store`
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let (store, broker): (Arc<dyn CacheStore>, Arc<dyn Broker>) = match config.store {
            StoreBackend::Redis => {
                let store = RedisStore::connect(&config.redis_url)
                    .await?
                    .default_ttl(config.cache_ttl);
                let broker = RedisBroker::connect(&config.redis_url).await?;
                (Arc::new(store), Arc::new(broker))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; state is not shared between nodes");
                (
                    Arc::new(MemoryStore::new().default_ttl(config.cache_ttl)),
                    Arc::new(MemoryBroker::new()),
                )
            }
        };

        Ok(Self::new(config, store, broker))
    }

    /// Get a reference to the gateway
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let bind_addr = self.gateway.config().bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        tracing::info!(
            addr = %bind_addr,
            node_id = %self.gateway.config().node_id,
            "Gateway listening"
        );

        let cancel = CancellationToken::new();
        let subscribers = self.gateway.start_subscribers(&cancel).await?;

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        // Let in-flight deliveries finish
        cancel.cancel();
        for handle in subscribers {
            let _ = handle.await;
        }

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = socket.set_nodelay(true) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let gateway = Arc::clone(&self.gateway);

        tokio::spawn(async move {
            let _permit = permit;
            let mut connection = Connection::new(session_id, socket, peer_addr, gateway);

            if let Err(e) = connection.run().await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.gateway.config().bind_addr
    }
}
