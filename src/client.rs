//! One client identity: a shard pool and a REST dispatcher built from one config.

use std::sync::Arc;

use tracing::info;

use crate::core::{ClientConfig, ClientResult};
use crate::rest::{HttpExecutor, ReqwestExecutor, RequestDispatcher};
use crate::shard::ShardCoordinator;
use crate::tls::install_rustls_crypto_provider;
use crate::transport::{GatewayTransport, TungsteniteTransport};

/// Explicit context for one bot identity. Several may live in one process; nothing is global.
pub struct Client<T: GatewayTransport> {
    config: Arc<ClientConfig>,
    gateway: ShardCoordinator<T>,
    rest: RequestDispatcher,
}

impl Client<TungsteniteTransport> {
    /// Real websocket transport and `reqwest` executor.
    pub fn connect_with(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        install_rustls_crypto_provider();
        let http = ReqwestExecutor::new(&config)?;
        Self::new(config, TungsteniteTransport::new(), Arc::new(http))
    }
}

impl<T: GatewayTransport> Client<T> {
    /// Validate `config` and build both halves. Fails before any connection attempt.
    /// Must run inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        transport: T,
        http: Arc<dyn HttpExecutor>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let rest = RequestDispatcher::new(&config, http);
        let gateway = ShardCoordinator::new(config.clone(), transport);
        info!(
            shards = config.shard_count,
            compression = ?config.compression,
            "client constructed"
        );
        Ok(Self {
            config,
            gateway,
            rest,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ShardCoordinator<T> {
        &self.gateway
    }

    pub fn rest(&self) -> &RequestDispatcher {
        &self.rest
    }

    pub async fn start(&self) -> ClientResult<()> {
        self.gateway.start().await
    }

    /// Close every shard. In-flight REST calls run to their own bounds.
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.gateway.shutdown().await
    }
}
