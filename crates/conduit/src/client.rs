//! One handle over the REST dispatcher and every gateway shard.

use crate::GetGatewayBot;
use conduit_core::{ConduitConfig, Credentials, GatewayConfig};
use conduit_error::ConduitResult;
use conduit_gateway::{
    Connector, EventRegistry, GatewayEvent, HandlerId, ShardManager, TungsteniteConnector,
};
use conduit_http::{Dispatcher, HttpTransport};
use conduit_rate_limit::IdentifyLimiter;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Bot client.
///
/// REST calls go through [`Client::dispatcher`]; gateway events arrive on
/// handlers registered with [`Client::on_event`] once [`Client::start`] has
/// connected the shards.
#[derive(Debug)]
pub struct Client {
    credentials: Credentials,
    gateway: GatewayConfig,
    dispatcher: Dispatcher,
    shards: ShardManager,
}

impl Client {
    /// Build a client on reqwest and tokio-tungstenite.
    ///
    /// With `gateway.shard_count = 0` the shard count, gateway URL and
    /// identify concurrency come from `GET /gateway/bot`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the HTTP client cannot
    /// be built, or the shard lookup fails.
    pub async fn new(config: ConduitConfig, credentials: Credentials) -> ConduitResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.rest.clone(), &credentials)?;
        Self::assemble(
            config.gateway,
            credentials,
            dispatcher,
            Arc::new(TungsteniteConnector),
        )
        .await
    }

    /// Build a client over caller-supplied transports.
    ///
    /// # Errors
    ///
    /// As [`Client::new`].
    pub async fn with_transports(
        config: ConduitConfig,
        credentials: Credentials,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn Connector>,
    ) -> ConduitResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::with_transport(config.rest.clone(), &credentials, http);
        Self::assemble(config.gateway, credentials, dispatcher, connector).await
    }

    #[instrument(skip_all, fields(shard_count = gateway.shard_count))]
    async fn assemble(
        mut gateway: GatewayConfig,
        credentials: Credentials,
        dispatcher: Dispatcher,
        connector: Arc<dyn Connector>,
    ) -> ConduitResult<Self> {
        if gateway.shard_count == 0 {
            let bot = dispatcher.send(&GetGatewayBot).await?;
            let limit = bot.session_start_limit;
            if limit.remaining == 0 {
                warn!(
                    reset_after_ms = limit.reset_after,
                    "No session starts left; identifies will be refused until reset"
                );
            }
            info!(
                shards = bot.shards,
                max_concurrency = limit.max_concurrency,
                remaining = limit.remaining,
                "Using recommended shard count"
            );
            gateway.url = bot.url;
            gateway.shard_count = bot.shards.max(1);
            gateway.identify_max_concurrency = limit.max_concurrency.max(1);
        }

        let identify = Arc::new(IdentifyLimiter::from_config(&gateway));
        let shards =
            ShardManager::with_limiter(gateway.clone(), gateway.shard_count, connector, identify)?;
        Ok(Self {
            credentials,
            gateway,
            dispatcher,
            shards,
        })
    }

    /// REST dispatcher. Clones share rate-limit state.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Gateway sessions, one per shard.
    pub fn shards(&self) -> &ShardManager {
        &self.shards
    }

    /// Gateway settings after shard resolution.
    pub fn gateway_config(&self) -> &GatewayConfig {
        &self.gateway
    }

    /// Registry shared by every shard.
    pub fn events(&self) -> &Arc<EventRegistry> {
        self.shards.events()
    }

    /// Run `handler` for every event named `name`, on any shard.
    pub fn on_event<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shards.events().on(name, handler)
    }

    /// Connect every shard.
    ///
    /// # Errors
    ///
    /// Returns the first shard that fails to connect.
    #[instrument(skip(self), fields(shards = self.shards.len()))]
    pub async fn start(&self) -> ConduitResult<()> {
        self.shards.connect_all(&self.credentials).await?;
        info!("Client started");
        Ok(())
    }

    /// Disconnect every shard.
    ///
    /// # Errors
    ///
    /// Returns the first shard that failed to close cleanly.
    #[instrument(skip(self), fields(shards = self.shards.len()))]
    pub async fn shutdown(&self) -> ConduitResult<()> {
        self.shards.disconnect_all().await?;
        info!("Client stopped");
        Ok(())
    }
}
