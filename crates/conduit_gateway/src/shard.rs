//! Sessions for every shard of one account.

use crate::{Connector, EventRegistry, SessionPhase, ShardInfo, StreamingSession};
use conduit_core::{Credentials, GatewayConfig};
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult};
use conduit_rate_limit::IdentifyLimiter;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Shard that receives events for `guild_id` out of `shard_count` shards.
pub fn shard_for_guild(guild_id: u64, shard_count: u32) -> u32 {
    ((guild_id >> 22) % u64::from(shard_count.max(1))) as u32
}

/// Owns one [`StreamingSession`] per shard.
///
/// All shards share one identify limiter, so identifies go out in shard
/// order no faster than the account allows, and one event registry.
#[derive(Debug)]
pub struct ShardManager {
    shards: Vec<StreamingSession>,
    events: Arc<EventRegistry>,
    identify: Arc<IdentifyLimiter>,
}

impl ShardManager {
    /// Create `shard_count` sessions, pacing identifies per `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShardCount` if `shard_count` is zero.
    pub fn new(
        config: GatewayConfig,
        shard_count: u32,
        connector: Arc<dyn Connector>,
    ) -> GatewayResult<Self> {
        let identify = Arc::new(IdentifyLimiter::from_config(&config));
        Self::with_limiter(config, shard_count, connector, identify)
    }

    /// Create `shard_count` sessions sharing `identify`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShardCount` if `shard_count` is zero.
    pub fn with_limiter(
        config: GatewayConfig,
        shard_count: u32,
        connector: Arc<dyn Connector>,
        identify: Arc<IdentifyLimiter>,
    ) -> GatewayResult<Self> {
        if shard_count == 0 {
            return Err(GatewayError::new(GatewayErrorKind::InvalidShardCount(
                shard_count,
            )));
        }
        let events = Arc::new(EventRegistry::new());
        let shards = (0..shard_count)
            .map(|index| {
                StreamingSession::for_shard(
                    config.clone(),
                    ShardInfo::new(index, shard_count),
                    Arc::clone(&connector),
                    Arc::clone(&identify),
                    Arc::clone(&events),
                )
            })
            .collect();
        Ok(Self {
            shards,
            events,
            identify,
        })
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false; a manager has at least one shard.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Registry shared by every shard.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// Identify limiter shared by every shard.
    pub fn identify_limiter(&self) -> &Arc<IdentifyLimiter> {
        &self.identify
    }

    /// Session for shard `index`.
    pub fn shard(&self, index: u32) -> Option<&StreamingSession> {
        self.shards.get(index as usize)
    }

    /// All sessions in shard order.
    pub fn shards(&self) -> &[StreamingSession] {
        &self.shards
    }

    /// Session that receives events for `guild_id`.
    pub fn shard_for_guild(&self, guild_id: u64) -> &StreamingSession {
        let index = shard_for_guild(guild_id, self.shards.len() as u32) as usize;
        &self.shards[index]
    }

    /// Phase of every shard, in shard order.
    pub fn statuses(&self) -> Vec<(u32, SessionPhase)> {
        self.shards
            .iter()
            .map(|session| (session.shard().index, session.phase()))
            .collect()
    }

    /// Connect every shard in index order, each waiting for READY before the
    /// next identifies.
    ///
    /// # Errors
    ///
    /// Returns the first shard's error. Shards connected before it stay
    /// connected.
    #[instrument(skip(self, credentials), fields(shards = self.shards.len()))]
    pub async fn connect_all(&self, credentials: &Credentials) -> GatewayResult<()> {
        for session in &self.shards {
            session.connect(credentials).await?;
            info!(shard = %session.shard(), "Shard connected");
        }
        Ok(())
    }

    /// Disconnect every running shard.
    ///
    /// # Errors
    ///
    /// Returns the first error other than `NotConnected`, after attempting
    /// every shard.
    #[instrument(skip(self), fields(shards = self.shards.len()))]
    pub async fn disconnect_all(&self) -> GatewayResult<()> {
        let mut first_error = None;
        for session in &self.shards {
            match session.disconnect().await {
                Ok(()) => {}
                Err(e) if *e.kind() == GatewayErrorKind::NotConnected => {}
                Err(e) => {
                    warn!(shard = %session.shard(), error = %e, "Shard did not disconnect cleanly");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guild_shard_routing() {
        // Guild id with timestamp bits 1 shifted into place.
        assert_eq!(shard_for_guild(1 << 22, 4), 1);
        assert_eq!(shard_for_guild(5 << 22, 4), 1);
        assert_eq!(shard_for_guild(81384788765712384, 1), 0);
        assert_eq!(
            shard_for_guild(81384788765712384, 16),
            ((81384788765712384u64 >> 22) % 16) as u32
        );
        assert_eq!(shard_for_guild(42, 0), 0);
    }

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait::async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _url: &str) -> GatewayResult<crate::Connection> {
            Err(GatewayError::new(GatewayErrorKind::Transport(
                "no network in unit tests".to_string(),
            )))
        }
    }

    #[test]
    fn test_zero_shards_is_an_argument_error() {
        let err = ShardManager::new(GatewayConfig::default(), 0, Arc::new(Unreachable))
            .expect_err("zero shards");
        assert_eq!(*err.kind(), GatewayErrorKind::InvalidShardCount(0));
        assert!(!err.kind().is_retryable());
    }
}
