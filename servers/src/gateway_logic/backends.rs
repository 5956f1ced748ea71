//! Wiring of the hub's infrastructure backends.
//!
//! Redis is preferred for both the cluster bus and the statistics store. When
//! it cannot be reached at startup the gateway still serves this instance's
//! clients: fan-out falls back to the in-process bus and statistics are off.

use std::sync::Arc;
use std::time::Duration;

use lib_gateway::configs::GatewayConfig;
use lib_gateway::connections::{ClusterBus, MemoryBus, RedisBus, RedisStatsStore};
use lib_gateway::core::StatsStore;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus and statistics store chosen for this process.
pub struct Backends {
    pub bus: Arc<dyn ClusterBus>,
    pub stats: Option<Arc<dyn StatsStore>>,
}

/// Connects to Redis, degrading to local-only operation on failure.
pub async fn connect(config: &GatewayConfig) -> Backends {
    let Some(url) = config.redis_url.as_deref().filter(|u| !u.is_empty()) else {
        warn!("no redis url configured, running single-instance without statistics");
        return local_only();
    };

    let bus: Arc<dyn ClusterBus> = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        RedisBus::connect(url),
    )
    .await
    {
        Ok(Ok(bus)) => {
            info!("cluster bus connected to redis");
            Arc::new(bus)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "redis bus unavailable, fan-out is local only");
            Arc::new(MemoryBus::new())
        }
        Err(_) => {
            warn!("redis bus connect timed out, fan-out is local only");
            Arc::new(MemoryBus::new())
        }
    };

    let stats: Option<Arc<dyn StatsStore>> = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        RedisStatsStore::connect(url, config.stats_prefix()),
    )
    .await
    {
        Ok(Ok(store)) => Some(Arc::new(store)),
        Ok(Err(e)) => {
            warn!(error = %e, "redis stats store unavailable, statistics disabled");
            None
        }
        Err(_) => {
            warn!("redis stats store connect timed out, statistics disabled");
            None
        }
    };

    Backends { bus, stats }
}

fn local_only() -> Backends {
    Backends {
        bus: Arc::new(MemoryBus::new()),
        stats: None,
    }
}
