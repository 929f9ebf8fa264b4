use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lmgate_common::ProxyPoolConfig;

use crate::pool::ResourcePool;

/// Named registry of egress proxy pools, built once at bootstrap from the
/// `proxy.<name>` config sections. An unconfigured or empty name yields
/// the null pool, so a Worker with no `proxy` setting never blocks on
/// egress.
pub struct ProxyFactory {
    pools: HashMap<String, Arc<ResourcePool>>,
    null_pool: Arc<ResourcePool>,
}

impl ProxyFactory {
    pub fn new(configs: &HashMap<String, ProxyPoolConfig>) -> Self {
        let mut pools = HashMap::new();
        for (name, cfg) in configs {
            pools.insert(name.clone(), build_pool(cfg));
        }
        Self {
            pools,
            null_pool: ResourcePool::null(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<ResourcePool> {
        if name.is_empty() {
            return self.null_pool.clone();
        }
        self.pools
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.null_pool.clone())
    }
}

fn build_pool(cfg: &ProxyPoolConfig) -> Arc<ResourcePool> {
    ResourcePool::with_renewal(
        cfg.initial.clone(),
        Duration::from_secs(cfg.cooldown_time),
        cfg.repeat,
        cfg.url.clone(),
        cfg.separator.clone(),
    )
}
