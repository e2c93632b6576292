//! Isolated per-instance connection pools.
//!
//! One bounded deadpool per target instance, created on first use and
//! scoped exclusively to webhook traffic. These pools are never shared
//! with, or derived from, any other subsystem's connections; a runaway
//! webhook can exhaust at most `max_size` connections on its own instance.

use crate::config::PoolSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::SqlExecutor;
use crate::instances::ConnectCoords;
use crate::security::QueryKind;
use crate::types::{FieldDesc, QueryOutput};
use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{NoTls, SimpleQueryMessage};

pub struct PoolRegistry {
    pools: DashMap<String, Pool>,
    settings: PoolSettings,
}

impl PoolRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
        }
    }

    fn build_pool(&self, coords: &ConnectCoords) -> GatewayResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(coords.host.clone());
        cfg.port = Some(coords.port);
        cfg.dbname = Some(coords.dbname.clone());
        cfg.user = Some(coords.user.clone());
        cfg.password = Some(coords.password.clone());
        // Server-side statement timeout for every connection in the pool.
        cfg.options = Some(format!(
            "-c statement_timeout={}",
            self.settings.statement_timeout_ms
        ));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = PoolConfig::new(self.settings.max_size);
        pool_cfg.timeouts.wait = Some(self.settings.wait_timeout);
        pool_cfg.timeouts.create = Some(self.settings.connect_timeout);
        pool_cfg.timeouts.recycle = Some(self.settings.recycle_timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| GatewayError::Internal(format!("failed to create pool: {e}")))
    }

    /// Pool for an instance, created lazily. Creation is idempotent under
    /// concurrent first use: the entry lock makes the second caller reuse
    /// the first caller's pool.
    pub fn get_or_create(&self, instance_id: &str, coords: &ConnectCoords) -> GatewayResult<Pool> {
        if let Some(existing) = self.pools.get(instance_id) {
            return Ok(existing.clone());
        }
        use dashmap::mapref::entry::Entry;
        match self.pools.entry(instance_id.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let pool = self.build_pool(coords)?;
                tracing::info!(instance_id, "isolated webhook pool created");
                vacant.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    /// Close and evict every pool with zero checked-out connections.
    /// Returns the number evicted. Pools with in-flight checkouts are left
    /// alone and picked up by a later sweep.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        self.pools.retain(|instance_id, pool| {
            let status = pool.status();
            let idle = status.size == status.available;
            if idle {
                pool.close();
                tracing::debug!(instance_id = %instance_id, "idle webhook pool evicted");
                evicted += 1;
            }
            !idle
        });
        evicted
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let evicted = registry.sweep();
                if evicted > 0 {
                    tracing::info!(evicted, "webhook pool sweep");
                }
            }
        })
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

fn map_pool_error(err: PoolError) -> GatewayError {
    match err {
        PoolError::Timeout(_) => GatewayError::PoolTimeout,
        PoolError::Backend(e) => GatewayError::ExecutionFailed(e.to_string()),
        other => GatewayError::Internal(format!("pool failure: {other}")),
    }
}

/// Fold simple-protocol messages into the wire result shape. The simple
/// protocol carries values as text and no command tag, so `command` is the
/// classified verb of the last statement and fields list names only.
fn collect_output(query: &str, messages: Vec<SimpleQueryMessage>) -> QueryOutput {
    let mut rows = Vec::new();
    let mut fields: Vec<FieldDesc> = Vec::new();
    let mut affected = 0u64;

    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if fields.is_empty() {
                    fields = row
                        .columns()
                        .iter()
                        .map(|c| FieldDesc {
                            name: c.name().to_string(),
                        })
                        .collect();
                }
                let mut object = serde_json::Map::new();
                for (idx, column) in row.columns().iter().enumerate() {
                    let value = row
                        .get(idx)
                        .map(|v| serde_json::Value::String(v.to_string()))
                        .unwrap_or(serde_json::Value::Null);
                    object.insert(column.name().to_string(), value);
                }
                rows.push(serde_json::Value::Object(object));
            }
            SimpleQueryMessage::CommandComplete(count) => affected = count,
            _ => {}
        }
    }

    let command = query
        .rsplit(';')
        .find(|s| !s.trim().is_empty())
        .map(QueryKind::classify)
        .unwrap_or(QueryKind::Unknown)
        .as_str()
        .to_string();
    let row_count = if rows.is_empty() {
        affected
    } else {
        rows.len() as u64
    };

    QueryOutput {
        command,
        row_count,
        rows,
        fields,
    }
}

#[async_trait]
impl SqlExecutor for PoolRegistry {
    async fn execute(
        &self,
        instance_id: &str,
        coords: &ConnectCoords,
        query: &str,
    ) -> GatewayResult<QueryOutput> {
        let pool = self.get_or_create(instance_id, coords)?;
        let client = pool.get().await.map_err(map_pool_error)?;
        let messages = client
            .simple_query(query)
            .await
            .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
        Ok(collect_output(query, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords() -> ConnectCoords {
        ConnectCoords {
            host: "localhost".into(),
            port: 5432,
            dbname: "postgres".into(),
            user: "postgres".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn pools_are_bounded_and_per_instance() {
        let registry = PoolRegistry::new(PoolSettings::default());

        // Creation is lazy and does not connect; the bound comes from the
        // pool configuration itself.
        let pool_a = registry.get_or_create("inst-a", &coords()).unwrap();
        assert_eq!(pool_a.status().max_size, 3);

        let again = registry.get_or_create("inst-a", &coords()).unwrap();
        assert_eq!(registry.pool_count(), 1);
        assert_eq!(again.status().max_size, pool_a.status().max_size);

        registry.get_or_create("inst-b", &coords()).unwrap();
        assert_eq!(registry.pool_count(), 2);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_pools() {
        let registry = PoolRegistry::new(PoolSettings::default());
        registry.get_or_create("inst-a", &coords()).unwrap();
        registry.get_or_create("inst-b", &coords()).unwrap();

        // No connection was ever checked out, so both pools are idle.
        assert_eq!(registry.sweep(), 2);
        assert_eq!(registry.pool_count(), 0);
    }
}
