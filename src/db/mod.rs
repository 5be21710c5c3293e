//! Per-datasource connection pooling.
//!
//! One pool per datasource name, created lazily on first use and kept for
//! the life of the process. Acquires block when the pool is exhausted
//! rather than erroring. After shutdown new requests are refused and idle
//! connections are released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::config::DatasourceConfig;
use crate::errors::{MonitorError, Result};

pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Blocking acquires wait this long before giving up; effectively "block,
/// don't error" for any realistic probe.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct PoolRegistry {
    pools: Mutex<HashMap<String, MySqlPool>>,
    max_connections: u32,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(max_connections: u32) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_connections,
            closed: AtomicBool::new(false),
        }
    }

    /// Pool for the given datasource, creating it on first request.
    pub fn pool_for(&self, datasource: &DatasourceConfig) -> Result<MySqlPool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::Probe(format!(
                "pool registry is shut down, refusing connection to {:?}",
                datasource.name
            )));
        }
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| MonitorError::Probe("pool registry lock poisoned".into()))?;
        if let Some(pool) = pools.get(&datasource.name) {
            return Ok(pool.clone());
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options(datasource));
        pools.insert(datasource.name.clone(), pool.clone());
        Ok(pool)
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Refuse new acquires and close every pool.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pools: Vec<MySqlPool> = match self.pools.lock() {
            Ok(mut guard) => guard.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        for pool in pools {
            pool.close().await;
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

fn connect_options(ds: &DatasourceConfig) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&ds.host)
        .port(ds.port)
        .username(&ds.user)
        .password(&ds.password)
        .database(&ds.database)
        .charset(&ds.charset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str) -> DatasourceConfig {
        DatasourceConfig {
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 3306,
            user: "monitor".into(),
            password: "secret".into(),
            database: "stats".into(),
            charset: "utf8mb4".into(),
        }
    }

    #[tokio::test]
    async fn pools_are_created_once_per_name() {
        let registry = PoolRegistry::default();
        registry.pool_for(&ds("main")).unwrap();
        registry.pool_for(&ds("main")).unwrap();
        registry.pool_for(&ds("backup")).unwrap();
        assert_eq!(registry.pool_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_pools() {
        let registry = PoolRegistry::default();
        registry.shutdown().await;
        assert!(registry.pool_for(&ds("late")).is_err());
    }
}
