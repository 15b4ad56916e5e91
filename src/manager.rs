//! Process-wide registry mapping sources to backend clients.
//! Owns client lifecycle, runs periodic ping-then-reconnect health checks,
//! and caches last-known health for cheap reads.

use crate::client::{
    BackendClient, ClickHouseClient, ClientMetrics, LoggingHook, MetricsHook, QueryHook,
    VictoriaLogsClient,
};
use crate::error::{Error, Result};
use crate::models::{Backend, Source, SourceHealth};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const PING_DEADLINE: Duration = Duration::from_secs(1);
const RECONNECT_DEADLINE: Duration = Duration::from_secs(1);
const REMOVE_CLOSE_BUDGET: Duration = Duration::from_secs(3);
const SHUTDOWN_CHECKER_BUDGET: Duration = Duration::from_secs(5);
const SHUTDOWN_CLIENT_BUDGET: Duration = Duration::from_secs(5);
const SHUTDOWN_OVERALL_BUDGET: Duration = Duration::from_secs(8);

struct Entry {
    source: Source,
    client: Arc<dyn BackendClient>,
}

pub struct ConnectionManager {
    clients: RwLock<HashMap<i64, Entry>>,
    health: RwLock<HashMap<i64, SourceHealth>>,
    hooks: Mutex<Vec<Arc<dyn QueryHook>>>,
    metrics: Arc<ClientMetrics>,
    /// Sources with a check currently in flight
    checking: Mutex<HashSet<i64>>,
    stop: CancellationToken,
    checker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    max_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_timeout: Duration) -> Arc<Self> {
        Arc::new(ConnectionManager {
            clients: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            metrics: Arc::new(ClientMetrics::default()),
            checking: Mutex::new(HashSet::new()),
            stop: CancellationToken::new(),
            checker: Mutex::new(None),
            max_timeout,
        })
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    fn build_client(&self, source: &Source) -> Result<Arc<dyn BackendClient>> {
        let client: Arc<dyn BackendClient> = match source.backend {
            Backend::Clickhouse => {
                Arc::new(ClickHouseClient::from_source(source, self.max_timeout)?)
            }
            Backend::Victorialogs => {
                Arc::new(VictoriaLogsClient::from_source(source, self.max_timeout)?)
            }
        };
        client.add_hook(Arc::new(LoggingHook));
        client.add_hook(Arc::new(MetricsHook::new(self.metrics.clone())));
        for hook in self.hooks.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            client.add_hook(hook.clone());
        }
        Ok(client)
    }

    /// Register a source: construct its client without pinging, record it
    /// as unhealthy/initial, and schedule an immediate background check.
    pub async fn add_source(self: &Arc<Self>, source: Source) -> Result<()> {
        let id = source.id;
        let client = self.build_client(&source)?;
        {
            let mut clients = self.clients.write().await;
            clients.insert(id, Entry { source, client });
        }
        {
            let mut health = self.health.write().await;
            health.insert(id, SourceHealth::unhealthy(id, "initial"));
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.check_source(id).await;
        });
        tracing::info!(source_id = id, "source registered");
        Ok(())
    }

    /// Drop a source from both maps, then close its client with a bounded
    /// budget; a slow close is abandoned.
    pub async fn remove_source(&self, id: i64) -> Result<()> {
        let entry = {
            let mut clients = self.clients.write().await;
            let mut health = self.health.write().await;
            health.remove(&id);
            clients.remove(&id)
        };
        let Some(entry) = entry else {
            return Err(Error::not_found(format!("source {id}")));
        };
        if tokio::time::timeout(REMOVE_CLOSE_BUDGET, entry.client.close(REMOVE_CLOSE_BUDGET))
            .await
            .is_err()
        {
            tracing::warn!(source_id = id, "abandoning slow client close");
        }
        tracing::info!(source_id = id, "source removed");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Arc<dyn BackendClient>> {
        self.clients
            .read()
            .await
            .get(&id)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| Error::backend_unavailable(format!("source {id} is not connected")))
    }

    pub async fn get_source(&self, id: i64) -> Result<Source> {
        self.clients
            .read()
            .await
            .get(&id)
            .map(|entry| entry.source.clone())
            .ok_or_else(|| Error::not_found(format!("source {id}")))
    }

    pub async fn source_ids(&self) -> Vec<i64> {
        self.clients.read().await.keys().copied().collect()
    }

    pub async fn health(&self, id: i64) -> Option<SourceHealth> {
        self.health.read().await.get(&id).cloned()
    }

    pub async fn all_health(&self) -> Vec<SourceHealth> {
        self.health.read().await.values().cloned().collect()
    }

    /// Append a hook and propagate it to every existing client.
    pub async fn add_hook(&self, hook: Arc<dyn QueryHook>) {
        let clients = self.clients.read().await;
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook.clone());
        for entry in clients.values() {
            entry.client.add_hook(hook.clone());
        }
    }

    /// Build and ping a client for unverified connection details without
    /// registering it; the caller owns (and closes) the result.
    pub async fn connect_temporary(
        &self,
        source: &Source,
        deadline: Duration,
    ) -> Result<Arc<dyn BackendClient>> {
        let client = self.build_client(source)?;
        client.ping(deadline).await?;
        Ok(client)
    }

    /// Ping, reconnect on failure, and update cached health. At most one
    /// check per source runs at a time.
    pub async fn check_source(&self, id: i64) {
        {
            let mut checking = self.checking.lock().unwrap_or_else(|e| e.into_inner());
            if !checking.insert(id) {
                return;
            }
        }
        let outcome = self.check_source_inner(id).await;
        {
            let mut checking = self.checking.lock().unwrap_or_else(|e| e.into_inner());
            checking.remove(&id);
        }
        let status = match outcome {
            Some(health) => health,
            None => return,
        };
        // the source may have been removed while the check was in flight
        if !self.clients.read().await.contains_key(&id) {
            return;
        }
        let mut health = self.health.write().await;
        health.insert(id, status);
    }

    async fn check_source_inner(&self, id: i64) -> Option<SourceHealth> {
        let client = {
            let clients = self.clients.read().await;
            clients.get(&id)?.client.clone()
        };
        match client.ping(PING_DEADLINE).await {
            Ok(()) => Some(SourceHealth::healthy(id)),
            Err(ping_err) => {
                tracing::warn!(source_id = id, error = %ping_err, "ping failed, reconnecting");
                match client.reconnect(RECONNECT_DEADLINE).await {
                    Ok(()) => {
                        tracing::info!(source_id = id, "reconnected");
                        Some(SourceHealth::healthy(id))
                    }
                    Err(reconnect_err) => {
                        tracing::warn!(
                            source_id = id,
                            error = %reconnect_err,
                            "reconnect failed, keeping existing client"
                        );
                        Some(SourceHealth::unhealthy(id, reconnect_err.to_string()))
                    }
                }
            }
        }
    }

    /// Spawn the periodic checker: every `interval`, snapshot the id set
    /// and check all sources concurrently.
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let ids = manager.source_ids().await;
                        let checks = ids.into_iter().map(|id| {
                            let manager = manager.clone();
                            async move { manager.check_source(id).await }
                        });
                        futures::future::join_all(checks).await;
                    }
                }
            }
        });
        *self.checker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the checker, then close all clients concurrently within an
    /// overall budget.
    pub async fn close(&self) {
        self.stop.cancel();
        let checker = self
            .checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = checker {
            if tokio::time::timeout(SHUTDOWN_CHECKER_BUDGET, handle).await.is_err() {
                tracing::warn!("health checker did not stop in time");
            }
        }
        let clients: Vec<Arc<dyn BackendClient>> = {
            let mut map = self.clients.write().await;
            map.drain().map(|(_, entry)| entry.client).collect()
        };
        let closes = futures::future::join_all(clients.into_iter().map(|client| async move {
            let _ = tokio::time::timeout(
                SHUTDOWN_CLIENT_BUDGET,
                client.close(SHUTDOWN_CLIENT_BUDGET),
            )
            .await;
        }));
        if tokio::time::timeout(SHUTDOWN_OVERALL_BUDGET, closes).await.is_err() {
            tracing::warn!("client shutdown exceeded its budget");
        }
        tracing::info!("connection manager closed");
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(
        &self,
        source: Source,
        client: Arc<dyn BackendClient>,
    ) {
        let id = source.id;
        self.clients
            .write()
            .await
            .insert(id, Entry { source, client });
        self.health
            .write()
            .await
            .insert(id, SourceHealth::healthy(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClickHouseConnection, ConnectionInfo, HealthStatus};
    use chrono::Utc;

    fn source(id: i64) -> Source {
        Source {
            id,
            name: format!("src-{id}"),
            backend: Backend::Clickhouse,
            connection: ConnectionInfo::Clickhouse(ClickHouseConnection {
                // unroutable port so pings fail fast in tests
                host: "http://127.0.0.1:1".to_string(),
                database: "logs".to_string(),
                table: "events".to_string(),
                username: String::new(),
                password: String::new(),
            }),
            timestamp_field: "ts".to_string(),
            severity_field: None,
            description: String::new(),
            ttl_days: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_get_remove_lifecycle() {
        let manager = ConnectionManager::new(Duration::from_secs(30));
        manager.add_source(source(1)).await.unwrap();

        assert!(manager.get(1).await.is_ok());
        assert!(manager.get_source(1).await.is_ok());
        let err = manager.get(2).await.unwrap_err();
        assert_eq!(err.kind(), "backend");

        manager.remove_source(1).await.unwrap();
        assert!(manager.get(1).await.is_err());
        assert!(manager.health(1).await.is_none());
        assert!(manager.remove_source(1).await.is_err());
    }

    #[tokio::test]
    async fn failed_check_records_unhealthy() {
        let manager = ConnectionManager::new(Duration::from_secs(30));
        manager.add_source(source(1)).await.unwrap();
        manager.check_source(1).await;
        let health = manager.health(1).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn close_drains_everything() {
        let manager = ConnectionManager::new(Duration::from_secs(30));
        manager.add_source(source(1)).await.unwrap();
        manager.add_source(source(2)).await.unwrap();
        manager.start_health_checks(Duration::from_secs(3600));
        manager.close().await;
        assert!(manager.source_ids().await.is_empty());
    }
}
