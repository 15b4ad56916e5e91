//! Shared application state and service wiring.

use crate::alerts::AlertScheduler;
use crate::config::Config;
use crate::error::Result;
use crate::manager::ConnectionManager;
use crate::metastore::{MemoryMetadataStore, MetadataStore};
use crate::notifier::{LogNotifier, Notifier};
use crate::query::QueryService;
use crate::tracker::QueryTracker;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn MetadataStore>,
    pub notifier: Arc<dyn Notifier>,
    pub manager: Arc<ConnectionManager>,
    pub tracker: Arc<QueryTracker>,
    pub queries: Arc<QueryService>,
}

impl AppState {
    /// Wire every service from a validated config: seed the metadata
    /// store, register all sources, and prepare the alert scheduler.
    pub async fn build(config: Config) -> Result<(AppState, Arc<AlertScheduler>)> {
        config.validate()?;
        let config = Arc::new(config);

        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::from_config(&config));
        let manager = ConnectionManager::new(Duration::from_secs(config.query.max_timeout_secs));
        for source in store.list_sources().await? {
            manager.add_source(source).await?;
        }

        let tracker = Arc::new(QueryTracker::new(config.query.max_queries_per_user));
        let queries = Arc::new(QueryService::new(
            config.query.clone(),
            manager.clone(),
            tracker.clone(),
            store.clone(),
        ));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let scheduler = AlertScheduler::new(
            config.alerts.clone(),
            store.clone(),
            notifier.clone(),
            queries.clone(),
        );

        Ok((
            AppState {
                config,
                store,
                notifier,
                manager,
                tracker,
                queries,
            },
            scheduler,
        ))
    }
}
