//! Query tracking and alert bookkeeping through the public API.

use logchef::alerts::{
    Alert, AlertHistoryEntry, AlertHistoryStatus, AlertSeverity, AlertState, QueryType,
    ThresholdOp,
};
use logchef::config::Config;
use logchef::metastore::{MemoryMetadataStore, MetadataStore};
use logchef::tracker::QueryTracker;
use std::time::Duration;

#[test]
fn cancellation_is_owner_scoped() {
    let tracker = QueryTracker::new(5);
    let (id, token) = tracker.register(1, 10, 1, "SELECT 1").unwrap();

    assert!(tracker.cancel(id, 2).is_err());
    assert!(tracker.cancel(id, 1).unwrap());
    assert!(token.is_cancelled());
    assert!(!tracker.cancel(id, 1).unwrap());
}

#[test]
fn budget_applies_per_user() {
    let tracker = QueryTracker::new(1);
    tracker.register(1, 10, 1, "a").unwrap();
    assert!(tracker.register(1, 10, 1, "b").is_err());
    assert!(tracker.register(2, 10, 1, "c").is_ok());
}

fn sample_alert(id: i64) -> Alert {
    Alert {
        id,
        team_id: 1,
        source_id: 1,
        name: format!("alert {id}"),
        query_type: QueryType::Condition,
        query: r#"level="error""#.into(),
        lookback_seconds: 300,
        threshold_op: ThresholdOp::Gt,
        threshold_value: 10.0,
        frequency_seconds: 60,
        severity: AlertSeverity::Warning,
        recipients: vec![],
        webhook_urls: vec![],
        is_active: true,
        last_state: AlertState::Resolved,
        last_evaluated_at: None,
        last_triggered_at: None,
    }
}

#[tokio::test]
async fn history_prune_keeps_the_newest_rows() {
    let store = MemoryMetadataStore::new();
    store.put_alert(sample_alert(1)).await;
    for i in 0..10 {
        store
            .insert_alert_history(AlertHistoryEntry::triggered(1, i as f64, "fired"))
            .await
            .unwrap();
    }
    store.prune_alert_history(1, 3).await.unwrap();
    let rows = store.list_alert_history(1, 100).await.unwrap();
    assert_eq!(rows.len(), 3);
    // newest first
    assert_eq!(rows[0].value, Some(9.0));
}

#[tokio::test]
async fn unresolved_rows_match_firing_state() {
    let store = MemoryMetadataStore::new();
    store.put_alert(sample_alert(2)).await;

    // fire
    store
        .insert_alert_history(AlertHistoryEntry::triggered(2, 15.0, "fired"))
        .await
        .unwrap();
    store
        .update_alert_state(2, AlertState::Firing, chrono::Utc::now(), Some(chrono::Utc::now()))
        .await
        .unwrap();
    let unresolved = store
        .list_alert_history(2, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status == AlertHistoryStatus::Triggered)
        .count();
    assert_eq!(unresolved, 1);

    // resolve
    store
        .resolve_latest_alert_history(2, "recovered")
        .await
        .unwrap();
    store
        .update_alert_state(2, AlertState::Resolved, chrono::Utc::now(), None)
        .await
        .unwrap();
    let unresolved = store
        .list_alert_history(2, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status == AlertHistoryStatus::Triggered)
        .count();
    assert_eq!(unresolved, 0);
    assert_eq!(
        store.get_alert(2).await.unwrap().last_state,
        AlertState::Resolved
    );
}

#[tokio::test]
async fn config_seeds_sources_and_rules() {
    let raw = r#"
        [[sources]]
        id = 1
        name = "nginx"
        backend = "clickhouse"
        timestamp_field = "ts"

        [sources.connection]
        host = "http://localhost:8123"
        database = "logs"
        table = "nginx"

        [[alert_rules]]
        id = 7
        name = "5xx spike"
        source_id = 1
        query_type = "condition"
        query = 'status>=500'
        lookback_seconds = 300
        threshold_op = "gt"
        threshold_value = 100.0
        frequency_seconds = 60
        severity = "critical"
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    config.validate().unwrap();
    let store = MemoryMetadataStore::from_config(&config);

    let source = store.get_source(1).await.unwrap();
    assert_eq!(source.table_identifier().as_deref(), Some("logs.nginx"));

    let due = store.list_due_alerts(chrono::Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].severity, AlertSeverity::Critical);
    assert_eq!(due[0].last_state, AlertState::Resolved);
}

#[test]
fn sweep_cancels_stale_queries() {
    let tracker = QueryTracker::new(10);
    let (_id, token) = tracker.register(1, 1, 1, "long running").unwrap();
    // nothing is stale yet
    assert_eq!(tracker.sweep(Duration::from_secs(3600)), 0);
    assert!(!token.is_cancelled());
    // everything is stale with a zero age
    assert_eq!(tracker.sweep(Duration::from_secs(0)), 1);
    assert!(token.is_cancelled());
    assert!(tracker.is_empty());
}
