//! Process-wide registry of in-flight queries, keyed by query id.
//! Supports owner-scoped cancellation, a per-user active budget, and a
//! janitor that reaps entries older than the configured age.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
struct ActiveQuery {
    user_id: i64,
    source_id: i64,
    team_id: i64,
    sql: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
}

/// Serializable view of one tracked query
#[derive(Debug, Clone, Serialize)]
pub struct ActiveQueryInfo {
    pub id: Uuid,
    pub user_id: i64,
    pub source_id: i64,
    pub team_id: i64,
    pub sql: String,
    pub started_at: DateTime<Utc>,
}

pub struct QueryTracker {
    queries: DashMap<Uuid, ActiveQuery>,
    max_per_user: usize,
}

impl QueryTracker {
    pub fn new(max_per_user: usize) -> Self {
        QueryTracker {
            queries: DashMap::new(),
            max_per_user,
        }
    }

    /// Register a query and hand back its cancellation token. Enforces the
    /// per-user active budget.
    pub fn register(
        &self,
        user_id: i64,
        source_id: i64,
        team_id: i64,
        sql: &str,
    ) -> Result<(Uuid, CancellationToken)> {
        if self.max_per_user > 0 && self.active_for_user(user_id) >= self.max_per_user {
            return Err(Error::TooManyQueries(format!(
                "user {user_id} already has {} active queries",
                self.max_per_user
            )));
        }
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.queries.insert(
            id,
            ActiveQuery {
                user_id,
                source_id,
                team_id,
                sql: sql.to_string(),
                started_at: Utc::now(),
                token: token.clone(),
            },
        );
        Ok((id, token))
    }

    /// Cancel a query. Returns false when the id is unknown (including a
    /// second cancel of the same id); cancelling another user's query is
    /// forbidden.
    pub fn cancel(&self, id: Uuid, user_id: i64) -> Result<bool> {
        {
            let Some(entry) = self.queries.get(&id) else {
                return Ok(false);
            };
            if entry.user_id != user_id {
                return Err(Error::forbidden(format!(
                    "query {id} belongs to another user"
                )));
            }
            entry.token.cancel();
        }
        self.queries.remove(&id);
        Ok(true)
    }

    /// Remove an entry when its query finishes (any outcome).
    pub fn remove(&self, id: Uuid) {
        self.queries.remove(&id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.queries.contains_key(&id)
    }

    pub fn active_for_user(&self, user_id: i64) -> usize {
        self.queries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .count()
    }

    pub fn list_by_user(&self, user_id: i64) -> Vec<ActiveQueryInfo> {
        self.queries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| ActiveQueryInfo {
                id: *entry.key(),
                user_id: entry.user_id,
                source_id: entry.source_id,
                team_id: entry.team_id,
                sql: entry.sql.clone(),
                started_at: entry.started_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Cancel and remove entries older than `max_age`. Returns how many
    /// entries were reaped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let stale: Vec<Uuid> = self
            .queries
            .iter()
            .filter(|entry| entry.started_at < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for id in &stale {
            if let Some((_, entry)) = self.queries.remove(id) {
                entry.token.cancel();
                tracing::warn!(query_id = %id, user_id = entry.user_id, "reaped stale query");
            }
        }
        stale.len()
    }

    /// Spawn the periodic janitor; stops when `stop` is cancelled.
    pub fn start_janitor(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = tracker.sweep(max_age);
                        if reaped > 0 {
                            tracing::info!(reaped, "query janitor pass");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_owner_scoped_and_idempotent() {
        let tracker = QueryTracker::new(10);
        let (id, token) = tracker.register(1, 5, 2, "SELECT 1").unwrap();
        assert!(!token.is_cancelled());

        // wrong owner
        let err = tracker.cancel(id, 99).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        assert!(tracker.contains(id));

        // right owner
        assert!(tracker.cancel(id, 1).unwrap());
        assert!(token.is_cancelled());
        assert!(!tracker.contains(id));

        // second cancel of the same id
        assert!(!tracker.cancel(id, 1).unwrap());
    }

    #[test]
    fn per_user_budget_is_enforced() {
        let tracker = QueryTracker::new(2);
        tracker.register(7, 1, 1, "a").unwrap();
        tracker.register(7, 1, 1, "b").unwrap();
        let err = tracker.register(7, 1, 1, "c").unwrap_err();
        assert_eq!(err.kind(), "too_many_requests");
        // other users are unaffected
        assert!(tracker.register(8, 1, 1, "d").is_ok());
    }

    #[test]
    fn sweep_reaps_only_stale_entries() {
        let tracker = QueryTracker::new(10);
        let (old_id, old_token) = tracker.register(1, 1, 1, "old").unwrap();
        // age the entry artificially
        tracker
            .queries
            .get_mut(&old_id)
            .unwrap()
            .started_at = Utc::now() - chrono::Duration::hours(2);
        let (new_id, _) = tracker.register(1, 1, 1, "new").unwrap();

        let reaped = tracker.sweep(Duration::from_secs(3600));
        assert_eq!(reaped, 1);
        assert!(old_token.is_cancelled());
        assert!(!tracker.contains(old_id));
        assert!(tracker.contains(new_id));
    }

    #[test]
    fn list_by_user_filters() {
        let tracker = QueryTracker::new(10);
        tracker.register(1, 1, 1, "a").unwrap();
        tracker.register(2, 1, 1, "b").unwrap();
        let mine = tracker.list_by_user(1);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].sql, "a");
    }
}
