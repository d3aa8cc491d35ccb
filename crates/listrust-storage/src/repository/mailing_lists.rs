//! Mailing list repository

use crate::db::DatabasePool;
use crate::models::{DigestState, MailingList};
use async_trait::async_trait;
use listrust_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Mailing list store trait
///
/// The pipeline only reads lists; the digest subsystem is the sole writer of
/// the digest counters.
#[async_trait]
pub trait MailingListStore: Send + Sync {
    /// Get a list by its dotted list id
    async fn get(&self, list_id: &str) -> Result<Option<MailingList>>;

    /// All lists
    async fn all(&self) -> Result<Vec<MailingList>>;

    /// Persist volume, issue number and last-sent time
    async fn save_digest_state(&self, list_id: &str, state: DigestState) -> Result<()>;
}

/// Database mailing list repository
pub struct DbMailingListRepository {
    pool: DatabasePool,
}

impl DbMailingListRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailingListStore for DbMailingListRepository {
    async fn get(&self, list_id: &str) -> Result<Option<MailingList>> {
        sqlx::query_as::<_, MailingList>("SELECT * FROM mailing_lists WHERE list_id = $1")
            .bind(list_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn all(&self) -> Result<Vec<MailingList>> {
        sqlx::query_as::<_, MailingList>("SELECT * FROM mailing_lists ORDER BY list_id")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn save_digest_state(&self, list_id: &str, state: DigestState) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE mailing_lists SET
                volume = $2,
                next_digest_number = $3,
                digest_last_sent_at = $4,
                updated_at = NOW()
            WHERE list_id = $1
            "#,
        )
        .bind(list_id)
        .bind(state.volume)
        .bind(state.next_digest_number)
        .bind(state.digest_last_sent_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("mailing list {}", list_id)));
        }

        Ok(())
    }
}

/// In-memory list store, used by tests and single-process tooling
#[derive(Default)]
pub struct InMemoryMailingListStore {
    lists: RwLock<HashMap<String, MailingList>>,
}

impl InMemoryMailingListStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a list
    pub async fn insert(&self, list: MailingList) {
        self.lists.write().await.insert(list.list_id.clone(), list);
    }
}

#[async_trait]
impl MailingListStore for InMemoryMailingListStore {
    async fn get(&self, list_id: &str) -> Result<Option<MailingList>> {
        Ok(self.lists.read().await.get(list_id).cloned())
    }

    async fn all(&self) -> Result<Vec<MailingList>> {
        let mut lists: Vec<MailingList> = self.lists.read().await.values().cloned().collect();
        lists.sort_by(|a, b| a.list_id.cmp(&b.list_id));
        Ok(lists)
    }

    async fn save_digest_state(&self, list_id: &str, state: DigestState) -> Result<()> {
        let mut lists = self.lists.write().await;
        let list = lists
            .get_mut(list_id)
            .ok_or_else(|| Error::NotFound(format!("mailing list {}", list_id)))?;
        list.volume = state.volume;
        list.next_digest_number = state.next_digest_number;
        list.digest_last_sent_at = state.digest_last_sent_at;
        list.updated_at = chrono::Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryMailingListStore::new();
        store
            .insert(MailingList::new("bee.example.com", "bee@example.com"))
            .await;
        store
            .insert(MailingList::new("ant.example.com", "ant@example.com"))
            .await;

        let all = store.all().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|l| l.list_id.as_str()).collect();
        assert_eq!(ids, vec!["ant.example.com", "bee.example.com"]);

        assert!(store.get("cat.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_digest_state() {
        let store = InMemoryMailingListStore::new();
        store
            .insert(MailingList::new("ant.example.com", "ant@example.com"))
            .await;

        let sent = Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap();
        store
            .save_digest_state(
                "ant.example.com",
                DigestState {
                    volume: 2,
                    next_digest_number: 1,
                    digest_last_sent_at: Some(sent),
                },
            )
            .await
            .unwrap();

        let list = store.get("ant.example.com").await.unwrap().unwrap();
        assert_eq!(DigestState::from(&list).volume, 2);
        assert_eq!(list.digest_last_sent_at, Some(sent));

        let missing = store
            .save_digest_state("cat.example.com", DigestState::from(&list))
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
