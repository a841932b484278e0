//! Persistent context key -> session id table.
//!
//! A key maps to at most one session. A second `save` for the same key with a
//! different session fails with `DuplicateBinding`; the store's `Absent`
//! precondition makes the first committed writer win even when two writers
//! race past the initial lookup.

use crate::error::{EngineError, EngineResult, EntityKind, StateConflict, StoreError};
use crate::store::{find_as, save_as, EntityStore, Precondition, StoreTransaction};
use crate::types::{ContextKey, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMapping {
    pub key: ContextKey,
    pub session_id: SessionId,
    /// Filled in once an instance exists under the mapping.
    pub process_instance_id: Option<Uuid>,
    pub created_at: Timestamp,
}

#[derive(Clone)]
pub struct ContextMapper {
    store: Arc<dyn EntityStore>,
    deployment_id: String,
}

impl ContextMapper {
    pub fn new(store: Arc<dyn EntityStore>, deployment_id: impl Into<String>) -> Self {
        Self {
            store,
            deployment_id: deployment_id.into(),
        }
    }

    fn storage_key(&self, key: &ContextKey) -> String {
        format!("{}/{}", self.deployment_id, key)
    }

    pub async fn find(&self, key: &ContextKey) -> EngineResult<Option<ContextMapping>> {
        let mut tx = self.store.begin().await?;
        self.find_in(tx.as_mut(), key).await
    }

    pub async fn find_in(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &ContextKey,
    ) -> EngineResult<Option<ContextMapping>> {
        let found = find_as::<ContextMapping>(tx, EntityKind::ContextMapping, &self.storage_key(key))
            .await?;
        Ok(found.map(|(mapping, _)| mapping))
    }

    /// Map `key` to `session_id` in its own transaction.
    pub async fn save(
        &self,
        key: &ContextKey,
        session_id: SessionId,
        now: Timestamp,
    ) -> EngineResult<ContextMapping> {
        let mut tx = self.store.begin().await?;
        let mapping = self.save_in(tx.as_mut(), key, session_id, None, now).await?;
        match tx.commit().await {
            Ok(()) => Ok(mapping),
            Err(StoreError::Conflict { .. }) => Err(self.duplicate(key, session_id).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage a mapping inside a caller's transaction. Saving the same session
    /// again is idempotent and may fill in the instance id.
    pub async fn save_in(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &ContextKey,
        session_id: SessionId,
        process_instance_id: Option<Uuid>,
        now: Timestamp,
    ) -> EngineResult<ContextMapping> {
        let storage_key = self.storage_key(key);
        match find_as::<ContextMapping>(tx, EntityKind::ContextMapping, &storage_key).await? {
            Some((existing, _)) if existing.session_id != session_id => {
                Err(StateConflict::DuplicateBinding {
                    key: key.clone(),
                    existing: existing.session_id,
                }
                .into())
            }
            Some((mut existing, version)) => {
                if process_instance_id.is_some() && existing.process_instance_id != process_instance_id {
                    existing.process_instance_id = process_instance_id;
                    save_as(
                        tx,
                        EntityKind::ContextMapping,
                        &storage_key,
                        &existing,
                        Precondition::Version(version),
                    )
                    .await?;
                }
                Ok(existing)
            }
            None => {
                let mapping = ContextMapping {
                    key: key.clone(),
                    session_id,
                    process_instance_id,
                    created_at: now,
                };
                save_as(
                    tx,
                    EntityKind::ContextMapping,
                    &storage_key,
                    &mapping,
                    Precondition::Absent,
                )
                .await?;
                Ok(mapping)
            }
        }
    }

    pub async fn remove(&self, key: &ContextKey) -> EngineResult<()> {
        let mut tx = self.store.begin().await?;
        self.remove_in(tx.as_mut(), key).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_in(&self, tx: &mut dyn StoreTransaction, key: &ContextKey) -> EngineResult<()> {
        tx.delete(EntityKind::ContextMapping, &self.storage_key(key))
            .await?;
        Ok(())
    }

    /// Every mapping of this deployment that points at `session_id`.
    pub async fn mappings_for_session_in(
        &self,
        tx: &mut dyn StoreTransaction,
        session_id: SessionId,
    ) -> EngineResult<Vec<ContextMapping>> {
        let prefix = format!("{}/", self.deployment_id);
        let mut out = Vec::new();
        for (key, entity) in tx.scan(EntityKind::ContextMapping).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let mapping: ContextMapping =
                serde_json::from_value(entity.body).map_err(StoreError::from)?;
            if mapping.session_id == session_id {
                out.push(mapping);
            }
        }
        Ok(out)
    }

    /// Build the `DuplicateBinding` reported when a commit lost the race.
    pub async fn duplicate(&self, key: &ContextKey, attempted: SessionId) -> EngineError {
        match self.find(key).await {
            Ok(Some(existing)) => StateConflict::DuplicateBinding {
                key: key.clone(),
                existing: existing.session_id,
            }
            .into(),
            Ok(None) => StateConflict::DuplicateBinding {
                key: key.clone(),
                existing: attempted,
            }
            .into(),
            Err(e) => e,
        }
    }
}

impl std::fmt::Debug for ContextMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextMapper")
            .field("deployment_id", &self.deployment_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn mapper() -> ContextMapper {
        ContextMapper::new(Arc::new(MemoryStore::new()), "test")
    }

    #[tokio::test]
    async fn second_session_for_a_key_is_a_duplicate() {
        let mapper = mapper();
        let key = ContextKey::Correlation("order-7".into());
        let first = SessionId::new();
        mapper.save(&key, first, 0).await.unwrap();

        let err = mapper.save(&key, SessionId::new(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StateConflict(StateConflict::DuplicateBinding { existing, .. }) if existing == first
        ));
        // Same session again is fine.
        mapper.save(&key, first, 0).await.unwrap();
    }

    #[tokio::test]
    async fn racing_transactions_resolve_to_one_winner() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let mapper = ContextMapper::new(store.clone(), "test");
        let key = ContextKey::Correlation("race".into());
        let (a, b) = (SessionId::new(), SessionId::new());

        let mut tx_a = store.begin().await.unwrap();
        let mut tx_b = store.begin().await.unwrap();
        mapper.save_in(tx_a.as_mut(), &key, a, None, 0).await.unwrap();
        mapper.save_in(tx_b.as_mut(), &key, b, None, 0).await.unwrap();
        tx_a.commit().await.unwrap();
        assert!(matches!(tx_b.commit().await, Err(StoreError::Conflict { .. })));
        assert_eq!(mapper.find(&key).await.unwrap().unwrap().session_id, a);
    }

    #[tokio::test]
    async fn remove_then_rebind() {
        let mapper = mapper();
        let key = ContextKey::ProcessInstance(Uuid::now_v7());
        mapper.save(&key, SessionId::new(), 0).await.unwrap();
        mapper.remove(&key).await.unwrap();
        assert!(mapper.find(&key).await.unwrap().is_none());
        mapper.save(&key, SessionId::new(), 0).await.unwrap();
    }
}
