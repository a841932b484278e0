use super::{EntityStore, Precondition, StoreResult, StoreTransaction, StoredEntity};
use crate::error::{EntityKind, StoreError};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

type EntityKey = (EntityKind, String);

/// In-memory store. Writes are staged per transaction and applied under one
/// lock at commit, after every precondition has been checked.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entities: Arc<Mutex<HashMap<EntityKey, StoredEntity>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed entity count of one kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.entities
            .lock()
            .map(|m| m.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// Committed body, bypassing transactions.
    pub fn peek(&self, kind: EntityKind, key: &str) -> Option<StoredEntity> {
        self.entities
            .lock()
            .ok()
            .and_then(|m| m.get(&(kind, key.to_string())).cloned())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            entities: self.entities.clone(),
            staged: BTreeMap::new(),
        }))
    }
}

enum Staged {
    Write { body: Value, precondition: Precondition },
    Delete,
}

struct MemoryTransaction {
    entities: Arc<Mutex<HashMap<EntityKey, StoredEntity>>>,
    staged: BTreeMap<EntityKey, Staged>,
}

impl MemoryTransaction {
    fn committed(&self, key: &EntityKey) -> StoreResult<Option<StoredEntity>> {
        let guard = self
            .entities
            .lock()
            .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))?;
        Ok(guard.get(key).cloned())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find(&mut self, kind: EntityKind, key: &str) -> StoreResult<Option<StoredEntity>> {
        let key = (kind, key.to_string());
        let committed = self.committed(&key)?;
        Ok(match self.staged.get(&key) {
            Some(Staged::Write { body, .. }) => Some(StoredEntity {
                body: body.clone(),
                version: committed.map(|c| c.version + 1).unwrap_or(1),
            }),
            Some(Staged::Delete) => None,
            None => committed,
        })
    }

    async fn save(
        &mut self,
        kind: EntityKind,
        key: &str,
        body: Value,
        precondition: Precondition,
    ) -> StoreResult<()> {
        let key = (kind, key.to_string());
        // A second write to the same key keeps the first write's precondition.
        let precondition = match self.staged.get(&key) {
            Some(Staged::Write { precondition, .. }) => *precondition,
            Some(Staged::Delete) => Precondition::Any,
            None => precondition,
        };
        self.staged.insert(key, Staged::Write { body, precondition });
        Ok(())
    }

    async fn delete(&mut self, kind: EntityKind, key: &str) -> StoreResult<()> {
        self.staged.insert((kind, key.to_string()), Staged::Delete);
        Ok(())
    }

    async fn scan(&mut self, kind: EntityKind) -> StoreResult<Vec<(String, StoredEntity)>> {
        let mut out: BTreeMap<String, StoredEntity> = {
            let guard = self
                .entities
                .lock()
                .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))?;
            guard
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), entity)| (key.clone(), entity.clone()))
                .collect()
        };
        for ((k, key), staged) in &self.staged {
            if *k != kind {
                continue;
            }
            match staged {
                Staged::Write { body, .. } => {
                    let version = out.get(key).map(|e| e.version + 1).unwrap_or(1);
                    out.insert(
                        key.clone(),
                        StoredEntity {
                            body: body.clone(),
                            version,
                        },
                    );
                }
                Staged::Delete => {
                    out.remove(key);
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { entities, staged } = *self;
        let mut guard = entities
            .lock()
            .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))?;

        for (key, staged) in &staged {
            let Staged::Write { precondition, .. } = staged else {
                continue;
            };
            let current = guard.get(key).map(|e| e.version);
            let ok = match precondition {
                Precondition::Any => true,
                Precondition::Absent => current.is_none(),
                Precondition::Version(v) => current == Some(*v),
            };
            if !ok {
                return Err(StoreError::Conflict {
                    kind: key.0,
                    key: key.1.clone(),
                });
            }
        }

        for (key, staged) in staged {
            match staged {
                Staged::Write { body, .. } => {
                    let version = guard.get(&key).map(|e| e.version + 1).unwrap_or(1);
                    guard.insert(key, StoredEntity { body, version });
                }
                Staged::Delete => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}
