//! Transactional entity store.
//!
//! Process instances, session records and context mappings are stored as
//! JSON bodies keyed by `(kind, key)`. Every write carries a precondition so
//! that concurrent writers to the same key resolve to first-writer-wins.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgEntityStore;

use crate::error::{EntityKind, StoreError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub body: Value,
    /// Incremented on every committed write, starting at 1.
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Any,
    /// The key must not exist.
    Absent,
    /// The stored version must still be this one.
    Version(u64),
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// A caller-demarcated unit of work. Dropping without `commit` discards it.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn find(&mut self, kind: EntityKind, key: &str) -> StoreResult<Option<StoredEntity>>;

    async fn save(
        &mut self,
        kind: EntityKind,
        key: &str,
        body: Value,
        precondition: Precondition,
    ) -> StoreResult<()>;

    async fn delete(&mut self, kind: EntityKind, key: &str) -> StoreResult<()>;

    async fn scan(&mut self, kind: EntityKind) -> StoreResult<Vec<(String, StoredEntity)>>;

    /// Apply every staged write atomically, or fail with `Conflict` and
    /// apply none.
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

// ── Typed helpers ──

pub async fn find_as<T: DeserializeOwned>(
    tx: &mut dyn StoreTransaction,
    kind: EntityKind,
    key: &str,
) -> StoreResult<Option<(T, u64)>> {
    match tx.find(kind, key).await? {
        Some(entity) => Ok(Some((serde_json::from_value(entity.body)?, entity.version))),
        None => Ok(None),
    }
}

pub async fn save_as<T: Serialize + Sync>(
    tx: &mut dyn StoreTransaction,
    kind: EntityKind,
    key: &str,
    value: &T,
    precondition: Precondition,
) -> StoreResult<()> {
    let body = serde_json::to_value(value)?;
    tx.save(kind, key, body, precondition).await
}
