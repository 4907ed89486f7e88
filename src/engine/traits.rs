// SPDX-License-Identifier: Apache-2.0

//! StorageEngine trait definition
//!
//! This is the core abstraction that every backend adapter implements. It
//! provides one CRUD and migration contract across relational and document
//! engines so the pool can fan operations out without knowing which backend
//! it is talking to.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{DatabaseEngine, DatabaseType, EngineIdentity, Record, Value};
use crate::model::Entity;

/// Core trait that all storage adapters must implement
///
/// Adapters own their connection exclusively and must be safe to call
/// concurrently. After [`close`](StorageEngine::close) every data operation
/// fails with a connection error.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Display name from the configuration
    fn name(&self) -> &str;

    /// Storage family (`sql` or `nosql`)
    fn database_type(&self) -> DatabaseType;

    /// Concrete engine (`mysql`, `mariadb`, `psql`, `mongodb`)
    fn engine(&self) -> DatabaseEngine;

    fn identity(&self) -> EngineIdentity {
        EngineIdentity {
            name: self.name().to_string(),
            engine: self.engine(),
            database_type: self.database_type(),
        }
    }

    /// Finds the first record where `key` equals `value`.
    ///
    /// Fails with `NotFound` when nothing matches.
    async fn find_one(&self, table: &str, key: &str, value: &Value) -> EngineResult<Record>;

    /// Inserts one record. A uniqueness breach yields `ConstraintViolation`.
    async fn insert_one(&self, table: &str, record: &Record) -> EngineResult<()>;

    /// Inserts all records in a single batch. Any failure is reported for
    /// the whole call.
    async fn insert_many(&self, table: &str, records: &[Record]) -> EngineResult<()>;

    /// Sets `update_key` to `update_value` on the record where `key` equals
    /// `value`. Matching nothing is a no-op.
    async fn update_one(
        &self,
        table: &str,
        key: &str,
        value: &Value,
        update_key: &str,
        update_value: &Value,
    ) -> EngineResult<()>;

    /// Creates tables/collections and indexes, then seeds the bookmark for
    /// `indexer_id`. Safe to call repeatedly.
    async fn migrate(&self, indexer_id: &str, last_block_height: u64) -> EngineResult<()>;

    /// Releases the underlying connection. A second call is a no-op.
    async fn close(&self) -> EngineResult<()>;
}

/// Typed access to a [`StorageEngine`] through [`Entity`] shapes.
#[async_trait]
pub trait EntityStore {
    async fn find_entity<E: Entity>(&self, key: &str, value: Value) -> EngineResult<E>;

    async fn insert_entity<E: Entity>(&self, entity: &E) -> EngineResult<()>;

    async fn insert_entities<E: Entity>(&self, entities: &[E]) -> EngineResult<()>;
}

#[async_trait]
impl<T> EntityStore for T
where
    T: StorageEngine + ?Sized,
{
    async fn find_entity<E: Entity>(&self, key: &str, value: Value) -> EngineResult<E> {
        let record = self.find_one(E::TABLE, key, &value).await?;
        E::from_record(record)
    }

    async fn insert_entity<E: Entity>(&self, entity: &E) -> EngineResult<()> {
        let record = entity.to_record()?;
        self.insert_one(E::TABLE, &record).await
    }

    async fn insert_entities<E: Entity>(&self, entities: &[E]) -> EngineResult<()> {
        let records = entities
            .iter()
            .map(Entity::to_record)
            .collect::<EngineResult<Vec<Record>>>()?;
        self.insert_many(E::TABLE, &records).await
    }
}
