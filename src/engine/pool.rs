// SPDX-License-Identifier: Apache-2.0

//! Engine Pool
//!
//! Owns every registered storage engine and fans operations out to all of
//! them concurrently. A call succeeds only when every engine succeeded; the
//! first failure cancels the siblings still in flight and is returned with
//! the identity of the engine that produced it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::engine::error::{EngineError, EngineFailure, EngineResult, PoolError};
use crate::engine::traits::{EntityStore, StorageEngine};
use crate::engine::types::Value;
use crate::model::{Entity, Indexer};

/// Fan-out coordinator over all registered engines
pub struct EnginePool {
    engines: Vec<Arc<dyn StorageEngine>>,
    span: Span,
    cancel: CancellationToken,
}

impl EnginePool {
    pub fn new() -> Self {
        Self::with_span(info_span!("engine_pool"))
    }

    /// Creates a pool logging under `span`.
    pub fn with_span(span: Span) -> Self {
        Self {
            engines: Vec::new(),
            span,
            cancel: CancellationToken::new(),
        }
    }

    pub fn register_engine(&mut self, engine: Arc<dyn StorageEngine>) {
        info!(
            parent: &self.span,
            name = engine.name(),
            engine = %engine.engine(),
            database_type = %engine.database_type(),
            "engine registered"
        );
        self.engines.push(engine);
    }

    pub fn engines(&self) -> &[Arc<dyn StorageEngine>] {
        &self.engines
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Root token shared by every fan-out. Cancelling it aborts all
    /// in-flight and future operations of this pool.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Creates schema and seeds the bookmark on every engine.
    pub async fn migrate(&self, indexer_id: &str, last_block_height: u64) -> Result<(), PoolError> {
        // Every engine seeds this bookmark; refuse heights none can store
        Indexer::new(indexer_id, last_block_height)
            .to_record()
            .map_err(PoolError::InvalidRecord)?;

        self.fan_out("migrate", |engine| engine.migrate(indexer_id, last_block_height))
            .await?;
        info!(parent: &self.span, indexer_id, engines = self.len(), "migration complete");
        Ok(())
    }

    pub async fn insert_one<E: Entity>(&self, entity: &E) -> Result<(), PoolError> {
        let record = entity.to_record().map_err(PoolError::InvalidRecord)?;
        self.fan_out("insert_one", |engine| engine.insert_one(E::TABLE, &record))
            .await?;
        Ok(())
    }

    pub async fn insert_many<E: Entity>(&self, entities: &[E]) -> Result<(), PoolError> {
        if entities.is_empty() {
            return Ok(());
        }
        let records = entities
            .iter()
            .map(Entity::to_record)
            .collect::<EngineResult<Vec<_>>>()
            .map_err(PoolError::InvalidRecord)?;
        self.fan_out("insert_many", |engine| engine.insert_many(E::TABLE, &records))
            .await?;
        Ok(())
    }

    pub async fn update_one(
        &self,
        table: &str,
        key: &str,
        value: &Value,
        update_key: &str,
        update_value: &Value,
    ) -> Result<(), PoolError> {
        self.fan_out("update_one", |engine| {
            engine.update_one(table, key, value, update_key, update_value)
        })
        .await?;
        Ok(())
    }

    /// Reads the bookmark of `indexer_id` from every engine.
    ///
    /// Returns one entry per engine holding the bookmark, in registration
    /// order. Engines without it are skipped; any other failure fails the
    /// whole call.
    pub async fn get_indexer(&self, indexer_id: &str) -> Result<Vec<Indexer>, PoolError> {
        let id = Value::from(indexer_id);
        let found = self
            .fan_out("get_indexer", |engine| {
                let id = id.clone();
                async move {
                    match engine.find_entity::<Indexer>("index_id", id).await {
                        Ok(indexer) => Ok(Some(indexer)),
                        Err(e) if e.is_not_found() => Ok(None),
                        Err(e) => Err(e),
                    }
                }
                .boxed()
            })
            .await?;
        Ok(found.into_iter().flatten().collect())
    }

    /// Closes every engine in registration order.
    ///
    /// Every engine is attempted even when an earlier one fails; all
    /// failures are reported together.
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut failures = Vec::new();
        for engine in &self.engines {
            match engine.close().await {
                Ok(()) => debug!(parent: &self.span, name = engine.name(), "engine closed"),
                Err(err) => {
                    let failure = EngineFailure::new(engine.identity(), err);
                    warn!(parent: &self.span, %failure, "failed to close engine");
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(failures))
        }
    }

    /// Runs `op` against every engine concurrently.
    ///
    /// Results land in the slot of the engine that produced them, so the
    /// output follows registration order regardless of completion order.
    async fn fan_out<'a, T, F>(&'a self, operation: &'static str, op: F) -> Result<Vec<T>, EngineFailure>
    where
        T: Send + 'a,
        F: Fn(&'a dyn StorageEngine) -> BoxFuture<'a, EngineResult<T>>,
    {
        let token = self.cancel.child_token();

        let mut pending: FuturesUnordered<_> = self
            .engines
            .iter()
            .enumerate()
            .map(|(slot, engine)| {
                let token = token.clone();
                let span = info_span!(parent: &self.span, "engine", name = engine.name(), operation);
                let call = AssertUnwindSafe(op(engine.as_ref())).catch_unwind();
                async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(EngineError::Cancelled),
                        result = call => result.unwrap_or_else(|panic| {
                            Err(EngineError::internal(format!(
                                "engine panicked: {}",
                                panic_message(panic.as_ref())
                            )))
                        }),
                    };
                    (slot, outcome)
                }
                .instrument(span)
            })
            .collect();

        let mut slots: Vec<Option<T>> = self.engines.iter().map(|_| None).collect();
        let mut first_failure: Option<EngineFailure> = None;

        while let Some((slot, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => slots[slot] = Some(value),
                Err(err) if first_failure.is_none() => {
                    let failure = EngineFailure::new(self.engines[slot].identity(), err);
                    error!(parent: &self.span, operation, %failure, "engine operation failed");
                    token.cancel();
                    first_failure = Some(failure);
                }
                Err(err) => {
                    debug!(
                        parent: &self.span,
                        operation,
                        name = self.engines[slot].name(),
                        %err,
                        "engine aborted after sibling failure"
                    );
                }
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(slots.into_iter().flatten().collect()),
        }
    }
}

impl Default for EnginePool {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{DatabaseEngine, DatabaseType, Record};
    use crate::model::{Block, INDEXERS_TABLE};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const INDEXER_ID: &str = "11111111-1111-1111-1111-111111111111";
    const UNIQUE_FIELDS: &[&str] = &["index_id", "hash"];

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Normal,
        Fail,
        Panic,
        Stall,
    }

    struct MockEngine {
        name: String,
        engine: DatabaseEngine,
        behavior: Behavior,
        tables: Mutex<HashMap<String, Vec<Record>>>,
        completed: AtomicBool,
        close_calls: AtomicUsize,
        fail_close: bool,
    }

    impl MockEngine {
        fn new(name: &str, engine: DatabaseEngine) -> Self {
            Self {
                name: name.to_string(),
                engine,
                behavior: Behavior::Normal,
                tables: Mutex::new(HashMap::new()),
                completed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                fail_close: false,
            }
        }

        fn with_behavior(mut self, behavior: Behavior) -> Self {
            self.behavior = behavior;
            self
        }

        fn failing_close(mut self) -> Self {
            self.fail_close = true;
            self
        }

        async fn act(&self) -> EngineResult<()> {
            match self.behavior {
                Behavior::Normal => Ok(()),
                Behavior::Fail => Err(EngineError::connection("connection reset")),
                Behavior::Panic => panic!("driver bug"),
                Behavior::Stall => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    self.completed.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        }

        fn rows(&self, table: &str) -> Vec<Record> {
            self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl StorageEngine for MockEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn database_type(&self) -> DatabaseType {
            self.engine.database_type()
        }

        fn engine(&self) -> DatabaseEngine {
            self.engine
        }

        async fn find_one(&self, table: &str, key: &str, value: &Value) -> EngineResult<Record> {
            self.act().await?;
            self.rows(table)
                .into_iter()
                .find(|r| r.get(key) == Some(value))
                .ok_or_else(|| EngineError::not_found(table, key, value))
        }

        async fn insert_one(&self, table: &str, record: &Record) -> EngineResult<()> {
            self.insert_many(table, std::slice::from_ref(record)).await
        }

        async fn insert_many(&self, table: &str, records: &[Record]) -> EngineResult<()> {
            self.act().await?;
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            for record in records {
                for field in UNIQUE_FIELDS {
                    if let Some(v) = record.get(field) {
                        if rows.iter().any(|r| r.get(field) == Some(v)) {
                            return Err(EngineError::constraint(format!("duplicate {}", field)));
                        }
                    }
                }
                rows.push(record.clone());
            }
            Ok(())
        }

        async fn update_one(
            &self,
            table: &str,
            key: &str,
            value: &Value,
            update_key: &str,
            update_value: &Value,
        ) -> EngineResult<()> {
            self.act().await?;
            let mut tables = self.tables.lock().unwrap();
            if let Some(row) = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| r.get(key) == Some(value)))
            {
                row.insert(update_key, update_value.clone());
            }
            Ok(())
        }

        async fn migrate(&self, indexer_id: &str, last_block_height: u64) -> EngineResult<()> {
            self.act().await?;
            let id = Value::from(indexer_id);
            if self.find_one(INDEXERS_TABLE, "index_id", &id).await.is_err() {
                let bookmark = Indexer::new(indexer_id, last_block_height).to_record()?;
                self.insert_one(INDEXERS_TABLE, &bookmark).await?;
            }
            Ok(())
        }

        async fn close(&self) -> EngineResult<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(EngineError::connection("close failed"));
            }
            Ok(())
        }
    }

    fn pool_of(engines: Vec<Arc<MockEngine>>) -> EnginePool {
        let mut pool = EnginePool::new();
        for engine in engines {
            pool.register_engine(engine);
        }
        pool
    }

    #[tokio::test]
    async fn test_migrate_and_get_indexer_on_every_engine() {
        let engines: Vec<_> = [
            ("main", DatabaseEngine::Postgres),
            ("replica", DatabaseEngine::MySql),
            ("docs", DatabaseEngine::MongoDb),
        ]
        .into_iter()
        .map(|(name, engine)| Arc::new(MockEngine::new(name, engine)))
        .collect();
        let pool = pool_of(engines.clone());

        pool.migrate(INDEXER_ID, 1).await.unwrap();
        pool.migrate(INDEXER_ID, 1).await.unwrap();

        for engine in &engines {
            assert_eq!(engine.rows(INDEXERS_TABLE).len(), 1);
        }

        let bookmarks = pool.get_indexer(INDEXER_ID).await.unwrap();
        assert_eq!(bookmarks.len(), 3);
        assert!(bookmarks.iter().all(|b| b.index_id == INDEXER_ID && b.last_block_height == 1));
    }

    #[tokio::test]
    async fn test_failure_is_attributed_to_the_engine() {
        let pool = pool_of(vec![
            Arc::new(MockEngine::new("main", DatabaseEngine::Postgres)),
            Arc::new(MockEngine::new("docs", DatabaseEngine::MongoDb).with_behavior(Behavior::Fail)),
        ]);

        let err = pool.migrate(INDEXER_ID, 1).await.unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].identity.name, "docs");
        assert!(failures[0].source.is_connection());
        assert_eq!(
            err.to_string(),
            "dbName=docs, dbEngine=mongodb, dbType=nosql, err: Connection error: connection reset"
        );
    }

    #[tokio::test]
    async fn test_first_failure_cancels_stalled_siblings() {
        let stalled = Arc::new(MockEngine::new("slow", DatabaseEngine::MySql).with_behavior(Behavior::Stall));
        let pool = pool_of(vec![
            stalled.clone(),
            Arc::new(MockEngine::new("broken", DatabaseEngine::Postgres).with_behavior(Behavior::Fail)),
        ]);

        let result = tokio::time::timeout(Duration::from_secs(5), pool.insert_one(&Block::default()))
            .await
            .expect("fan-out should stop once a sibling fails");

        let err = result.unwrap_err();
        assert_eq!(err.failures()[0].identity.name, "broken");
        assert!(!stalled.completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_root_token_cancels_operations() {
        let pool = pool_of(vec![Arc::new(
            MockEngine::new("slow", DatabaseEngine::MySql).with_behavior(Behavior::Stall),
        )]);
        pool.cancel_token().cancel();

        let err = pool.migrate(INDEXER_ID, 1).await.unwrap_err();
        assert!(matches!(err.failures()[0].source, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_engine_is_reported() {
        let pool = pool_of(vec![
            Arc::new(MockEngine::new("main", DatabaseEngine::Postgres)),
            Arc::new(MockEngine::new("buggy", DatabaseEngine::MariaDb).with_behavior(Behavior::Panic)),
        ]);

        let err = pool.insert_one(&Block::default()).await.unwrap_err();
        let failure = err.failures()[0];
        assert_eq!(failure.identity.name, "buggy");
        assert!(matches!(failure.source, EngineError::Internal { .. }));
        assert!(failure.to_string().contains("driver bug"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_a_constraint_violation() {
        let pool = pool_of(vec![
            Arc::new(MockEngine::new("main", DatabaseEngine::Postgres)),
            Arc::new(MockEngine::new("docs", DatabaseEngine::MongoDb)),
        ]);
        let block = Block {
            height: 100,
            hash: "0xabc".to_string(),
            ..Default::default()
        };

        pool.insert_one(&block).await.unwrap();
        let err = pool.insert_one(&block).await.unwrap_err();
        assert!(err.failures()[0].source.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_insert_many_and_update_one() {
        let engine = Arc::new(MockEngine::new("main", DatabaseEngine::Postgres));
        let pool = pool_of(vec![engine.clone()]);

        pool.insert_many::<Block>(&[]).await.unwrap();
        assert!(engine.rows("blocks").is_empty());

        let blocks: Vec<Block> = (1..=3)
            .map(|h| Block {
                height: h,
                hash: format!("0x{:02x}", h),
                ..Default::default()
            })
            .collect();
        pool.insert_many(&blocks).await.unwrap();
        assert_eq!(engine.rows("blocks").len(), 3);

        pool.migrate(INDEXER_ID, 1).await.unwrap();
        pool.update_one(
            INDEXERS_TABLE,
            "index_id",
            &Value::from(INDEXER_ID),
            "last_block_height",
            &Value::Int(42),
        )
        .await
        .unwrap();
        // no match is not an error
        pool.update_one(INDEXERS_TABLE, "index_id", &Value::from("other"), "last_block_height", &Value::Int(1))
            .await
            .unwrap();

        let bookmarks = pool.get_indexer(INDEXER_ID).await.unwrap();
        assert_eq!(bookmarks[0].last_block_height, 42);
    }

    #[tokio::test]
    async fn test_get_indexer_skips_engines_without_bookmark() {
        let seeded = Arc::new(MockEngine::new("main", DatabaseEngine::Postgres));
        seeded.migrate(INDEXER_ID, 7).await.unwrap();
        let pool = pool_of(vec![seeded, Arc::new(MockEngine::new("fresh", DatabaseEngine::MongoDb))]);

        let bookmarks = pool.get_indexer(INDEXER_ID).await.unwrap();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].last_block_height, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_indexer_returns_one_result_per_engine_under_stress() {
        let engines: Vec<_> = (0..8)
            .map(|i| Arc::new(MockEngine::new(&format!("engine-{}", i), DatabaseEngine::MongoDb)))
            .collect();
        let pool = Arc::new(pool_of(engines));
        pool.migrate(INDEXER_ID, 1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let bookmarks = pool.get_indexer(INDEXER_ID).await.unwrap();
                    assert_eq!(bookmarks.len(), 8);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_attempts_every_engine() {
        let engines = vec![
            Arc::new(MockEngine::new("a", DatabaseEngine::Postgres).failing_close()),
            Arc::new(MockEngine::new("b", DatabaseEngine::MySql)),
            Arc::new(MockEngine::new("c", DatabaseEngine::MongoDb).failing_close()),
        ];
        let pool = pool_of(engines.clone());

        let err = pool.close().await.unwrap_err();
        assert!(matches!(err, PoolError::Close(_)));
        let names: Vec<_> = err.failures().iter().map(|f| f.identity.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(engines.iter().all(|e| e.close_calls.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn test_migrate_rejects_unstorable_height() {
        let engine = Arc::new(MockEngine::new("main", DatabaseEngine::Postgres));
        let pool = pool_of(vec![engine.clone()]);

        let err = pool.migrate(INDEXER_ID, u64::MAX).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRecord(EngineError::Config { .. })));
        assert!(err.failures().is_empty());
        // No engine was touched
        assert!(engine.rows(INDEXERS_TABLE).is_empty());

        let bookmark = Indexer::new(INDEXER_ID, u64::MAX);
        let err = pool.insert_one(&bookmark).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRecord(_)));
        assert!(engine.rows(INDEXERS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_operations_succeed() {
        let pool = EnginePool::default();
        assert!(pool.is_empty());
        pool.migrate(INDEXER_ID, 1).await.unwrap();
        assert!(pool.get_indexer(INDEXER_ID).await.unwrap().is_empty());
        pool.close().await.unwrap();
    }
}
