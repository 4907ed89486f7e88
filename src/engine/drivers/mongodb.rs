// SPDX-License-Identifier: Apache-2.0

//! MongoDB Driver
//!
//! Implements the StorageEngine trait for MongoDB using the official driver.
//! Tables map to collections of the configured database; records map to
//! documents with the server-assigned `_id` hidden from callers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::schema::{
    migrations_schema, Catalog, TableSchema, MIGRATIONS_TABLE, SCHEMA_VERSION,
};
use crate::engine::traits::StorageEngine;
use crate::engine::types::{DatabaseEngine, DatabaseType, Record, Value};
use crate::model::{Entity, Indexer, INDEXERS_TABLE};

const DOCUMENT_ID: &str = "_id";
const DUPLICATE_KEY_CODE: i32 = 11000;
const MAX_CONNECTING: u32 = 500;
const MIN_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps driver failures onto the engine taxonomy.
pub(crate) fn map_mongo_error(err: mongodb::error::Error) -> EngineError {
    if is_duplicate_key(&err) {
        return EngineError::constraint(err.to_string());
    }

    match err.kind.as_ref() {
        ErrorKind::InvalidArgument { .. } => EngineError::config(err.to_string()),
        ErrorKind::Authentication { .. }
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => EngineError::connection(err.to_string()),
        ErrorKind::BsonDeserialization(_) | ErrorKind::BsonSerialization(_) => {
            EngineError::decode(err.to_string())
        }
        _ => EngineError::execution(err.to_string()),
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    let coded = match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    };
    // Bulk insert failures only carry the code inside nested write errors
    coded || err.to_string().contains("E11000")
}

/// Convert universal Value to BSON
fn value_to_bson(value: &Value) -> EngineResult<Bson> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Text(s) => Bson::String(s.clone()),
        Value::Timestamp(ts) => Bson::DateTime(bson::DateTime::from_millis(ts.timestamp_millis())),
        Value::Array(items) => Bson::Array(
            items
                .iter()
                .map(value_to_bson)
                .collect::<EngineResult<Vec<_>>>()?,
        ),
        Value::Json(j) => bson::to_bson(j)
            .map_err(|e| EngineError::decode(format!("value {} has no BSON form: {}", j, e)))?,
    })
}

/// Convert BSON back to a universal Value
fn bson_to_value(value: Bson) -> EngineResult<Value> {
    Ok(match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i as i64),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::String(s) => Value::Text(s),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(Value::Timestamp)
            .ok_or_else(|| {
                EngineError::decode(format!("stored date {} is out of range", dt.timestamp_millis()))
            })?,
        Bson::Array(items) => Value::Array(
            items
                .into_iter()
                .map(bson_to_value)
                .collect::<EngineResult<Vec<_>>>()?,
        ),
        other => Value::Json(other.into_relaxed_extjson()),
    })
}

fn record_to_document(record: &Record) -> EngineResult<Document> {
    let mut doc = Document::new();
    for (key, value) in record.iter() {
        doc.insert(key.clone(), value_to_bson(value)?);
    }
    Ok(doc)
}

fn document_to_record(doc: Document) -> EngineResult<Record> {
    doc.into_iter()
        .filter(|(key, _)| key != DOCUMENT_ID)
        .map(|(key, value)| Ok((key, bson_to_value(value)?)))
        .collect()
}

fn index_models(table: &TableSchema) -> Vec<IndexModel> {
    table
        .indexes
        .iter()
        .map(|index| {
            let options = IndexOptions::builder()
                .name(index.name(table.name))
                .unique(index.unique)
                .build();
            let mut keys = Document::new();
            keys.insert(index.column, 1i32);
            IndexModel::builder()
                .keys(keys)
                .options(options)
                .build()
        })
        .collect()
}

/// Document storage engine
pub struct MongoEngine {
    name: String,
    database: String,
    catalog: Catalog,
    client: RwLock<Option<Client>>,
}

impl MongoEngine {
    /// Builds a client for `config` and pings the server before returning.
    #[instrument(skip(config, catalog), fields(name = %config.name, engine = %config.engine))]
    pub async fn connect(config: &DatabaseConfig, catalog: Catalog) -> EngineResult<Self> {
        if config.engine != DatabaseEngine::MongoDb {
            return Err(EngineError::config(format!(
                "engine {} is not a document engine (db '{}')",
                config.engine, config.name
            )));
        }
        let database = config
            .database
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                EngineError::config(format!("db '{}': mongodb requires a database name", config.name))
            })?;

        let mut options = ClientOptions::parse(config.uri.expose())
            .await
            .map_err(|e| EngineError::config(format!("invalid mongodb uri: {}", e)))?;
        let connect_timeout = config.connect_timeout();
        options.connect_timeout = Some(connect_timeout);
        options.server_selection_timeout = Some(connect_timeout.max(MIN_SERVER_SELECTION_TIMEOUT));
        options.max_connecting = Some(MAX_CONNECTING);
        if let Some(max) = config.max_connections {
            options.max_pool_size = Some(max);
        }

        let client = Client::with_options(options).map_err(map_mongo_error)?;

        client
            .database(&database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| EngineError::connection(format!("ping failed: {}", e)))?;

        info!(database = %database, "MongoDB engine connected");

        Ok(Self {
            name: config.name.clone(),
            database,
            catalog,
            client: RwLock::new(Some(client)),
        })
    }

    async fn collection(&self, table: &str) -> EngineResult<Collection<Document>> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or_else(|| EngineError::closed(&self.name))?;
        Ok(client.database(&self.database).collection::<Document>(table))
    }

    async fn create_indexes(&self, table: &TableSchema) -> EngineResult<()> {
        let models = index_models(table);
        if models.is_empty() {
            return Ok(());
        }
        self.collection(table.name)
            .await?
            .create_indexes(models)
            .await
            .map_err(map_mongo_error)?;
        debug!(collection = table.name, "indexes ensured");
        Ok(())
    }

    async fn schema_applied(&self) -> EngineResult<bool> {
        let marker = self
            .collection(MIGRATIONS_TABLE)
            .await?
            .find_one(doc! { "version": SCHEMA_VERSION })
            .await
            .map_err(map_mongo_error)?;
        Ok(marker.is_some())
    }
}

#[async_trait]
impl StorageEngine for MongoEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::NoSql
    }

    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::MongoDb
    }

    async fn find_one(&self, table: &str, key: &str, value: &Value) -> EngineResult<Record> {
        let mut filter = Document::new();
        filter.insert(key, value_to_bson(value)?);

        let doc = self
            .collection(table)
            .await?
            .find_one(filter)
            .await
            .map_err(map_mongo_error)?;

        match doc {
            Some(doc) => document_to_record(doc),
            None => Err(EngineError::not_found(table, key, value)),
        }
    }

    async fn insert_one(&self, table: &str, record: &Record) -> EngineResult<()> {
        self.collection(table)
            .await?
            .insert_one(record_to_document(record)?)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn insert_many(&self, table: &str, records: &[Record]) -> EngineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let docs = records
            .iter()
            .map(record_to_document)
            .collect::<EngineResult<Vec<_>>>()?;
        self.collection(table)
            .await?
            .insert_many(docs)
            .await
            .map_err(map_mongo_error)?;
        debug!(collection = table, documents = records.len(), "inserted");
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
        let mut filter = Document::new();
        filter.insert(key, value_to_bson(value)?);
        let mut set = Document::new();
        set.insert(update_key, value_to_bson(update_value)?);

        let result = self
            .collection(table)
            .await?
            .update_one(filter, doc! { "$set": set })
            .upsert(false)
            .await
            .map_err(map_mongo_error)?;

        if result.matched_count == 0 {
            debug!(collection = table, key, %value, "update matched no documents");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(name = %self.name, database = %self.database))]
    async fn migrate(&self, indexer_id: &str, last_block_height: u64) -> EngineResult<()> {
        self.create_indexes(&migrations_schema()).await?;

        if self.schema_applied().await? {
            debug!(version = SCHEMA_VERSION, "schema already applied");
        } else {
            for table in self.catalog.tables() {
                self.create_indexes(table).await?;
            }

            let marker = Record::new()
                .with("version", SCHEMA_VERSION)
                .with("description", "create indexer collections")
                .with("applied_at", Utc::now());
            match self.insert_one(MIGRATIONS_TABLE, &marker).await {
                Err(e) if e.is_constraint_violation() => {
                    warn!("schema version recorded concurrently by another migrator");
                }
                other => other?,
            }
            info!(version = SCHEMA_VERSION, "schema applied");
        }

        let id = Value::from(indexer_id);
        match self.find_one(INDEXERS_TABLE, "index_id", &id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let bookmark = Indexer::new(indexer_id, last_block_height).to_record()?;
                match self.insert_one(INDEXERS_TABLE, &bookmark).await {
                    Err(e) if e.is_constraint_violation() => Ok(()),
                    other => {
                        other?;
                        info!(indexer_id, last_block_height, "indexer bookmark seeded");
                        Ok(())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> EngineResult<()> {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.shutdown().await;
            info!(name = %self.name, "MongoDB engine closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, Transaction, TRANSACTIONS_TABLE};
    use crate::observability::Sensitive;
    use mongodb::bson::oid::ObjectId;

    fn config(engine: DatabaseEngine, uri: &str, database: Option<&str>) -> DatabaseConfig {
        DatabaseConfig {
            name: "docs".to_string(),
            db_type: engine.database_type(),
            engine,
            uri: Sensitive::new(uri.to_string()),
            database: database.map(str::to_string),
            connect_timeout_secs: Some(1),
            max_connections: None,
        }
    }

    #[test]
    fn test_record_document_round_trip_drops_object_id() {
        let block = Block {
            height: 100,
            hash: "0xabc".to_string(),
            committers: vec![1, 2, 3],
            ..Default::default()
        };
        let mut doc = record_to_document(&block.to_record().unwrap()).unwrap();
        assert_eq!(doc.get_i64("height").unwrap(), 100);
        assert!(matches!(doc.get("committers"), Some(Bson::Array(_))));

        doc.insert(DOCUMENT_ID, ObjectId::new());
        let record = document_to_record(doc).unwrap();
        assert!(!record.contains_key(DOCUMENT_ID));

        let decoded = Block::from_record(record).unwrap();
        assert_eq!(decoded.height, 100);
        assert_eq!(decoded.hash, "0xabc");
        assert_eq!(decoded.committers, vec![1, 2, 3]);
    }

    #[test]
    fn test_timestamps_keep_millisecond_precision() {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let bson = value_to_bson(&Value::Timestamp(ts)).unwrap();
        assert_eq!(bson_to_value(bson).unwrap(), Value::Timestamp(ts));
    }

    #[test]
    fn test_nanosecond_timestamps_read_back_as_encoded() {
        let created_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let tx = Transaction {
            hash: "0xfeed".to_string(),
            block_height: 100,
            version: 1,
            tx_type: "transfer".to_string(),
            from: "pc1zfrom".to_string(),
            to: "pc1zto".to_string(),
            value: 1_000,
            fee: 10,
            memo: String::new(),
            created_at,
        };
        let record = tx.to_record().unwrap();

        let stored = document_to_record(record_to_document(&record).unwrap()).unwrap();
        assert_eq!(stored, record);

        let decoded = Transaction::from_record(stored).unwrap();
        assert_eq!(decoded.created_at.timestamp_millis(), created_at.timestamp_millis());
        assert_eq!(decoded.created_at.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_unrepresentable_json_is_a_decode_error() {
        let record = Record::new().with("payload", Value::Json(serde_json::json!({ "n": u64::MAX })));
        let err = record_to_document(&record).unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_out_of_range_date_is_a_decode_error() {
        let err = bson_to_value(Bson::DateTime(bson::DateTime::MAX)).unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }), "unexpected error: {err}");

        let mut doc = Document::new();
        doc.insert("created_at", bson::DateTime::MAX);
        assert!(document_to_record(doc).is_err());
    }

    #[test]
    fn test_bson_conversions() {
        assert_eq!(bson_to_value(Bson::Int32(7)).unwrap(), Value::Int(7));
        assert_eq!(bson_to_value(Bson::Undefined).unwrap(), Value::Null);

        let oid = ObjectId::new();
        assert_eq!(bson_to_value(Bson::ObjectId(oid)).unwrap(), Value::Text(oid.to_hex()));

        let nested = bson_to_value(Bson::Document(doc! { "a": 1 })).unwrap();
        assert_eq!(nested, Value::Json(serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn test_index_models_use_shared_names() {
        let models = index_models(&Indexer::schema());
        assert_eq!(models.len(), 1);
        let options = models[0].options.as_ref().unwrap();
        assert_eq!(options.name.as_deref(), Some("indexers_index_id_unique"));
        assert_eq!(options.unique, Some(true));
    }

    #[tokio::test]
    async fn test_connect_rejects_sql_engine() {
        let err = MongoEngine::connect(
            &config(DatabaseEngine::MySql, "mysql://localhost/indexer", Some("indexer")),
            Catalog::indexer(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[tokio::test]
    async fn test_connect_requires_database_name() {
        let err = MongoEngine::connect(
            &config(DatabaseEngine::MongoDb, "mongodb://localhost:27017", None),
            Catalog::indexer(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("requires a database name"));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_uri() {
        let err = MongoEngine::connect(
            &config(DatabaseEngine::MongoDb, "http://localhost:27017", Some("indexer")),
            Catalog::indexer(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_later_calls_fail() {
        // The driver connects lazily, so no server is needed
        let options = ClientOptions::parse("mongodb://127.0.0.1:1/?directConnection=true")
            .await
            .unwrap();
        let engine = MongoEngine {
            name: "docs".to_string(),
            database: "indexer".to_string(),
            catalog: Catalog::indexer(),
            client: RwLock::new(Some(Client::with_options(options).unwrap())),
        };

        engine.close().await.unwrap();
        engine.close().await.unwrap();

        let err = engine
            .find_one(TRANSACTIONS_TABLE, "hash", &Value::from("0xabc"))
            .await
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
        assert!(err.to_string().contains("is closed"));

        let err = engine
            .insert_many(TRANSACTIONS_TABLE, &[Record::new().with("hash", "0xabc")])
            .await
            .unwrap_err();
        assert!(err.is_connection());

        let err = engine.migrate("indexer", 1).await.unwrap_err();
        assert!(err.is_connection());
    }
}
