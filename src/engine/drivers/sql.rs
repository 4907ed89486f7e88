// SPDX-License-Identifier: Apache-2.0

//! SQL Driver
//!
//! Implements the StorageEngine trait for MySQL, MariaDB and PostgreSQL
//! using SQLx. MariaDB speaks the MySQL protocol and shares its dialect.
//!
//! ## Statement caching
//!
//! Every statement goes through the extended protocol and SQLx keeps a
//! per-connection cache of prepared statements, so repeated lookups and
//! inserts reuse the server-side plan. Single statements run without an
//! explicit transaction; only batches that must be split across several
//! statements are wrapped in one.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::error::ErrorKind;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Column, Row};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::schema::{
    migrations_schema, Catalog, ColumnType, TableSchema, MIGRATIONS_TABLE, SCHEMA_VERSION,
};
use crate::engine::sql_generator::{SqlDialect, SURROGATE_KEY};
use crate::engine::traits::StorageEngine;
use crate::engine::types::{DatabaseEngine, DatabaseType, Record, Value, TIMESTAMP_PRECISION};
use crate::model::{Entity, Indexer, INDEXERS_TABLE};

/// Upper bound on bind parameters in one statement (both protocols use a
/// 16-bit parameter count).
const MAX_BIND_PARAMS: usize = 65_535;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const STATEMENT_CACHE_CAPACITY: usize = 256;

static NULL_VALUE: Value = Value::Null;

/// A value to bind, with the declared type of the column it targets when
/// the table is known.
type BindParam<'a> = (&'a Value, Option<ColumnType>);

/// Binds a [`Value`] onto a SQLx query.
///
/// NULLs and JSON payloads are typed from the column hint so PostgreSQL
/// does not have to infer a parameter type from an untyped NULL.
macro_rules! bind_value {
    ($query:expr, $value:expr, $hint:expr) => {{
        let query = $query;
        let value: &Value = $value;
        let hint: Option<ColumnType> = $hint;
        match (value, hint) {
            (Value::Null, Some(ColumnType::BigInt)) => query.bind(Option::<i64>::None),
            (Value::Null, Some(ColumnType::Timestamp)) => {
                query.bind(Option::<DateTime<Utc>>::None)
            }
            (Value::Null, Some(ColumnType::Json)) => {
                query.bind(Option::<serde_json::Value>::None)
            }
            (Value::Null, _) => query.bind(Option::<String>::None),
            (_, Some(ColumnType::Json)) | (Value::Array(_), _) | (Value::Json(_), _) => {
                query.bind(value.to_json())
            }
            (Value::Int(i), Some(ColumnType::VarChar(_)))
            | (Value::Int(i), Some(ColumnType::Text)) => query.bind(i.to_string()),
            (Value::Bool(b), _) => query.bind(*b),
            (Value::Int(i), _) => query.bind(*i),
            (Value::Float(f), _) => query.bind(*f),
            (Value::Text(s), _) => query.bind(s.clone()),
            (Value::Timestamp(ts), _) => query.bind(ts.trunc_subsecs(TIMESTAMP_PRECISION)),
        }
    }};
}

/// Reads one column of a known table according to its declared type.
macro_rules! decode_column {
    ($row:expr, $name:expr, $column_type:expr) => {{
        let row = $row;
        let name: &str = $name;
        let decoded = match $column_type {
            ColumnType::BigInt => row.try_get::<Option<i64>, _>(name).map(|v| v.map(Value::Int)),
            ColumnType::VarChar(_) | ColumnType::Text => {
                row.try_get::<Option<String>, _>(name).map(|v| v.map(Value::Text))
            }
            ColumnType::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(name)
                .map(|v| v.map(Value::Timestamp)),
            // MariaDB reports JSON columns as LONGTEXT
            ColumnType::Json => match row.try_get::<Option<serde_json::Value>, _>(name) {
                Ok(v) => Ok(v.map(Value::from_json)),
                Err(_) => row.try_get::<Option<String>, _>(name).map(|v| v.map(Value::Text)),
            },
        };
        decoded
            .map(|v| v.unwrap_or(Value::Null))
            .map_err(map_sqlx_error)
    }};
}

/// Best-effort decode of a column whose type is not in the catalog.
macro_rules! extract_value {
    ($row:expr, $idx:expr) => {{
        let row = $row;
        let idx: usize = $idx;
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(Value::Int).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(Value::Float).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(Value::Text).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            v.map(Value::Timestamp).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            v.map(Value::from_json).unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    }};
}

/// Converts a row into a [`Record`], dropping the surrogate key.
macro_rules! decode_row {
    ($row:expr, $schema:expr) => {{
        let row = $row;
        let mut record = Record::new();
        match $schema {
            Some(schema) => {
                for column in &schema.columns {
                    let value = decode_column!(row, column.name, column.column_type)?;
                    record.insert(column.name, value);
                }
            }
            None => {
                for column in row.columns() {
                    if column.name() == SURROGATE_KEY {
                        continue;
                    }
                    record.insert(column.name(), extract_value!(row, column.ordinal()));
                }
            }
        }
        record
    }};
}

/// Maps SQLx failures onto the engine taxonomy.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    match &err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => EngineError::constraint(db.message()),
            _ => EngineError::execution(err.to_string()),
        },
        sqlx::Error::Configuration(_) => EngineError::config(err.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EngineError::connection(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. } => EngineError::decode(err.to_string()),
        _ => EngineError::execution(err.to_string()),
    }
}

/// Connect-time failures are connection errors unless the URI itself is bad.
fn map_connect_error(err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Configuration(_) => EngineError::config(err.to_string()),
        other => EngineError::connection(other.to_string()),
    }
}

#[derive(Clone)]
enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl SqlPool {
    async fn connect(
        dialect: SqlDialect,
        uri: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> EngineResult<Self> {
        match dialect {
            SqlDialect::Postgres => {
                let options = PgConnectOptions::from_str(uri)
                    .map_err(|e| EngineError::config(format!("invalid postgres uri: {}", e)))?
                    .statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(map_connect_error)?;
                Ok(SqlPool::Postgres(pool))
            }
            SqlDialect::MySql => {
                let options = MySqlConnectOptions::from_str(uri)
                    .map_err(|e| EngineError::config(format!("invalid mysql uri: {}", e)))?
                    .statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
                let pool = MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await
                    .map_err(map_connect_error)?;
                Ok(SqlPool::MySql(pool))
            }
        }
    }

    async fn close(&self) {
        match self {
            SqlPool::Postgres(pool) => pool.close().await,
            SqlPool::MySql(pool) => pool.close().await,
        }
    }

    /// Runs an unparameterized statement (DDL).
    async fn execute_raw(&self, sql: &str) -> EngineResult<()> {
        let result = match self {
            SqlPool::Postgres(pool) => sqlx::raw_sql(sql).execute(pool).await.map(|_| ()),
            SqlPool::MySql(pool) => sqlx::raw_sql(sql).execute(pool).await.map(|_| ()),
        };
        result.map_err(map_sqlx_error)
    }

    /// Runs one parameterized statement and returns the affected row count.
    async fn execute(&self, sql: &str, params: &[BindParam<'_>]) -> EngineResult<u64> {
        let result = match self {
            SqlPool::Postgres(pool) => {
                let mut query = sqlx::query(sql);
                for (value, hint) in params {
                    query = bind_value!(query, *value, *hint);
                }
                query.execute(pool).await.map(|r| r.rows_affected())
            }
            SqlPool::MySql(pool) => {
                let mut query = sqlx::query(sql);
                for (value, hint) in params {
                    query = bind_value!(query, *value, *hint);
                }
                query.execute(pool).await.map(|r| r.rows_affected())
            }
        };
        result.map_err(map_sqlx_error)
    }

    /// Runs several parameterized statements in one transaction.
    async fn execute_batch(&self, statements: &[(String, Vec<BindParam<'_>>)]) -> EngineResult<()> {
        match self {
            SqlPool::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
                for (sql, params) in statements {
                    let mut query = sqlx::query(sql);
                    for (value, hint) in params {
                        query = bind_value!(query, *value, *hint);
                    }
                    query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
                }
                tx.commit().await.map_err(map_sqlx_error)
            }
            SqlPool::MySql(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
                for (sql, params) in statements {
                    let mut query = sqlx::query(sql);
                    for (value, hint) in params {
                        query = bind_value!(query, *value, *hint);
                    }
                    query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
                }
                tx.commit().await.map_err(map_sqlx_error)
            }
        }
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        param: BindParam<'_>,
        schema: Option<&TableSchema>,
    ) -> EngineResult<Option<Record>> {
        match self {
            SqlPool::Postgres(pool) => {
                let query = bind_value!(sqlx::query(sql), param.0, param.1);
                match query.fetch_optional(pool).await.map_err(map_sqlx_error)? {
                    Some(row) => Ok(Some(decode_row!(&row, schema))),
                    None => Ok(None),
                }
            }
            SqlPool::MySql(pool) => {
                let query = bind_value!(sqlx::query(sql), param.0, param.1);
                match query.fetch_optional(pool).await.map_err(map_sqlx_error)? {
                    Some(row) => Ok(Some(decode_row!(&row, schema))),
                    None => Ok(None),
                }
            }
        }
    }
}

/// Relational storage engine (MySQL, MariaDB, PostgreSQL)
pub struct SqlEngine {
    name: String,
    engine: DatabaseEngine,
    dialect: SqlDialect,
    catalog: Catalog,
    migrations: TableSchema,
    pool: RwLock<Option<SqlPool>>,
}

impl SqlEngine {
    /// Opens a connection pool for `config` and verifies it with one
    /// connection.
    #[instrument(skip(config, catalog), fields(name = %config.name, engine = %config.engine))]
    pub async fn connect(config: &DatabaseConfig, catalog: Catalog) -> EngineResult<Self> {
        let dialect = SqlDialect::from_engine(config.engine).ok_or_else(|| {
            EngineError::config(format!(
                "engine {} is not a SQL engine (db '{}')",
                config.engine, config.name
            ))
        })?;

        let pool = SqlPool::connect(
            dialect,
            config.uri.expose(),
            config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            config.connect_timeout(),
        )
        .await?;

        info!("SQL engine connected");

        Ok(Self {
            name: config.name.clone(),
            engine: config.engine,
            dialect,
            catalog,
            migrations: migrations_schema(),
            pool: RwLock::new(Some(pool)),
        })
    }

    async fn pool(&self) -> EngineResult<SqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::closed(&self.name))
    }

    fn table_schema(&self, table: &str) -> Option<&TableSchema> {
        if table == MIGRATIONS_TABLE {
            return Some(&self.migrations);
        }
        self.catalog.table(table)
    }

    fn column_hint(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.table_schema(table)
            .and_then(|s| s.column(column))
            .map(|c| c.column_type)
    }

    async fn create_tables(&self, pool: &SqlPool, table: &TableSchema) -> EngineResult<()> {
        for statement in self.dialect.create_table(table) {
            debug!(table = table.name, "{}", statement);
            pool.execute_raw(&statement).await?;
        }
        Ok(())
    }

    /// `true` when the marker row for the current schema version exists.
    async fn schema_applied(&self) -> EngineResult<bool> {
        match self
            .find_one(MIGRATIONS_TABLE, "version", &Value::Int(SCHEMA_VERSION))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StorageEngine for SqlEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sql
    }

    fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    async fn find_one(&self, table: &str, key: &str, value: &Value) -> EngineResult<Record> {
        let pool = self.pool().await?;
        let schema = self.table_schema(table);
        let columns: Vec<&str> = schema
            .map(|s| s.column_names().collect())
            .unwrap_or_default();
        let sql = self.dialect.select_one(table, &columns, key);

        pool.fetch_optional(&sql, (value, self.column_hint(table, key)), schema)
            .await?
            .ok_or_else(|| EngineError::not_found(table, key, value))
    }

    async fn insert_one(&self, table: &str, record: &Record) -> EngineResult<()> {
        self.insert_many(table, std::slice::from_ref(record)).await
    }

    async fn insert_many(&self, table: &str, records: &[Record]) -> EngineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let pool = self.pool().await?;

        let columns: Vec<&str> = records
            .iter()
            .flat_map(|r| r.keys().map(String::as_str))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if columns.is_empty() {
            return Err(EngineError::execution(format!(
                "cannot insert records without fields into {}",
                table
            )));
        }

        let hints: Vec<Option<ColumnType>> =
            columns.iter().map(|c| self.column_hint(table, c)).collect();
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

        let mut statements = Vec::new();
        for chunk in records.chunks(rows_per_statement) {
            let sql = self.dialect.insert(table, &columns, chunk.len());
            let mut params = Vec::with_capacity(chunk.len() * columns.len());
            for record in chunk {
                for (column, hint) in columns.iter().zip(&hints) {
                    params.push((record.get(column).unwrap_or(&NULL_VALUE), *hint));
                }
            }
            statements.push((sql, params));
        }

        if let [(sql, params)] = statements.as_slice() {
            pool.execute(sql, params).await?;
        } else {
            pool.execute_batch(&statements).await?;
        }

        debug!(table, rows = records.len(), "inserted");
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
        let pool = self.pool().await?;
        let sql = self.dialect.update_one(table, key, update_key);
        let params = [
            (update_value, self.column_hint(table, update_key)),
            (value, self.column_hint(table, key)),
        ];

        let affected = pool.execute(&sql, &params).await?;
        if affected == 0 {
            debug!(table, key, %value, "update matched no rows");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(name = %self.name, engine = %self.engine))]
    async fn migrate(&self, indexer_id: &str, last_block_height: u64) -> EngineResult<()> {
        let pool = self.pool().await?;

        self.create_tables(&pool, &self.migrations).await?;

        if self.schema_applied().await? {
            debug!(version = SCHEMA_VERSION, "schema already applied");
        } else {
            for table in self.catalog.tables() {
                self.create_tables(&pool, table).await?;
            }

            let marker = Record::new()
                .with("version", SCHEMA_VERSION)
                .with("description", "create indexer tables")
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
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(name = %self.name, "SQL engine closed");
        }
        Ok(())
    }
}
