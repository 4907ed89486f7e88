// SPDX-License-Identifier: Apache-2.0

//! SQL Generator
//!
//! Renders dialect-specific statements for the SQL adapter: DDL from
//! [`TableSchema`] descriptions and parameterized CRUD statements driven by
//! a single equality predicate. Values are always bound, never inlined.

use crate::engine::schema::{ColumnType, TableSchema};
use crate::engine::types::DatabaseEngine;

/// Surrogate primary key carried by every migrated table.
pub const SURROGATE_KEY: &str = "id";

/// SQL dialect for the relational engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
}

impl SqlDialect {
    pub fn from_engine(engine: DatabaseEngine) -> Option<Self> {
        match engine {
            DatabaseEngine::Postgres => Some(SqlDialect::Postgres),
            DatabaseEngine::MySql | DatabaseEngine::MariaDb => Some(SqlDialect::MySql),
            DatabaseEngine::MongoDb => None,
        }
    }

    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            SqlDialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Bind placeholder for the 1-based parameter position
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", position),
            SqlDialect::MySql => "?".to_string(),
        }
    }

    /// Concrete storage type for a logical column type
    pub fn column_type(&self, column_type: ColumnType) -> String {
        match (self, column_type) {
            (_, ColumnType::BigInt) => "BIGINT".to_string(),
            (_, ColumnType::VarChar(len)) => format!("VARCHAR({})", len),
            (_, ColumnType::Text) => "TEXT".to_string(),
            (SqlDialect::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ".to_string(),
            (SqlDialect::MySql, ColumnType::Timestamp) => "DATETIME(6)".to_string(),
            (SqlDialect::Postgres, ColumnType::Json) => "JSONB".to_string(),
            (SqlDialect::MySql, ColumnType::Json) => "JSON".to_string(),
        }
    }

    fn surrogate_key(&self) -> String {
        match self {
            SqlDialect::Postgres => format!("{} BIGSERIAL PRIMARY KEY", self.quote_ident(SURROGATE_KEY)),
            SqlDialect::MySql => format!("{} BIGINT NOT NULL AUTO_INCREMENT", self.quote_ident(SURROGATE_KEY)),
        }
    }

    /// Statements creating the table and its indexes, all idempotent.
    ///
    /// MySQL has no `CREATE INDEX IF NOT EXISTS`, so its indexes are
    /// declared inline in the table definition. PostgreSQL gets one
    /// statement per index.
    pub fn create_table(&self, table: &TableSchema) -> Vec<String> {
        let mut definitions = vec![self.surrogate_key()];
        for column in &table.columns {
            let null = if column.nullable { "NULL" } else { "NOT NULL" };
            definitions.push(format!(
                "{} {} {}",
                self.quote_ident(column.name),
                self.column_type(column.column_type),
                null
            ));
        }

        match self {
            SqlDialect::MySql => {
                definitions.push(format!("PRIMARY KEY ({})", self.quote_ident(SURROGATE_KEY)));
                for index in &table.indexes {
                    let kind = if index.unique { "UNIQUE KEY" } else { "KEY" };
                    definitions.push(format!(
                        "{} {} ({})",
                        kind,
                        self.quote_ident(&index.name(table.name)),
                        self.quote_ident(index.column)
                    ));
                }
                vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    self.quote_ident(table.name),
                    definitions.join(", ")
                )]
            }
            SqlDialect::Postgres => {
                let mut statements = vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    self.quote_ident(table.name),
                    definitions.join(", ")
                )];
                for index in &table.indexes {
                    let kind = if index.unique { "UNIQUE INDEX" } else { "INDEX" };
                    statements.push(format!(
                        "CREATE {} IF NOT EXISTS {} ON {} ({})",
                        kind,
                        self.quote_ident(&index.name(table.name)),
                        self.quote_ident(table.name),
                        self.quote_ident(index.column)
                    ));
                }
                statements
            }
        }
    }

    /// `SELECT … WHERE key = ? LIMIT 1`. An empty column list selects `*`.
    pub fn select_one(&self, table: &str, columns: &[&str], key: &str) -> String {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "SELECT {} FROM {} WHERE {} = {} LIMIT 1",
            projection,
            self.quote_ident(table),
            self.quote_ident(key),
            self.placeholder(1)
        )
    }

    /// Multi-row `INSERT` with `rows` value tuples over `columns`.
    pub fn insert(&self, table: &str, columns: &[&str], rows: usize) -> String {
        let cols_str = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut position = 1;
        let mut tuples = Vec::with_capacity(rows);
        for _ in 0..rows {
            let params = (0..columns.len())
                .map(|_| {
                    let p = self.placeholder(position);
                    position += 1;
                    p
                })
                .collect::<Vec<_>>()
                .join(", ");
            tuples.push(format!("({})", params));
        }

        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_ident(table),
            cols_str,
            tuples.join(", ")
        )
    }

    /// Single-row update: the SET value binds first, the predicate second.
    pub fn update_one(&self, table: &str, key: &str, update_key: &str) -> String {
        let table_q = self.quote_ident(table);
        match self {
            SqlDialect::MySql => format!(
                "UPDATE {} SET {} = ? WHERE {} = ? LIMIT 1",
                table_q,
                self.quote_ident(update_key),
                self.quote_ident(key)
            ),
            // UPDATE has no LIMIT in PostgreSQL; target one physical row.
            SqlDialect::Postgres => format!(
                "UPDATE {t} SET {u} = $1 WHERE ctid IN (SELECT ctid FROM {t} WHERE {k} = $2 LIMIT 1)",
                t = table_q,
                u = self.quote_ident(update_key),
                k = self.quote_ident(key)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::{migrations_schema, Catalog};
    use crate::model::{Indexer, Entity, BLOCKS_TABLE};

    #[test]
    fn test_quote_ident_postgres() {
        let dialect = SqlDialect::Postgres;
        assert_eq!(dialect.quote_ident("from"), "\"from\"");
        assert_eq!(dialect.quote_ident("user\"name"), "\"user\"\"name\"");
    }

    #[test]
    fn test_quote_ident_mysql() {
        let dialect = SqlDialect::MySql;
        assert_eq!(dialect.quote_ident("to"), "`to`");
        assert_eq!(dialect.quote_ident("user`name"), "`user``name`");
    }

    #[test]
    fn test_dialect_from_engine() {
        assert_eq!(SqlDialect::from_engine(DatabaseEngine::MariaDb), Some(SqlDialect::MySql));
        assert_eq!(SqlDialect::from_engine(DatabaseEngine::Postgres), Some(SqlDialect::Postgres));
        assert_eq!(SqlDialect::from_engine(DatabaseEngine::MongoDb), None);
    }

    #[test]
    fn test_create_table_mysql_declares_indexes_inline() {
        let statements = SqlDialect::MySql.create_table(&Indexer::schema());
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0],
            "CREATE TABLE IF NOT EXISTS `indexers` (\
             `id` BIGINT NOT NULL AUTO_INCREMENT, \
             `index_id` VARCHAR(36) NOT NULL, \
             `last_block_height` BIGINT NOT NULL, \
             `indexed_at` DATETIME(6) NOT NULL, \
             PRIMARY KEY (`id`), \
             UNIQUE KEY `indexers_index_id_unique` (`index_id`))"
        );
    }

    #[test]
    fn test_create_table_postgres_emits_index_statements() {
        let catalog = Catalog::indexer();
        let blocks = catalog.table(BLOCKS_TABLE).unwrap();
        let statements = SqlDialect::Postgres.create_table(blocks);

        assert_eq!(statements.len(), 1 + blocks.indexes.len());
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"blocks\" (\"id\" BIGSERIAL PRIMARY KEY"));
        assert!(statements[0].contains("\"committers\" JSONB NULL"));
        assert!(statements.contains(
            &"CREATE UNIQUE INDEX IF NOT EXISTS \"blocks_height_unique\" ON \"blocks\" (\"height\")".to_string()
        ));
        assert!(statements.contains(
            &"CREATE INDEX IF NOT EXISTS \"blocks_prev_block_hash_normal\" ON \"blocks\" (\"prev_block_hash\")".to_string()
        ));
    }

    #[test]
    fn test_migrations_table_has_unique_version() {
        let statements = SqlDialect::Postgres.create_table(&migrations_schema());
        assert!(statements
            .iter()
            .any(|s| s.contains("\"schema_migrations_version_unique\"")));
    }

    #[test]
    fn test_select_one() {
        assert_eq!(
            SqlDialect::Postgres.select_one("blocks", &["height", "hash"], "height"),
            "SELECT \"height\", \"hash\" FROM \"blocks\" WHERE \"height\" = $1 LIMIT 1"
        );
        assert_eq!(
            SqlDialect::MySql.select_one("t", &[], "k"),
            "SELECT * FROM `t` WHERE `k` = ? LIMIT 1"
        );
    }

    #[test]
    fn test_insert_numbers_placeholders_across_rows() {
        assert_eq!(
            SqlDialect::Postgres.insert("blocks", &["hash", "height"], 2),
            "INSERT INTO \"blocks\" (\"hash\", \"height\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(
            SqlDialect::MySql.insert("blocks", &["hash", "height"], 1),
            "INSERT INTO `blocks` (`hash`, `height`) VALUES (?, ?)"
        );
    }

    #[test]
    fn test_update_one() {
        assert_eq!(
            SqlDialect::MySql.update_one("indexers", "index_id", "last_block_height"),
            "UPDATE `indexers` SET `last_block_height` = ? WHERE `index_id` = ? LIMIT 1"
        );
        let pg = SqlDialect::Postgres.update_one("indexers", "index_id", "last_block_height");
        assert!(pg.starts_with("UPDATE \"indexers\" SET \"last_block_height\" = $1"));
        assert!(pg.contains("WHERE \"index_id\" = $2 LIMIT 1"));
    }
}
