// SPDX-License-Identifier: Apache-2.0

//! Schema descriptions
//!
//! Tables (or collections) are described by plain values rather than
//! derived from struct annotations. Each adapter's migration routine walks
//! the [`Catalog`] and renders it in its own terms: DDL for the SQL dialects,
//! index models for MongoDB.

/// Logical column type. Adapters map it to a concrete storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit signed integer
    BigInt,
    /// Bounded string, safe to index on every dialect
    VarChar(u16),
    /// Unbounded string, never indexed
    Text,
    /// UTC timestamp
    Timestamp,
    /// JSON document (lists of validator indexes, ...)
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub const fn required(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }

    pub const fn nullable(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: true,
        }
    }
}

/// Single-column index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub column: &'static str,
    pub unique: bool,
}

impl IndexDef {
    pub const fn unique(column: &'static str) -> Self {
        Self { column, unique: true }
    }

    pub const fn normal(column: &'static str) -> Self {
        Self {
            column,
            unique: false,
        }
    }

    /// Index name shared by every backend: `<table>_<column>_unique` or
    /// `<table>_<column>_normal`.
    pub fn name(&self, table: &str) -> String {
        let suffix = if self.unique { "unique" } else { "normal" };
        format!("{}_{}_{}", table, self.column, suffix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

/// Name of the table/collection recording applied migration versions.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Current schema version. Bump when the catalog changes shape.
pub const SCHEMA_VERSION: i64 = 1;

/// Version marker table. One row per applied version.
pub fn migrations_schema() -> TableSchema {
    TableSchema {
        name: MIGRATIONS_TABLE,
        columns: vec![
            ColumnDef::required("version", ColumnType::BigInt),
            ColumnDef::required("description", ColumnType::VarChar(255)),
            ColumnDef::required("applied_at", ColumnType::Timestamp),
        ],
        indexes: vec![IndexDef::unique("version")],
    }
}

/// The set of tables an adapter migrates and knows how to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    tables: Vec<TableSchema>,
}

impl Catalog {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    /// Blocks, transactions and the indexer bookmark.
    pub fn indexer() -> Self {
        use crate::model::{Block, Entity, Indexer, Transaction};
        Self::new(vec![Block::schema(), Transaction::schema(), Indexer::schema()])
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::indexer()
    }
}
