// SPDX-License-Identifier: Apache-2.0

//! Universal data types for the storage engines
//!
//! These types provide a normalized representation of records and values
//! across the relational and document backends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Sub-second digits kept in stored timestamps. MongoDB dates carry
/// milliseconds, so every backend is held to the same precision and the
/// same instant reads back everywhere.
pub const TIMESTAMP_PRECISION: u16 = 3;

/// Storage family of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sql,
    NoSql,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Sql => "sql",
            DatabaseType::NoSql => "nosql",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sql" => Ok(DatabaseType::Sql),
            "nosql" => Ok(DatabaseType::NoSql),
            other => Err(EngineError::config(format!(
                "unsupported database type '{}' (expected sql or nosql)",
                other
            ))),
        }
    }
}

/// Concrete database engine of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseEngine {
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mariadb")]
    MariaDb,
    #[serde(rename = "psql")]
    Postgres,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::MySql => "mysql",
            DatabaseEngine::MariaDb => "mariadb",
            DatabaseEngine::Postgres => "psql",
            DatabaseEngine::MongoDb => "mongodb",
        }
    }

    /// Storage family this engine belongs to.
    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabaseEngine::MySql | DatabaseEngine::MariaDb | DatabaseEngine::Postgres => {
                DatabaseType::Sql
            }
            DatabaseEngine::MongoDb => DatabaseType::NoSql,
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseEngine {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseEngine::MySql),
            "mariadb" => Ok(DatabaseEngine::MariaDb),
            "psql" | "postgres" | "postgresql" => Ok(DatabaseEngine::Postgres),
            "mongodb" | "mongo" => Ok(DatabaseEngine::MongoDb),
            other => Err(EngineError::config(format!(
                "unsupported database engine '{}' (expected mysql, mariadb, psql or mongodb)",
                other
            ))),
        }
    }
}

/// Name, engine and storage family of one registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineIdentity {
    pub name: String,
    pub engine: DatabaseEngine,
    pub database_type: DatabaseType,
}

impl fmt::Display for EngineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.engine, self.database_type)
    }
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Json(serde_json::Value),
}

impl Value {
    /// Converts into plain JSON, used when a backend stores the value as a
    /// JSON column.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Json(j) => j.clone(),
        }
    }

    /// Builds a value from JSON. Arrays stay arrays so list columns read
    /// back the same way on every backend.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Json(_) => "json",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
            Value::Array(_) | Value::Json(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v.trunc_subsecs(TIMESTAMP_PRECISION))
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::Array(v.into_iter().map(Value::from).collect())
    }
}

/// Engine-neutral record: field name to value, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // ==================== Decoding helpers ====================

    fn take_present(&mut self, key: &str) -> Option<Value> {
        match self.fields.remove(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value),
        }
    }

    fn missing(key: &str) -> EngineError {
        EngineError::decode(format!("missing required field '{}'", key))
    }

    fn mismatch(key: &str, expected: &str, found: &Value) -> EngineError {
        EngineError::decode(format!(
            "field '{}' expected {}, found {}",
            key,
            expected,
            found.kind()
        ))
    }

    pub fn take_text(&mut self, key: &str) -> EngineResult<String> {
        match self.take_present(key) {
            Some(Value::Text(s)) => Ok(s),
            Some(other) => Err(Self::mismatch(key, "text", &other)),
            None => Err(Self::missing(key)),
        }
    }

    pub fn take_text_or_default(&mut self, key: &str) -> EngineResult<String> {
        if self.get(key).map_or(true, |v| matches!(v, Value::Null)) {
            self.fields.remove(key);
            return Ok(String::new());
        }
        self.take_text(key)
    }

    /// Takes an integer field and narrows it to `T`.
    pub fn take_int<T>(&mut self, key: &str) -> EngineResult<T>
    where
        T: TryFrom<i64>,
    {
        let raw = match self.take_present(key) {
            Some(Value::Int(i)) => i,
            Some(Value::Float(f)) if f.fract() == 0.0 => f as i64,
            Some(other) => return Err(Self::mismatch(key, "int", &other)),
            None => return Err(Self::missing(key)),
        };
        T::try_from(raw).map_err(|_| {
            EngineError::decode(format!("field '{}' value {} is out of range", key, raw))
        })
    }

    pub fn take_int_or_default<T>(&mut self, key: &str) -> EngineResult<T>
    where
        T: TryFrom<i64> + Default,
    {
        if self.get(key).map_or(true, |v| matches!(v, Value::Null)) {
            self.fields.remove(key);
            return Ok(T::default());
        }
        self.take_int(key)
    }

    pub fn take_timestamp(&mut self, key: &str) -> EngineResult<DateTime<Utc>> {
        match self.take_present(key) {
            Some(Value::Timestamp(ts)) => Ok(ts),
            Some(Value::Text(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| {
                    EngineError::decode(format!("field '{}' is not a timestamp: {}", key, e))
                }),
            Some(other) => Err(Self::mismatch(key, "timestamp", &other)),
            None => Err(Self::missing(key)),
        }
    }

    /// Takes a list of small integers. Accepts native arrays as well as JSON
    /// arrays stored as text.
    pub fn take_int_list_or_default(&mut self, key: &str) -> EngineResult<Vec<i32>> {
        let items = match self.take_present(key) {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(Value::Json(serde_json::Value::Array(items))) => {
                items.into_iter().map(Value::from_json).collect()
            }
            Some(Value::Text(s)) => match serde_json::from_str::<serde_json::Value>(&s) {
                Ok(serde_json::Value::Array(items)) => {
                    items.into_iter().map(Value::from_json).collect()
                }
                Ok(serde_json::Value::Null) => return Ok(Vec::new()),
                _ => {
                    return Err(EngineError::decode(format!(
                        "field '{}' is not a JSON array",
                        key
                    )))
                }
            },
            Some(other) => return Err(Self::mismatch(key, "array", &other)),
        };

        items
            .into_iter()
            .map(|item| match item {
                Value::Int(i) => i32::try_from(i).map_err(|_| {
                    EngineError::decode(format!("field '{}' element {} is out of range", key, i))
                }),
                other => Err(Self::mismatch(key, "int element", &other)),
            })
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
