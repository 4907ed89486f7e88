// SPDX-License-Identifier: Apache-2.0

//! Chain records persisted by the indexer
//!
//! Every entity knows its table/collection, its schema description and how
//! to convert to and from the engine-neutral [`Record`].

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::schema::{ColumnDef, ColumnType, IndexDef, TableSchema};
use crate::engine::types::{Record, Value, TIMESTAMP_PRECISION};

pub const BLOCKS_TABLE: &str = "blocks";
pub const TRANSACTIONS_TABLE: &str = "transactions";
pub const INDEXERS_TABLE: &str = "indexers";

/// Hashes are hex strings well below this length.
const HASH_LEN: u16 = 100;
const ADDRESS_LEN: u16 = 100;

/// A record type stored in one table/collection of every backend.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Table (SQL) or collection (MongoDB) name.
    const TABLE: &'static str;

    fn schema() -> TableSchema;

    /// Encodes the entity for storage. Fails when a field has no lossless
    /// stored form.
    fn to_record(&self) -> EngineResult<Record>;

    /// Decodes a stored record. Unknown fields are ignored; a missing
    /// required field or a type mismatch yields a decode error.
    fn from_record(record: Record) -> EngineResult<Self>;
}

/// A committed block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub height: u32,
    pub hash: String,
    pub total_transactions: u32,
    pub block_time: u32,
    pub block_reward: i64,
    pub version: i32,
    pub prev_block_hash: String,
    pub state_root: String,
    pub sortition_seed: String,
    pub proposer_address: String,
    pub certificate_hash: String,
    pub round: i32,
    pub committers: Vec<i32>,
    pub absentees: Vec<i32>,
    pub signature: String,
}

impl Entity for Block {
    const TABLE: &'static str = BLOCKS_TABLE;

    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema {
            name: Self::TABLE,
            columns: vec![
                ColumnDef::required("height", BigInt),
                ColumnDef::required("hash", VarChar(HASH_LEN)),
                ColumnDef::required("total_transactions", BigInt),
                ColumnDef::required("block_time", BigInt),
                ColumnDef::required("block_reward", BigInt),
                ColumnDef::required("version", BigInt),
                ColumnDef::nullable("prev_block_hash", VarChar(HASH_LEN)),
                ColumnDef::nullable("state_root", VarChar(HASH_LEN)),
                ColumnDef::nullable("sortition_seed", Text),
                ColumnDef::required("proposer_address", VarChar(ADDRESS_LEN)),
                ColumnDef::nullable("certificate_hash", VarChar(HASH_LEN)),
                ColumnDef::nullable("round", BigInt),
                ColumnDef::nullable("committers", Json),
                ColumnDef::nullable("absentees", Json),
                ColumnDef::nullable("signature", Text),
            ],
            indexes: vec![
                IndexDef::unique("height"),
                IndexDef::unique("hash"),
                IndexDef::normal("block_time"),
                IndexDef::normal("proposer_address"),
                IndexDef::normal("certificate_hash"),
                IndexDef::normal("prev_block_hash"),
            ],
        }
    }

    fn to_record(&self) -> EngineResult<Record> {
        Ok(Record::new()
            .with("height", self.height)
            .with("hash", self.hash.as_str())
            .with("total_transactions", self.total_transactions)
            .with("block_time", self.block_time)
            .with("block_reward", self.block_reward)
            .with("version", self.version)
            .with("prev_block_hash", self.prev_block_hash.as_str())
            .with("state_root", self.state_root.as_str())
            .with("sortition_seed", self.sortition_seed.as_str())
            .with("proposer_address", self.proposer_address.as_str())
            .with("certificate_hash", self.certificate_hash.as_str())
            .with("round", self.round)
            .with("committers", self.committers.clone())
            .with("absentees", self.absentees.clone())
            .with("signature", self.signature.as_str()))
    }

    fn from_record(mut record: Record) -> EngineResult<Self> {
        Ok(Self {
            height: record.take_int("height")?,
            hash: record.take_text("hash")?,
            total_transactions: record.take_int_or_default("total_transactions")?,
            block_time: record.take_int_or_default("block_time")?,
            block_reward: record.take_int_or_default("block_reward")?,
            version: record.take_int_or_default("version")?,
            prev_block_hash: record.take_text_or_default("prev_block_hash")?,
            state_root: record.take_text_or_default("state_root")?,
            sortition_seed: record.take_text_or_default("sortition_seed")?,
            proposer_address: record.take_text_or_default("proposer_address")?,
            certificate_hash: record.take_text_or_default("certificate_hash")?,
            round: record.take_int_or_default("round")?,
            committers: record.take_int_list_or_default("committers")?,
            absentees: record.take_int_list_or_default("absentees")?,
            signature: record.take_text_or_default("signature")?,
        })
    }
}

/// A transaction included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_height: u32,
    pub version: i32,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub from: String,
    pub to: String,
    pub value: i64,
    pub fee: i64,
    pub memo: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for Transaction {
    const TABLE: &'static str = TRANSACTIONS_TABLE;

    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema {
            name: Self::TABLE,
            columns: vec![
                ColumnDef::required("hash", VarChar(HASH_LEN)),
                ColumnDef::required("block_height", BigInt),
                ColumnDef::nullable("version", BigInt),
                ColumnDef::required("type", VarChar(32)),
                ColumnDef::nullable("from", VarChar(ADDRESS_LEN)),
                ColumnDef::nullable("to", VarChar(ADDRESS_LEN)),
                ColumnDef::nullable("value", BigInt),
                ColumnDef::nullable("fee", BigInt),
                ColumnDef::nullable("memo", Text),
                ColumnDef::required("created_at", Timestamp),
            ],
            indexes: vec![
                IndexDef::unique("hash"),
                IndexDef::normal("block_height"),
                IndexDef::normal("type"),
                IndexDef::normal("from"),
                IndexDef::normal("to"),
                IndexDef::normal("value"),
                IndexDef::normal("fee"),
                IndexDef::normal("created_at"),
            ],
        }
    }

    fn to_record(&self) -> EngineResult<Record> {
        Ok(Record::new()
            .with("hash", self.hash.as_str())
            .with("block_height", self.block_height)
            .with("version", self.version)
            .with("type", self.tx_type.as_str())
            .with("from", self.from.as_str())
            .with("to", self.to.as_str())
            .with("value", self.value)
            .with("fee", self.fee)
            .with("memo", self.memo.as_str())
            .with("created_at", self.created_at))
    }

    fn from_record(mut record: Record) -> EngineResult<Self> {
        Ok(Self {
            hash: record.take_text("hash")?,
            block_height: record.take_int("block_height")?,
            version: record.take_int_or_default("version")?,
            tx_type: record.take_text("type")?,
            from: record.take_text_or_default("from")?,
            to: record.take_text_or_default("to")?,
            value: record.take_int_or_default("value")?,
            fee: record.take_int_or_default("fee")?,
            memo: record.take_text_or_default("memo")?,
            created_at: record.take_timestamp("created_at")?,
        })
    }
}

/// Bookmark of the last block a given indexer deployment has processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexer {
    pub index_id: String,
    pub last_block_height: u64,
    pub indexed_at: DateTime<Utc>,
}

impl Indexer {
    pub fn new(index_id: impl Into<String>, last_block_height: u64) -> Self {
        Self {
            index_id: index_id.into(),
            last_block_height,
            indexed_at: Utc::now().trunc_subsecs(TIMESTAMP_PRECISION),
        }
    }
}

impl Entity for Indexer {
    const TABLE: &'static str = INDEXERS_TABLE;

    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema {
            name: Self::TABLE,
            columns: vec![
                ColumnDef::required("index_id", VarChar(36)),
                ColumnDef::required("last_block_height", BigInt),
                ColumnDef::required("indexed_at", Timestamp),
            ],
            indexes: vec![IndexDef::unique("index_id")],
        }
    }

    fn to_record(&self) -> EngineResult<Record> {
        let height = i64::try_from(self.last_block_height).map_err(|_| {
            EngineError::config(format!(
                "last_block_height {} exceeds the storable maximum {}",
                self.last_block_height,
                i64::MAX
            ))
        })?;
        Ok(Record::new()
            .with("index_id", self.index_id.as_str())
            .with("last_block_height", Value::Int(height))
            .with("indexed_at", self.indexed_at))
    }

    fn from_record(mut record: Record) -> EngineResult<Self> {
        Ok(Self {
            index_id: record.take_text("index_id")?,
            last_block_height: record.take_int("last_block_height")?,
            indexed_at: record.take_timestamp("indexed_at")?,
        })
    }
}
