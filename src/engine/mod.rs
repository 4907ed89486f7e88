// SPDX-License-Identifier: Apache-2.0

// Storage Engine Module
// Uniform persistence contract over relational and document backends

pub mod drivers;
pub mod error;
pub mod pool;
pub mod schema;
pub mod sql_generator;
pub mod traits;
pub mod types;

pub use drivers::open_engine;
pub use error::{EngineError, EngineFailure, EngineResult, PoolError};
pub use pool::EnginePool;
pub use schema::Catalog;
pub use traits::{EntityStore, StorageEngine};
pub use types::*;
