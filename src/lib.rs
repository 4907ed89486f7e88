// SPDX-License-Identifier: Apache-2.0

// Pactus Indexer - multi-engine persistence core
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod model;
pub mod observability;
pub mod version;

pub use config::Config;
pub use engine::{EngineError, EnginePool, StorageEngine};
