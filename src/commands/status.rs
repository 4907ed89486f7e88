// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use super::{load_config, open_pool};
use crate::engine::{EngineIdentity, StorageEngine};
use crate::model::Indexer;

#[derive(Debug, Serialize)]
struct StatusReport {
    indexer_id: String,
    databases: Vec<EngineIdentity>,
    bookmarks: Vec<Indexer>,
}

/// Prints the bookmark held by each configured database as JSON.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let indexer_id = config.indexer_id()?.to_string();
    let pool = open_pool(&config).await?;

    let bookmarks = pool
        .get_indexer(&indexer_id)
        .await
        .context("failed to read indexer bookmarks");
    let databases = pool.engines().iter().map(|e| e.identity()).collect();
    pool.close().await.context("failed to close databases")?;

    let report = StatusReport {
        indexer_id,
        databases,
        bookmarks: bookmarks?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
