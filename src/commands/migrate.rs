// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::Context;
use tracing::{info, instrument, warn};

use super::{load_config, open_pool};

/// Migrates every configured database. Any failing database fails the
/// command; the pool is closed either way.
#[instrument(skip_all, fields(config = %config_path.display()))]
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let indexer_id = config.indexer_id()?.to_string();
    let pool = open_pool(&config).await?;

    let cancel = pool.cancel_token().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling migration");
            cancel.cancel();
        }
    });

    let migrated = pool
        .migrate(&indexer_id, config.last_block_height)
        .await
        .context("migration failed");
    interrupt.abort();

    let closed = pool.close().await.context("failed to close databases");

    migrated?;
    closed?;

    info!(
        indexer_id = %indexer_id,
        databases = config.dbs.len(),
        "migration finished"
    );
    Ok(())
}
