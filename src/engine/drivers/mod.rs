// SPDX-License-Identifier: Apache-2.0

// Storage engine drivers

pub mod mongodb;
pub mod sql;

use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::engine::error::EngineResult;
use crate::engine::schema::Catalog;
use crate::engine::traits::StorageEngine;
use crate::engine::types::DatabaseEngine;

pub use self::mongodb::MongoEngine;
pub use self::sql::SqlEngine;

/// Opens the adapter matching `config.engine` over the indexer catalog.
pub async fn open_engine(config: &DatabaseConfig) -> EngineResult<Arc<dyn StorageEngine>> {
    open_engine_with_catalog(config, Catalog::indexer()).await
}

pub async fn open_engine_with_catalog(
    config: &DatabaseConfig,
    catalog: Catalog,
) -> EngineResult<Arc<dyn StorageEngine>> {
    let engine: Arc<dyn StorageEngine> = match config.engine {
        DatabaseEngine::MySql | DatabaseEngine::MariaDb | DatabaseEngine::Postgres => {
            Arc::new(SqlEngine::connect(config, catalog).await?)
        }
        DatabaseEngine::MongoDb => Arc::new(MongoEngine::connect(config, catalog).await?),
    };
    Ok(engine)
}
