// SPDX-License-Identifier: Apache-2.0

//! Build and release information.

use std::fmt;

use serde::Serialize;

pub const APPLICATION: &str = "Indexer";
pub const DESCRIPTION: &str = "Offchain index Pactus blockchain to centralized database";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT_ID: &str = env!("INDEXER_COMMIT_ID");
pub const BUILD_TIME: &str = env!("INDEXER_BUILD_TIME");

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub application: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub commit_id: &'static str,
    pub build_time: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            application: APPLICATION,
            description: DESCRIPTION,
            version: VERSION,
            commit_id: COMMIT_ID,
            build_time: BUILD_TIME,
        }
    }

    /// `v0.1.0`
    pub fn semantic_version(&self) -> String {
        format!("v{}", self.version)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Application: {}", self.application)?;
        writeln!(f, "Description: {}", self.description)?;
        writeln!(f, "Version:     {}", self.semantic_version())?;
        writeln!(f, "Commit ID:   {}", self.commit_id)?;
        write!(f, "Build Time:  {}", self.build_time)
    }
}
