// SPDX-License-Identifier: Apache-2.0

use std::process::Command;

fn main() {
    // Commit of the working tree, "unknown" outside a git checkout
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let commit = std::env::var("INDEXER_COMMIT_ID").unwrap_or(commit);
    let build_time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    println!("cargo:rustc-env=INDEXER_COMMIT_ID={}", commit);
    println!("cargo:rustc-env=INDEXER_BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=INDEXER_COMMIT_ID");
}
