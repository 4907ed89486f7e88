// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use indexer_lib::commands::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = commands::run(cli).await {
        commands::report_error(&e);
        std::process::exit(1);
    }
}
