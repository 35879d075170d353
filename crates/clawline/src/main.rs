// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use clawline::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    match clawline::run::run(config).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
