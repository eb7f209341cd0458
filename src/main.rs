// Copyright 2025
// Licensed under the Elastic License v2.0

#![warn(clippy::all)]

mod config;
mod core;
mod engine;
mod filter;
mod meta;
mod replication;
mod sink;
mod source;
mod utils;

use anyhow::Result;
use dotenvy::dotenv;

use crate::config::CdcConfig;
use crate::engine::CdcEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenv().ok();

    // 1. Load configuration
    let config = CdcConfig::load()?;
    config.print_banner();

    // 2. Create and run CDC engine
    CdcEngine::new(config).run().await
}
