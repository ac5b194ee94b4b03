// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use traceline_core::{Config, SystemClock};
use traceline_transport::Server;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TRACELINE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match Config::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on worker startup: {e}");
            return;
        }
    };

    let server = match Server::prepare(config, Arc::new(SystemClock::new())) {
        Ok(server) => server,
        Err(e) => {
            error!("Worker could not claim its environment: {e}");
            return;
        }
    };

    info!(version = traceline_core::VERSION, "worker starting");

    if let Err(e) = server.run().await {
        error!("Worker exited with a fatal state: {e}");
        std::process::exit(1);
    }
}
