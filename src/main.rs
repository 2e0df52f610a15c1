// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{path::PathBuf, time::Instant};

use portiere::{Server, ServerConfig};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let start = Instant::now();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(path.as_deref())?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if config.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let server = Server::bind(config)?;
    info!("Loaded after {} ms", start.elapsed().as_millis());

    server.run().await?;

    info!("Stopped after {} ms", start.elapsed().as_millis());
    Ok(())
}
