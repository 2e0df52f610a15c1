// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

use crate::{
    access_log::AccessLog,
    config::ServerConfig,
    http::{RequestPolicy, ResponseBuilder},
    net::tls,
    resources::DirectoryCache,
};

/// The facts and shared services every connection on every worker thread
/// uses. Built once at startup and never mutated afterwards, apart from the
/// interior locks of the cache and the access log.
pub struct ServerContext {
    pub config: ServerConfig,

    /// The host name used when virtual hosting is off or the client sent
    /// none.
    pub server_host: String,

    /// The port the server actually listens on.
    pub port: u16,

    pub cache: DirectoryCache,
    pub access_log: AccessLog,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub responses: ResponseBuilder,

    credentials: Option<Vec<u8>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, port: u16) -> anyhow::Result<Self> {
        let server_host = match &config.server_host {
            Some(host) => host.clone(),
            None => system_host_name(),
        };

        let access_log = match &config.access_log {
            Some(path) => AccessLog::open(path, config.flush_log)
                .with_context(|| format!("failed to open access log {}", path.display()))?,
            None => AccessLog::disabled(),
        };

        let tls = config.tls.as_ref().map(tls::load_server_config).transpose()?;

        let responses = ResponseBuilder::new(config.server_name.clone(), config.auth_realm.clone())
            .with_cors(config.cors.clone())
            .with_lifespan(config.lifespan());

        Ok(Self {
            server_host,
            port,
            cache: DirectoryCache::new(config.max_dircache),
            access_log,
            tls,
            responses,
            credentials: config.basic_auth.as_ref().map(|credentials| credentials.as_bytes().to_vec()),
            config,
        })
    }

    pub fn policy(&self) -> RequestPolicy<'_> {
        RequestPolicy {
            virtual_hosts: self.config.virtual_hosts,
            server_host: &self.server_host,
            credentials: self.credentials.as_deref(),
        }
    }
}

fn system_host_name() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(error) => {
            warn!("Failed to look up the host name, using localhost: {error}");
            "localhost".to_owned()
        }
    }
}
