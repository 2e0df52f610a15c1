// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use serde::Deserialize;

/// The environment variable naming a configuration file, used when no path
/// is given on the command line.
pub const CONFIG_ENV: &str = "PORTIERE_CONFIG";

/// Paths of the PEM files used to serve over TLS.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate: PathBuf,

    /// Defaults to the certificate file, which then has to contain the key
    /// as well.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub document_root: PathBuf,

    /// The address to listen on. Without one, the IPv6 wildcard address is
    /// tried first and the IPv4 one second.
    pub listen_ip: Option<IpAddr>,

    /// Zero picks an ephemeral port.
    pub port: u16,

    /// The host name used in redirects, listings and the gateway
    /// environment. Defaults to the system host name.
    pub server_host: Option<String>,

    /// The value of the `Server` header.
    pub server_name: String,

    /// Served instead of a listing when present in a directory.
    pub index_file: Option<String>,
    pub no_listing: bool,

    /// Enables `/~user/` paths, served from this directory in the user's
    /// home.
    pub user_dir: Option<String>,

    /// Serve each host from its own subdirectory of the document root.
    pub virtual_hosts: bool,

    /// Request paths starting with this prefix run a gateway program.
    pub cgi_path: Option<String>,

    /// Let gateway programs inherit standard input and error.
    pub gateway_debug: bool,

    /// `user:password` required from every client.
    pub basic_auth: Option<String>,
    pub auth_realm: String,

    /// Value of `Access-Control-Allow-Origin`.
    pub cors: Option<String>,

    /// Files expire this long after their last modification.
    pub lifespan_secs: Option<u64>,

    pub default_mime: String,

    pub timeout_secs: u64,
    pub keepalive_secs: u64,

    /// Connections per worker thread.
    pub max_connections: usize,
    pub max_dircache: usize,
    pub threads: usize,

    /// `-` logs to standard output.
    pub access_log: Option<PathBuf>,
    pub flush_log: bool,

    /// Listings show numeric owners and groups.
    pub chrooted: bool,

    pub tls: Option<TlsConfig>,

    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("."),
            listen_ip: None,
            port: 8000,
            server_host: None,
            server_name: format!("portiere/{}", env!("CARGO_PKG_VERSION")),
            index_file: None,
            no_listing: false,
            user_dir: None,
            virtual_hosts: false,
            cgi_path: None,
            gateway_debug: false,
            basic_auth: None,
            auth_realm: "portiere".to_owned(),
            cors: None,
            lifespan_secs: None,
            default_mime: "text/plain".to_owned(),
            timeout_secs: 60,
            keepalive_secs: 5,
            max_connections: 32,
            max_dircache: 128,
            threads: 1,
            access_log: None,
            flush_log: false,
            chrooted: false,
            tls: None,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration from `path`, or from the file named by
    /// [`CONFIG_ENV`], falling back to the defaults when neither is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read configuration file {}", path.display()))?;
                Self::from_yaml(&text).with_context(|| format!("invalid configuration in {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let mut config: ServerConfig = serde_yaml::from_str(text)?;
        config.normalize()?;
        Ok(config)
    }

    /// Checks the values that can't be expressed in the types, and brings
    /// the gateway prefix into its canonical form.
    pub fn normalize(&mut self) -> anyhow::Result<()> {
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }

        if let Some(prefix) = &mut self.cgi_path {
            if !prefix.starts_with('/') {
                prefix.insert(0, '/');
            }
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
        }

        if let Some(credentials) = &self.basic_auth {
            if !credentials.contains(':') {
                bail!("basic_auth must have the form user:password");
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn lifespan(&self) -> Option<Duration> {
        self.lifespan_secs.map(Duration::from_secs)
    }
}
