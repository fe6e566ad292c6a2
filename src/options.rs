use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// On-disk configuration file, JSON with optional sections.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: Option<ServerSection>,

    #[serde(default)]
    pub metadata: Option<MetadataSection>,

    #[serde(default)]
    pub rules: Option<RulesSection>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    #[serde(default)]
    pub repository: Option<PathBuf>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub decision: Option<DecisionMode>,

    #[serde(default)]
    pub filemonitor: Option<FileMonitor>,

    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    #[serde(default)]
    pub stats_queue: Option<usize>,

    /// Flat statistics log; one JSON line per client interaction.
    #[serde(default)]
    pub stats_log: Option<PathBuf>,

    // TLS material is accepted for compatibility; transport security is
    // handled outside this process.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MetadataSection {
    #[serde(default)]
    pub use_database: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RulesSection {
    #[serde(default)]
    pub regex: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    #[default]
    Off,
    Whitelist,
    Blacklist,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMonitor {
    #[default]
    Inotify,
    None,
}

/// Typed, immutable server options threaded into each component at
/// construction. Built from the config file with CLI overrides applied
/// on top.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub repository: PathBuf,
    /// Global client password; `secure` clients ignore it.
    pub password: Option<String>,
    pub decision: DecisionMode,
    pub regex_rules: bool,
    pub filemonitor: FileMonitor,
    pub request_timeout_ms: u64,
    pub stats_queue: usize,
    pub stats_log: Option<PathBuf>,
    pub dns_timeout_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            listen: "127.0.0.1:6789".parse().expect("static addr"),
            repository: PathBuf::from("."),
            password: None,
            decision: DecisionMode::Off,
            regex_rules: false,
            filemonitor: FileMonitor::Inotify,
            request_timeout_ms: 30_000,
            stats_queue: 1024,
            stats_log: None,
            dns_timeout_ms: 500,
        }
    }
}

impl ServerOptions {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let file: ConfigFile =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Self::from_config(file)
    }

    pub fn from_config(file: ConfigFile) -> Result<Self> {
        let mut opts = ServerOptions::default();

        if let Some(server) = file.server {
            if let Some(listen) = server.listen {
                opts.listen = listen;
            }
            if let Some(repository) = server.repository {
                opts.repository = repository;
            }
            opts.password = server.password;
            if let Some(decision) = server.decision {
                opts.decision = decision;
            }
            if let Some(filemonitor) = server.filemonitor {
                opts.filemonitor = filemonitor;
            }
            if let Some(ms) = server.request_timeout_ms {
                opts.request_timeout_ms = ms;
            }
            if let Some(n) = server.stats_queue {
                opts.stats_queue = n;
            }
            opts.stats_log = server.stats_log;
        }

        if let Some(metadata) = file.metadata {
            // Clients are kept in Metadata/clients.xml; an external
            // client database is not implemented, so refuse rather than
            // silently ignore the request.
            if metadata.use_database {
                bail!("metadata.use_database is not supported by this server");
            }
        }

        if let Some(rules) = file.rules {
            opts.regex_rules = rules.regex;
        }

        Ok(opts)
    }
}
