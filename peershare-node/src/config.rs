//! Load config from file, environment and command line; set up tracing; persist the peer id.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use peershare_core::{PeerId, SearchConfig};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Node configuration. File: ~/.config/peershare/config.toml or /etc/peershare/config.toml.
/// Env overrides: PEERSHARE_LISTEN_PORT, PEERSHARE_DISCOVERY_PORT, PEERSHARE_SHARED_DIR,
/// PEERSHARE_DOWNLOAD_DIR, PEERSHARE_DATA_DIR, PEERSHARE_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP port for peer streams (default 45680).
    pub listen_port: u16,
    /// UDP multicast port for LAN beacons (default 45681).
    pub discovery_port: u16,
    /// Directory whose files are shared.
    pub shared_dir: PathBuf,
    /// Where downloads are written.
    pub download_dir: PathBuf,
    /// Peer id file and download records.
    pub data_dir: PathBuf,
    pub log_level: String,
    pub max_concurrent_queries: usize,
    pub peer_query_timeout_secs: u64,
    pub find_providers_timeout_secs: u64,
    pub announce_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("PeerShare"))
            .unwrap_or_else(|| PathBuf::from("peershare"));
        Self {
            listen_port: 45680,
            discovery_port: 45681,
            shared_dir: base.join("shared"),
            download_dir: base.join("downloads"),
            data_dir: base.join(".data"),
            log_level: "info".to_string(),
            max_concurrent_queries: 8,
            peer_query_timeout_secs: 10,
            find_providers_timeout_secs: 5,
            announce_interval_secs: 4,
        }
    }
}

impl Config {
    pub fn search(&self) -> SearchConfig {
        SearchConfig {
            max_concurrent: self.max_concurrent_queries.max(1),
            query_timeout: Duration::from_secs(self.peer_query_timeout_secs),
            providers_timeout: Duration::from_secs(self.find_providers_timeout_secs),
        }
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

/// Load config: default, then config file, then env vars. An explicit path must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    override_from(&var, "PEERSHARE_LISTEN_PORT", &mut c.listen_port);
    override_from(&var, "PEERSHARE_DISCOVERY_PORT", &mut c.discovery_port);
    override_from(&var, "PEERSHARE_SHARED_DIR", &mut c.shared_dir);
    override_from(&var, "PEERSHARE_DOWNLOAD_DIR", &mut c.download_dir);
    override_from(&var, "PEERSHARE_DATA_DIR", &mut c.data_dir);
    override_from(&var, "PEERSHARE_LOG_LEVEL", &mut c.log_level);
}

fn override_from<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    if let Some(s) = var(name) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var = name, value = %s, "ignoring unparsable override"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peershare/config.toml"));
    }
    out.push(PathBuf::from("/etc/peershare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(err) => {
            eprintln!("ignoring config {}: {err:#}", path.display());
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn init_tracing(config: &Config) {
    // RUST_LOG first, then the configured level, then info.
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| config.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}

/// Peer id kept in `<data_dir>/peer_id`; generated on first start.
pub fn load_or_create_peer_id(data_dir: &Path) -> anyhow::Result<PeerId> {
    let path = data_dir.join("peer_id");
    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return s
            .parse()
            .with_context(|| format!("corrupt peer id in {}", path.display()));
    }
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let id = PeerId::generate();
    std::fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(peer = %id, path = %path.display(), "generated new peer id");
    Ok(id)
}
