use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "CITYPACK_CONFIG";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BUCKET: &str = "citypack";
const DEFAULT_HEARTBEAT_SECS: u64 = 5;

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    #[default]
    Fs,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreKind::Memory),
            "fs" | "file" => Ok(StoreKind::Fs),
            other => anyhow::bail!("Unknown store kind '{}' (expected memory or fs)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    InProcess,
    Command,
}

impl std::str::FromStr for DispatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "in_process" => Ok(DispatchMode::InProcess),
            "command" => Ok(DispatchMode::Command),
            other => anyhow::bail!(
                "Unknown dispatch mode '{}' (expected in-process or command)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Base of signed object URLs; derived from host and port when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub store: StoreKind,
    pub store_dir: PathBuf,
    pub bucket: String,
    /// Only URLs on this host are accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packer_timeout_secs: Option<u64>,
    pub dispatch: DispatchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_bin: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            public_url: None,
            store: StoreKind::default(),
            store_dir: PathBuf::from("citypack-data"),
            bucket: DEFAULT_BUCKET.to_string(),
            domain: None,
            packer_timeout_secs: None,
            dispatch: DispatchMode::default(),
            worker_bin: None,
            cache_dir: std::env::temp_dir().join("citypack-cache"),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
            signing_key_path: None,
        }
    }
}

impl Config {
    /// Defaults, then the JSON file named by `CITYPACK_CONFIG`, then
    /// `CITYPACK_*` variables.
    pub fn load() -> Result<Self> {
        let mut config = match env_var(CONFIG_ENV) {
            Some(path) => Self::load_from_file(Path::new(&path))?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(host) = env_var("CITYPACK_HOST") {
            self.host = host;
        }
        if let Some(port) = env_var("CITYPACK_PORT") {
            self.port = port.parse().context("Invalid CITYPACK_PORT")?;
        }
        if let Some(url) = env_var("CITYPACK_PUBLIC_URL") {
            self.public_url = Some(url);
        }
        if let Some(kind) = env_var("CITYPACK_STORE") {
            self.store = kind.parse()?;
        }
        if let Some(dir) = env_var("CITYPACK_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(bucket) = env_var("CITYPACK_BUCKET") {
            self.bucket = bucket;
        }
        if let Some(domain) = env_var("CITYPACK_DOMAIN") {
            self.domain = Some(domain);
        }
        if let Some(timeout) = env_var("CITYPACK_PACKER_TIMEOUT") {
            self.packer_timeout_secs = Some(
                timeout
                    .parse()
                    .context("Invalid CITYPACK_PACKER_TIMEOUT (seconds)")?,
            );
        }
        if let Some(mode) = env_var("CITYPACK_DISPATCH") {
            self.dispatch = mode.parse()?;
        }
        if let Some(bin) = env_var("CITYPACK_WORKER_BIN") {
            self.worker_bin = Some(PathBuf::from(bin));
        }
        if let Some(dir) = env_var("CITYPACK_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_var("CITYPACK_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = secs
                .parse()
                .context("Invalid CITYPACK_HEARTBEAT_INTERVAL (seconds)")?;
        }
        if let Some(path) = env_var("CITYPACK_SIGNING_KEY") {
            self.signing_key_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            anyhow::bail!("Bucket name must not be empty");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least one second");
        }
        if self.dispatch == DispatchMode::Command && self.store == StoreKind::Memory {
            anyhow::bail!("The memory store cannot be shared with worker processes; use the fs store with command dispatch");
        }
        Ok(())
    }

    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn domain(&self) -> Option<String> {
        self.domain.clone().filter(|d| !d.trim().is_empty())
    }

    pub fn packer_timeout(&self) -> Option<Duration> {
        self.packer_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
