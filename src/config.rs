use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_DATA_DIR: &str = "data";
pub const SNAPSHOT_FILE: &str = "dump.json";
pub const AOF_FILE: &str = "appendonly.aof";
pub const DEFAULT_AOF_REWRITE_PERCENTAGE: u64 = 100; // rewrite when the log doubles
pub const DEFAULT_AOF_REWRITE_MIN_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// When to push buffered AOF writes to disk.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum FsyncPolicy {
    /// Sync after every appended command.
    Always,
    /// Sync at most once per second (driven by the supervisor tick).
    #[default]
    EverySec,
    /// Never sync explicitly; leave it to the OS.
    No,
}

impl FsyncPolicy {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Some(FsyncPolicy::Always),
            "everysec" => Some(FsyncPolicy::EverySec),
            "no" => Some(FsyncPolicy::No),
            _ => None,
        }
    }
}

pub struct Config {
    pub port: u16,
    pub host: String,
    /// Directory holding the snapshot and AOF files.
    pub data_dir: String,
    pub aof_enabled: bool,
    pub fsync_policy: FsyncPolicy,
    /// Percentage growth over the last-rewrite baseline that triggers an
    /// automatic AOF rewrite.
    pub aof_rewrite_percentage: u64,
    /// Minimum AOF size before automatic rewrites are considered at all.
    pub aof_rewrite_min_size: u64,
    pub max_line_len: usize,
    /// Port for the Prometheus exporter. `None` disables metrics export.
    pub metrics_port: Option<u16>,
    pub metrics_host: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: "0.0.0.0".to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            aof_enabled: true,
            fsync_policy: FsyncPolicy::EverySec,
            aof_rewrite_percentage: DEFAULT_AOF_REWRITE_PERCENTAGE,
            aof_rewrite_min_size: DEFAULT_AOF_REWRITE_MIN_SIZE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            metrics_port: None,
            metrics_host: "0.0.0.0".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("REDIS_CLONE_PORT").ok().as_deref(),
            std::env::var("REDIS_CLONE_HOST").ok().as_deref(),
            std::env::var("REDIS_CLONE_DATA_DIR").ok().as_deref(),
            std::env::var("REDIS_CLONE_APPENDONLY").ok().as_deref(),
            std::env::var("REDIS_CLONE_APPENDFSYNC").ok().as_deref(),
            std::env::var("REDIS_CLONE_AOF_REWRITE_PERCENTAGE")
                .ok()
                .as_deref(),
            std::env::var("REDIS_CLONE_AOF_REWRITE_MIN_SIZE")
                .ok()
                .as_deref(),
            std::env::var("REDIS_CLONE_MAX_LINE_LEN").ok().as_deref(),
            std::env::var("REDIS_CLONE_METRICS_PORT").ok().as_deref(),
            std::env::var("REDIS_CLONE_METRICS_HOST").ok().as_deref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_vars(
        port: Option<&str>,
        host: Option<&str>,
        data_dir: Option<&str>,
        appendonly: Option<&str>,
        appendfsync: Option<&str>,
        rewrite_percentage: Option<&str>,
        rewrite_min_size: Option<&str>,
        max_line_len: Option<&str>,
        metrics_port: Option<&str>,
        metrics_host: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            port: port.and_then(|s| s.parse().ok()).unwrap_or(defaults.port),
            host: host.map(|s| s.to_string()).unwrap_or(defaults.host),
            data_dir: data_dir
                .map(|s| s.to_string())
                .unwrap_or(defaults.data_dir),
            aof_enabled: appendonly
                .and_then(Self::parse_bool)
                .unwrap_or(defaults.aof_enabled),
            fsync_policy: appendfsync
                .and_then(FsyncPolicy::from_str)
                .unwrap_or(defaults.fsync_policy),
            aof_rewrite_percentage: rewrite_percentage
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.aof_rewrite_percentage),
            aof_rewrite_min_size: rewrite_min_size
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.aof_rewrite_min_size),
            max_line_len: max_line_len
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_line_len),
            metrics_port: metrics_port.and_then(|s| s.parse().ok()),
            metrics_host: metrics_host
                .map(|s| s.to_string())
                .unwrap_or(defaults.metrics_host),
        }
    }

    fn parse_bool(s: &str) -> Option<bool> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(SNAPSHOT_FILE)
    }

    pub fn aof_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(AOF_FILE)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_listen_addr(&self) -> Option<String> {
        self.metrics_port
            .map(|port| format!("{}:{}", self.metrics_host, port))
    }
}
