use crate::admission::AdmissionLimits;
use crate::range::AlignmentPolicy;
use crate::relay::RelaySettings;
use crate::remote::StorageBackend;
use anyhow::{Result, anyhow, bail};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relay configuration, loaded from CLI arguments, environment variables and
/// an optional TOML file.
///
/// Example configuration file content
/// # Listeners
/// listen_on_port = 32145
/// internal_port = 32146
/// public_base_url = "https://media.example.com"
///
/// # Ceilings (0 = unlimited)
/// max_per_token = 3
/// max_clients = 50
/// max_global = 100
///
/// # Registry
/// max_registry_entries = 10000
/// registry_path = "./data/registry.json"
///
/// # Storage
/// storage_backend = "s3"  # Options: "local" or "s3"
/// s3_bucket = "media"
/// s3_endpoint = "http://localhost:9000"
/// s3_access_key_id = "minioadmin"
/// s3_secret_access_key = "minioadmin"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Public port serving media streams
    #[arg(short, long, env = "RELAY_LISTEN_PORT", default_value_t = 32145)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Internal port for file registration and stats
    #[arg(short, long, env = "RELAY_INTERNAL_PORT", default_value_t = 32146)]
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "RELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Base URL used to build stream and download links
    #[arg(long, env = "RELAY_PUBLIC_BASE_URL", default_value = "http://127.0.0.1:32145")]
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Configuration file path (CLI arguments take precedence)
    #[arg(short, long, env = "RELAY_CONFIG")]
    #[serde(skip)]
    pub config: Option<String>,

    /// Objects larger than this use the large alignment
    #[arg(long, env = "RELAY_LARGE_FILE_THRESHOLD", default_value_t = 10 * 1024 * 1024)]
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Remote offset alignment for large objects, in bytes
    #[arg(long, env = "RELAY_LARGE_ALIGNMENT", default_value_t = 1024 * 1024)]
    #[serde(default = "default_large_alignment")]
    pub large_alignment: u64,

    /// Remote offset alignment for small objects, in bytes
    #[arg(long, env = "RELAY_SMALL_ALIGNMENT", default_value_t = 4096)]
    #[serde(default = "default_small_alignment")]
    pub small_alignment: u64,

    /// Concurrent streams per token (0 = unlimited)
    #[arg(long, env = "RELAY_MAX_PER_TOKEN", default_value_t = 3)]
    #[serde(default = "default_max_per_token")]
    pub max_per_token: usize,

    /// Distinct clients streaming at once (0 = unlimited)
    #[arg(long, env = "RELAY_MAX_CLIENTS", default_value_t = 50)]
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Concurrent streams overall (0 = unlimited)
    #[arg(long, env = "RELAY_MAX_GLOBAL", default_value_t = 100)]
    #[serde(default = "default_max_global")]
    pub max_global: usize,

    /// Tokens kept before the oldest is evicted
    #[arg(long, env = "RELAY_MAX_REGISTRY_ENTRIES", default_value_t = 10_000)]
    #[serde(default = "default_max_registry_entries")]
    pub max_registry_entries: usize,

    /// JSON file mirroring the registry (in-memory only when unset)
    #[arg(long, env = "RELAY_REGISTRY_PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<String>,

    /// Registry writes within this window are coalesced
    #[arg(long, env = "RELAY_REGISTRY_DEBOUNCE_MS", default_value_t = 1000)]
    #[serde(default = "default_registry_debounce_ms")]
    pub registry_debounce_ms: u64,

    /// Abort a stream that forwards nothing for this long
    #[arg(long, env = "RELAY_STALL_TIMEOUT_SECS", default_value_t = 120)]
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// How often streams are checked for stalls
    #[arg(long, env = "RELAY_STALL_CHECK_INTERVAL_SECS", default_value_t = 30)]
    #[serde(default = "default_stall_check_interval_secs")]
    pub stall_check_interval_secs: u64,

    /// Per-stream bandwidth ceiling in KiB/s (0 = disabled)
    #[arg(long, env = "RELAY_MAX_KBPS", default_value_t = 0)]
    #[serde(default)]
    pub max_kbps: u64,

    /// Time allowed until response headers are sent
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Time allowed to receive request headers, also bounding idle keep-alive
    #[arg(long, env = "RELAY_HEADER_READ_TIMEOUT_SECS", default_value_t = 10)]
    #[serde(default = "default_header_read_timeout_secs")]
    pub header_read_timeout_secs: u64,

    /// Keep connections open between requests
    #[arg(long, env = "RELAY_KEEP_ALIVE", default_value_t = true, action = ArgAction::Set)]
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,

    /// Identify clients by the first X-Forwarded-For entry
    #[arg(long, env = "RELAY_TRUST_FORWARDED_FOR")]
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Users allowed to register files (empty = everyone)
    #[arg(long, env = "RELAY_ALLOWED_USERS", value_delimiter = ',')]
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Storage backend: local or s3
    #[arg(short, long, env = "RELAY_STORAGE_BACKEND", default_value = "local")]
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Root directory for the local backend
    #[arg(short = 'w', long, env = "RELAY_STORAGE_ROOT", default_value = ".")]
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// S3 bucket name (required when storage-backend is s3)
    #[arg(long, env = "RELAY_S3_BUCKET")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    /// S3 endpoint (for MinIO/custom S3)
    #[arg(long, env = "RELAY_S3_ENDPOINT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long, env = "RELAY_S3_REGION")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_region: Option<String>,

    /// S3 access key ID
    #[arg(long, env = "RELAY_S3_ACCESS_KEY_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "RELAY_S3_SECRET_ACCESS_KEY")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_secret_access_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            internal_port: default_internal_port(),
            bind_address: default_bind_address(),
            public_base_url: default_public_base_url(),
            config: None,
            large_file_threshold: default_large_file_threshold(),
            large_alignment: default_large_alignment(),
            small_alignment: default_small_alignment(),
            max_per_token: default_max_per_token(),
            max_clients: default_max_clients(),
            max_global: default_max_global(),
            max_registry_entries: default_max_registry_entries(),
            registry_path: None,
            registry_debounce_ms: default_registry_debounce_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            stall_check_interval_secs: default_stall_check_interval_secs(),
            max_kbps: 0,
            request_timeout_secs: default_request_timeout_secs(),
            header_read_timeout_secs: default_header_read_timeout_secs(),
            keep_alive: default_keep_alive(),
            trust_forwarded_for: false,
            allowed_users: Vec::new(),
            storage_backend: default_storage_backend(),
            storage_root: default_storage_root(),
            s3_bucket: None,
            s3_endpoint: None,
            s3_region: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file: Config) -> Self {
        // A CLI value still at its default yields to the file value.
        macro_rules! prefer_file {
            ($($field:ident => $default:expr),* $(,)?) => {
                $(if self.$field == $default { self.$field = file.$field; })*
            };
        }

        prefer_file! {
            listen_on_port => default_port(),
            internal_port => default_internal_port(),
            bind_address => default_bind_address(),
            public_base_url => default_public_base_url(),
            large_file_threshold => default_large_file_threshold(),
            large_alignment => default_large_alignment(),
            small_alignment => default_small_alignment(),
            max_per_token => default_max_per_token(),
            max_clients => default_max_clients(),
            max_global => default_max_global(),
            max_registry_entries => default_max_registry_entries(),
            registry_debounce_ms => default_registry_debounce_ms(),
            stall_timeout_secs => default_stall_timeout_secs(),
            stall_check_interval_secs => default_stall_check_interval_secs(),
            max_kbps => 0,
            request_timeout_secs => default_request_timeout_secs(),
            header_read_timeout_secs => default_header_read_timeout_secs(),
            keep_alive => default_keep_alive(),
            trust_forwarded_for => false,
            storage_backend => default_storage_backend(),
            storage_root => default_storage_root(),
        }

        if self.allowed_users.is_empty() {
            self.allowed_users = file.allowed_users;
        }

        // For Option fields, CLI takes precedence if Some
        if self.registry_path.is_none() {
            self.registry_path = file.registry_path;
        }
        if self.s3_bucket.is_none() {
            self.s3_bucket = file.s3_bucket;
        }
        if self.s3_endpoint.is_none() {
            self.s3_endpoint = file.s3_endpoint;
        }
        if self.s3_region.is_none() {
            self.s3_region = file.s3_region;
        }
        if self.s3_access_key_id.is_none() {
            self.s3_access_key_id = file.s3_access_key_id;
        }
        if self.s3_secret_access_key.is_none() {
            self.s3_secret_access_key = file.s3_secret_access_key;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.large_alignment == 0 || self.small_alignment == 0 {
            bail!("Alignments must be greater than zero");
        }
        if self.max_registry_entries == 0 {
            bail!("max_registry_entries must be greater than zero");
        }
        if self.stall_timeout_secs == 0 {
            bail!("stall_timeout_secs must be greater than zero");
        }
        if self.stall_check_interval_secs == 0 {
            bail!("stall_check_interval_secs must be greater than zero");
        }
        if !self.public_base_url.starts_with("http://") && !self.public_base_url.starts_with("https://") {
            bail!("Public base URL must start with http:// or https://");
        }
        if self.listen_on_port != 0 && self.listen_on_port == self.internal_port {
            bail!("Public and internal ports must differ");
        }

        self.storage().map(|_| ())
    }

    /// Storage backend described by this configuration
    pub fn storage(&self) -> Result<StorageBackend> {
        match self.storage_backend.as_str() {
            "local" => Ok(StorageBackend::Local {
                root: PathBuf::from(&self.storage_root),
            }),
            "s3" => Ok(StorageBackend::S3 {
                bucket: required(&self.s3_bucket, "S3 bucket name")?,
                endpoint: self.s3_endpoint.clone(),
                region: self.s3_region.clone(),
                access_key_id: required(&self.s3_access_key_id, "S3 access key ID")?,
                secret_access_key: required(&self.s3_secret_access_key, "S3 secret access key")?,
            }),
            backend => Err(anyhow!(
                "Unsupported storage backend: {}. Use 'local' or 's3'",
                backend
            )),
        }
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_per_token: self.max_per_token,
            max_clients: self.max_clients,
            max_global: self.max_global,
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            alignment: AlignmentPolicy {
                large_threshold: self.large_file_threshold,
                large_align: self.large_alignment,
                small_align: self.small_alignment,
            },
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            stall_check_interval: Duration::from_secs(self.stall_check_interval_secs),
            max_kbps: self.max_kbps,
        }
    }

    pub fn registry_debounce(&self) -> Duration {
        Duration::from_millis(self.registry_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String> {
    value
        .as_ref()
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| anyhow!("{what} is required when backend is 's3'"))
}

// Default value functions
fn default_port() -> u16 {
    32145
}

fn default_internal_port() -> u16 {
    32146
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:32145".to_string()
}

fn default_large_file_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_large_alignment() -> u64 {
    1024 * 1024
}

fn default_small_alignment() -> u64 {
    4096
}

fn default_max_per_token() -> usize {
    3
}

fn default_max_clients() -> usize {
    50
}

fn default_max_global() -> usize {
    100
}

fn default_max_registry_entries() -> usize {
    10_000
}

fn default_registry_debounce_ms() -> u64 {
    1000
}

fn default_stall_timeout_secs() -> u64 {
    120
}

fn default_stall_check_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_header_read_timeout_secs() -> u64 {
    10
}

fn default_keep_alive() -> bool {
    true
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    ".".to_string()
}
