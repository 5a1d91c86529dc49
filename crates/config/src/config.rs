//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Job and lock ceilings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Pending + active jobs allowed at once (default 10)
    #[serde(default = "default_max_global_tasks")]
    pub max_global_tasks: u32,
    /// Distinct URLs a single user may hold locks on (default 3)
    #[serde(default = "default_max_user_urls")]
    pub max_user_urls: u32,
    /// Queue worker count (0 = same as max_global_tasks)
    #[serde(default)]
    pub queue_concurrency: u32,
}

fn default_max_global_tasks() -> u32 {
    10
}

fn default_max_user_urls() -> u32 {
    3
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_global_tasks: default_max_global_tasks(),
            max_user_urls: default_max_user_urls(),
            queue_concurrency: 0,
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Network fallbacks and rate-limit handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Proxy used by the proxy fallback tier
    #[serde(default)]
    pub proxy: Option<String>,
    /// Netscape cookie file passed to the extractor on the first attempt
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
    /// Hosts that get backoff retries and a shared cooldown
    #[serde(default = "default_rate_limited_hosts")]
    pub rate_limited_hosts: Vec<String>,
    /// Hosts that may fall back to the generic extractor
    #[serde(default)]
    pub generic_extractor_hosts: Vec<String>,
    /// Hosts whose pages are scraped for an embedded media link first
    #[serde(default)]
    pub page_resolver_hosts: Vec<String>,
    /// Base delay for rate-limit backoff, doubled per attempt
    #[serde(default = "default_rate_limit_base_delay_secs")]
    pub rate_limit_base_delay_secs: u64,
    /// Attempts allowed against a rate-limited host
    #[serde(default = "default_rate_limit_max_attempts")]
    pub rate_limit_max_attempts: u32,
    /// Same-argument retries for transient network failures
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

fn default_rate_limited_hosts() -> Vec<String> {
    vec!["instagram.com".to_string()]
}

fn default_rate_limit_base_delay_secs() -> u64 {
    30
}

fn default_rate_limit_max_attempts() -> u32 {
    3
}

fn default_transient_retries() -> u32 {
    2
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            cookies_file: None,
            rate_limited_hosts: default_rate_limited_hosts(),
            generic_extractor_hosts: Vec::new(),
            page_resolver_hosts: Vec::new(),
            rate_limit_base_delay_secs: default_rate_limit_base_delay_secs(),
            rate_limit_max_attempts: default_rate_limit_max_attempts(),
            transient_retries: default_transient_retries(),
        }
    }
}

/// Delivery limits and status pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Largest file the delivery sink accepts (default 2 GiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Re-encode non-AAC audio so the sink can stream it
    #[serde(default = "default_require_aac_audio")]
    pub require_aac_audio: bool,
    /// Minimum gap between status updates
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Silence after which a heartbeat status is emitted
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// How many alternatives to offer for an oversize pick
    #[serde(default = "default_alternatives_limit")]
    pub alternatives_limit: usize,
}

fn default_max_upload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_require_aac_audio() -> bool {
    true
}

fn default_status_interval_ms() -> u64 {
    1500
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_alternatives_limit() -> usize {
    3
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            require_aac_audio: default_require_aac_audio(),
            status_interval_ms: default_status_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            alternatives_limit: default_alternatives_limit(),
        }
    }
}

/// Skip-segment provider settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SponsorConfig {
    #[serde(default = "default_sponsor_api_base")]
    pub api_base: String,
    #[serde(default = "default_sponsor_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_sponsor_max_attempts")]
    pub max_attempts: u32,
}

fn default_sponsor_api_base() -> String {
    "https://sponsor.ajay.app".to_string()
}

fn default_sponsor_categories() -> Vec<String> {
    vec![
        "sponsor".to_string(),
        "selfpromo".to_string(),
        "interaction".to_string(),
    ]
}

fn default_sponsor_max_attempts() -> u32 {
    3
}

impl Default for SponsorConfig {
    fn default() -> Self {
        Self {
            api_base: default_sponsor_api_base(),
            categories: default_sponsor_categories(),
            max_attempts: default_sponsor_max_attempts(),
        }
    }
}

/// Scratch space and snapshot output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Parent of the per-job workspaces
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Where the activity snapshot JSON is written (disabled if None)
    #[serde(default)]
    pub activity_snapshot_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_temp_dir() -> PathBuf {
    env::temp_dir().join("media-fetch")
}

fn default_snapshot_interval_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            activity_snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

/// Activity endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Quality menu lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConfig {
    /// Seconds an unconfirmed menu keeps its lock (default one hour)
    #[serde(default = "default_selection_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_selection_ttl_secs() -> u64 {
    3600
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_selection_ttl_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sponsor: SponsorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MAX_GLOBAL_TASKS -> limits.max_global_tasks
    /// - MAX_USER_URLS -> limits.max_user_urls
    /// - QUEUE_CONCURRENCY -> limits.queue_concurrency
    /// - YTDLP_PATH / FFMPEG_PATH / FFPROBE_PATH -> tools.*
    /// - MEDIA_PROXY -> network.proxy
    /// - MEDIA_COOKIES_FILE -> network.cookies_file
    /// - MEDIA_TEMP_DIR -> storage.temp_dir
    /// - METRICS_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("MAX_GLOBAL_TASKS") {
            self.limits.max_global_tasks = v;
        }
        if let Some(v) = env_u32("MAX_USER_URLS") {
            self.limits.max_user_urls = v;
        }
        if let Some(v) = env_u32("QUEUE_CONCURRENCY") {
            self.limits.queue_concurrency = v;
        }

        if let Some(v) = env_string("YTDLP_PATH") {
            self.tools.ytdlp_path = v;
        }
        if let Some(v) = env_string("FFMPEG_PATH") {
            self.tools.ffmpeg_path = v;
        }
        if let Some(v) = env_string("FFPROBE_PATH") {
            self.tools.ffprobe_path = v;
        }

        if let Some(v) = env_string("MEDIA_PROXY") {
            self.network.proxy = Some(v);
        }
        if let Some(v) = env_string("MEDIA_COOKIES_FILE") {
            self.network.cookies_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("MEDIA_TEMP_DIR") {
            self.storage.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("METRICS_BIND") {
            self.server.bind = v;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|v| v.trim().parse::<u32>().ok())
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "MAX_GLOBAL_TASKS",
            "MAX_USER_URLS",
            "QUEUE_CONCURRENCY",
            "YTDLP_PATH",
            "FFMPEG_PATH",
            "FFPROBE_PATH",
            "MEDIA_PROXY",
            "MEDIA_COOKIES_FILE",
            "MEDIA_TEMP_DIR",
            "METRICS_BIND",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_limits_and_delivery(
            max_global in 1u32..64,
            max_user in 1u32..16,
            concurrency in 0u32..64,
            max_upload in 1u64..10_000_000_000,
            require_aac in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[limits]
max_global_tasks = {}
max_user_urls = {}
queue_concurrency = {}

[delivery]
max_upload_bytes = {}
require_aac_audio = {}
"#,
                max_global, max_user, concurrency, max_upload, require_aac
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.limits.max_global_tasks, max_global);
            prop_assert_eq!(config.limits.max_user_urls, max_user);
            prop_assert_eq!(config.limits.queue_concurrency, concurrency);
            prop_assert_eq!(config.delivery.max_upload_bytes, max_upload);
            prop_assert_eq!(config.delivery.require_aac_audio, require_aac);
            // untouched sections keep defaults
            prop_assert_eq!(config.delivery.status_interval_ms, 1500);
            prop_assert_eq!(config.selection.ttl_secs, 3600);
        }

        #[test]
        fn prop_env_overrides_max_global_tasks(
            initial in 1u32..32,
            override_value in 1u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[limits]\nmax_global_tasks = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MAX_GLOBAL_TASKS", override_value.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.limits.max_global_tasks, override_value);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.limits.max_global_tasks, 10);
        assert_eq!(config.limits.max_user_urls, 3);
        assert_eq!(config.limits.queue_concurrency, 0);
        assert_eq!(config.tools.ytdlp_path, "yt-dlp");
        assert_eq!(config.network.rate_limited_hosts, vec!["instagram.com"]);
        assert_eq!(config.network.rate_limit_base_delay_secs, 30);
        assert_eq!(config.delivery.max_upload_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.delivery.heartbeat_secs, 15);
        assert_eq!(config.sponsor.max_attempts, 3);
        assert_eq!(config.server.bind, "127.0.0.1:7878");
        assert!(config.network.proxy.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[network]
proxy = "socks5://127.0.0.1:1080"
generic_extractor_hosts = ["example.org"]
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(
            config.network.proxy.as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert_eq!(config.network.generic_extractor_hosts, vec!["example.org"]);
        assert_eq!(config.network.rate_limit_max_attempts, 3);
        assert_eq!(config.limits.max_global_tasks, 10);
    }

    #[test]
    fn test_env_overrides_strings_and_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("MEDIA_PROXY", "http://proxy:3128");
        env::set_var("MEDIA_COOKIES_FILE", "/srv/cookies.txt");
        env::set_var("YTDLP_PATH", "/opt/yt-dlp");
        env::set_var("MAX_USER_URLS", "not-a-number");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.network.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(
            config.network.cookies_file,
            Some(PathBuf::from("/srv/cookies.txt"))
        );
        assert_eq!(config.tools.ytdlp_path, "/opt/yt-dlp");
        // invalid numbers keep the existing value
        assert_eq!(config.limits.max_user_urls, 3);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Config::parse_toml("[limits\nmax_global_tasks = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
