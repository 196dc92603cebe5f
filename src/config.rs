//! Configuration loading and validation.
//!
//! Courier reads a single human-owned `courier.toml`. Every key has a
//! default, so a missing file section (or a missing file, via
//! [`Config::default`]) yields a working local setup. A small set of
//! environment variables override the file after it is parsed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ServerConfig::bind`].
pub const ENV_BIND: &str = "COURIER_BIND";

/// Environment variable overriding [`BridgeConfig::base_url`].
pub const ENV_BRIDGE_URL: &str = "COURIER_BRIDGE_URL";

/// Caption used for media sends when the request does not carry one.
const DEFAULT_CAPTION: &str = "Sent with Courier.";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP front end settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// WhatsApp bridge sidecar settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Dispatch worker timing and queue settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Media directories and preparation policy.
    #[serde(default)]
    pub media: MediaConfig,

    /// Default captions for media sends.
    #[serde(default)]
    pub captions: CaptionsConfig,

    /// Fallback log location.
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP front end settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// WhatsApp bridge sidecar settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Root URL of the bridge HTTP API.
    #[serde(default = "default_bridge_url")]
    pub base_url: String,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Dispatch worker timing and queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// How long a caller waits for a submitted task, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Upper bound on a single connect attempt, in seconds. Must be shorter
    /// than `deadline_secs` so a connect timeout reaches the caller.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Number of tasks that may wait in the worker queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl DispatchConfig {
    /// Caller-side deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Media directories and preparation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    /// Directory video file names are resolved against.
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// Directory image file names are resolved against.
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Files at or above this many MiB are flagged with a size warning.
    #[serde(default = "default_size_warning_mb")]
    pub size_warning_mb: u64,

    /// Whether non-portable video containers are transcoded to MP4.
    #[serde(default = "default_transcode")]
    pub transcode: bool,

    /// Path or name of the ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

impl MediaConfig {
    /// Size warning threshold in bytes.
    pub fn size_warning_bytes(&self) -> u64 {
        self.size_warning_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_dir: default_video_dir(),
            image_dir: default_image_dir(),
            size_warning_mb: default_size_warning_mb(),
            transcode: default_transcode(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Default captions for media sends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptionsConfig {
    /// Caption for video sends.
    #[serde(default)]
    pub video: Option<String>,

    /// Caption for image sends.
    #[serde(default)]
    pub image: Option<String>,

    /// Caption used when no kind-specific caption is set.
    #[serde(default = "default_caption")]
    pub default: String,
}

impl CaptionsConfig {
    /// Caption for video sends, falling back to the default caption.
    pub fn video(&self) -> &str {
        self.video.as_deref().unwrap_or(&self.default)
    }

    /// Caption for image sends, falling back to the default caption.
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(&self.default)
    }
}

impl Default for CaptionsConfig {
    fn default() -> Self {
        Self {
            video: None,
            image: None,
            default: default_caption(),
        }
    }
}

/// Fallback log location.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// CSV file failed media deliveries are appended to.
    #[serde(default = "default_fallback_path")]
    pub path: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            path: default_fallback_path(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rotating JSON logs. Console-only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions for serde

fn default_bind() -> String {
    "127.0.0.1:5000".to_owned()
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_owned()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_deadline_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    25
}
fn default_queue_capacity() -> usize {
    64
}
fn default_video_dir() -> PathBuf {
    PathBuf::from("./videos")
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("./images")
}
fn default_size_warning_mb() -> u64 {
    50
}
fn default_transcode() -> bool {
    true
}
fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_caption() -> String {
    DEFAULT_CAPTION.to_owned()
}
fn default_fallback_path() -> PathBuf {
    PathBuf::from("error_files.csv")
}

impl Config {
    /// Parse configuration from TOML text and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for [`Config`] or
    /// fails [`Config::validate`].
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the parsed file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Ok(url) = std::env::var(ENV_BRIDGE_URL) {
            self.bridge.base_url = url;
        }
    }

    /// Check values that serde cannot check on its own.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable bridge URL, a zero deadline, a
    /// connect timeout that is zero or not shorter than the deadline, or a
    /// zero queue capacity.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.bridge.base_url)
            .map_err(|e| anyhow::anyhow!("invalid bridge.base_url {}: {e}", self.bridge.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("bridge.base_url must be http or https, got {}", url.scheme());
        }
        if self.dispatch.deadline_secs == 0 {
            anyhow::bail!("dispatch.deadline_secs must be greater than zero");
        }
        if self.dispatch.connect_timeout_secs == 0 {
            anyhow::bail!("dispatch.connect_timeout_secs must be greater than zero");
        }
        if self.dispatch.connect_timeout_secs >= self.dispatch.deadline_secs {
            anyhow::bail!(
                "dispatch.connect_timeout_secs ({}) must be shorter than dispatch.deadline_secs ({})",
                self.dispatch.connect_timeout_secs,
                self.dispatch.deadline_secs
            );
        }
        if self.dispatch.queue_capacity == 0 {
            anyhow::bail!("dispatch.queue_capacity must be greater than zero");
        }
        Ok(())
    }
}

/// Load the configuration from a TOML file, then apply env overrides.
///
/// A missing file is not an error: defaults are used instead.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or
/// validated.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
        Config::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("{e} ({})", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.courier/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".courier"))
}
