use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use proctor_core::policy::STRICT_THRESHOLD;
use proctor_core::PolicyConfig;
use proctor_link::ReconnectPolicy;
use serde::Deserialize;

use crate::cli::Cli;

/// Where replayed frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameInput {
    Stdin,
    File(PathBuf),
}

impl FrameInput {
    fn parse(arg: &str) -> Self {
        if arg == "-" {
            FrameInput::Stdin
        } else {
            FrameInput::File(PathBuf::from(arg))
        }
    }

    pub fn is_stdin(&self) -> bool {
        matches!(self, FrameInput::Stdin)
    }
}

/// Optional TOML overrides, passed with `--config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub policy: PolicyConfig,
    pub reconnect: ReconnectPolicy,
    pub request_timeout_secs: Option<u64>,
    pub frame_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Resolved runtime configuration.
///
/// Layering, lowest to highest: built-in defaults, the `--config` file,
/// `PROCTOR_*` environment variables, command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub session_id: String,
    /// Collector base URL without a trailing slash.
    pub server_url: String,
    pub namespace: String,
    pub policy: PolicyConfig,
    pub reconnect: ReconnectPolicy,
    /// Timeout for a single HTTP request to the collector.
    pub request_timeout: Duration,
    pub frames: FrameInput,
    /// Minimum spacing between frames; zero replays as fast as possible.
    pub frame_interval: Duration,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file, |key| std::env::var(key).ok())
    }

    fn resolve(cli: &Cli, file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let session_id = cli.session_id.trim().to_string();
        if session_id.is_empty() {
            bail!("--session-id must not be empty");
        }

        let server_url = cli.server_url.trim().trim_end_matches('/').to_string();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            bail!("--server-url must be an http:// or https:// URL, got {server_url:?}");
        }

        let mut policy = file.policy;
        if let Some(v) = env_parse(&env, "PROCTOR_THRESHOLD") {
            policy.threshold = v;
        }
        if let Some(v) = env_parse(&env, "PROCTOR_OBJECT_MIN_CONFIDENCE") {
            policy.object_min_confidence = v;
        }
        if let Some(v) = env_parse(&env, "PROCTOR_YAW_LIMIT_DEG") {
            policy.yaw_limit_deg = v;
        }
        if let Some(v) = env_parse(&env, "PROCTOR_ALERT_COOLDOWN_MS") {
            policy.alert_cooldown_ms = v;
        }
        let strict_env = env("PROCTOR_STRICT").map(|v| v != "0").unwrap_or(false);
        if cli.strict || strict_env {
            policy.threshold = STRICT_THRESHOLD;
        }
        policy.validate().context("invalid scoring policy")?;

        let mut reconnect = file.reconnect;
        if let Some(v) = env_parse(&env, "PROCTOR_RECONNECT_ATTEMPTS") {
            reconnect.max_attempts = v;
        }
        if let Some(v) = env_parse(&env, "PROCTOR_RECONNECT_DELAY_MS") {
            reconnect.initial_delay_ms = v;
        }

        let request_timeout_secs = env_parse(&env, "PROCTOR_REQUEST_TIMEOUT_SECS")
            .or(file.request_timeout_secs)
            .unwrap_or(10);

        let frame_interval_ms = cli
            .frame_interval_ms
            .or(file.frame_interval_ms)
            .unwrap_or(0);

        Ok(Self {
            session_id,
            server_url,
            namespace: cli.namespace.clone(),
            policy,
            reconnect,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
            frames: FrameInput::parse(&cli.frames),
            frame_interval: Duration::from_millis(frame_interval_ms),
        })
    }
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
