//! Configuration access for the gRPC mesh module.
//!
//! Configuration is an opaque key/value accessor backed by the `config` crate.
//! Sources are layered in order of precedence, later ones winning:
//! 1. Optional TOML file
//! 2. Environment variables (prefixed with `GRPCMESH_`)
//! 3. Programmatic overrides ([`Config::with`])
//!
//! # Keys
//!
//! - `laddr` - local bind address of the default TCP provider (default `:8080`)
//! - `backoff` - serve loop retry interval (default `5s`)
//! - `remote` - dial address of a remote service (required for remote services)
//! - `timeout` - per remote service dial timeout
//! - `dial_timeout` - module-wide dial timeout (default `20s`)
//! - `poll_interval` - provider readiness polling interval (default `1s`)
//! - `provider_policy` - `tolerant` or `strict` provider resolution
//!
//! Durations accept humantime strings (`"250ms"`, `"5s"`) or integer seconds.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::broker::ResolvePolicy;
use crate::error::{Error, Result};

pub const LADDR: &str = "laddr";
pub const BACKOFF: &str = "backoff";
pub const REMOTE: &str = "remote";
pub const TIMEOUT: &str = "timeout";
pub const DIAL_TIMEOUT: &str = "dial_timeout";
pub const POLL_INTERVAL: &str = "poll_interval";
pub const PROVIDER_POLICY: &str = "provider_policy";

pub const DEFAULT_LADDR: &str = ":8080";
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opaque key/value configuration handed to modules and factories.
#[derive(Debug, Clone, Default)]
pub struct Config {
    inner: config::Config,
}

impl Config {
    pub fn new(inner: config::Config) -> Self {
        Self { inner }
    }

    /// An empty configuration; every lookup falls back to its default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load configuration from an optional TOML file and `GRPCMESH_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("GRPCMESH"));
        Ok(Self::new(builder.build()?))
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let inner = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        Ok(Self::new(inner))
    }

    /// Returns a copy of this configuration with `key` overridden.
    pub fn with<V>(self, key: &str, value: V) -> Result<Self>
    where
        V: Into<config::Value>,
    {
        let inner = config::Config::builder()
            .add_source(self.inner)
            .set_override(key, value)?
            .build()?;
        Ok(Self::new(inner))
    }

    /// The sub-table stored under `key`, or an empty configuration.
    pub fn section(&self, key: &str) -> Result<Self> {
        let table = match self.inner.get_table(key) {
            Ok(table) => table,
            Err(config::ConfigError::NotFound(_)) => return Ok(Self::empty()),
            Err(e) => return Err(e.into()),
        };
        let mut builder = config::Config::builder();
        for (name, value) in table {
            builder = builder.set_override(name, value)?;
        }
        Ok(Self::new(builder.build()?))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.get::<config::Value>(key).is_ok()
    }

    /// String value of `key`, `None` when unset or empty.
    pub fn opt_string(&self, key: &str) -> Option<String> {
        self.inner
            .get_string(key)
            .ok()
            .filter(|value| !value.is_empty())
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.opt_string(key).unwrap_or_else(|| default.to_string())
    }

    /// Duration value of `key`. A present but unparsable value is an error
    /// rather than a silent fallback.
    pub fn opt_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.opt_string(key) {
            Some(raw) => parse_duration(&raw)
                .map(Some)
                .map_err(|reason| Error::Config(format!("{}: {}", key, reason))),
            None => Ok(None),
        }
    }

    pub fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(self.opt_duration(key)?.unwrap_or(default))
    }
}

fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| format!("invalid duration {:?}: {}", raw, e))
}

/// Typed module settings read once at Begin.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcSettings {
    /// Bind address of the bootstrapped default provider
    #[serde(default = "default_laddr")]
    pub laddr: String,
    /// Delay between serve loop attempts
    #[serde(default = "default_backoff", deserialize_with = "de_duration")]
    pub backoff: Duration,
    /// Upper bound of a dial when the caller supplies no deadline
    #[serde(default = "default_dial_timeout", deserialize_with = "de_duration")]
    pub dial_timeout: Duration,
    /// Provider readiness polling interval of the accept loop
    #[serde(default = "default_poll_interval", deserialize_with = "de_duration")]
    pub poll_interval: Duration,
    /// Provider resolution policy
    #[serde(
        rename = "provider_policy",
        default,
        deserialize_with = "de_policy"
    )]
    pub policy: ResolvePolicy,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            laddr: default_laddr(),
            backoff: default_backoff(),
            dial_timeout: default_dial_timeout(),
            poll_interval: default_poll_interval(),
            policy: ResolvePolicy::default(),
        }
    }
}

impl GrpcSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut settings: GrpcSettings = config.inner.clone().try_deserialize()?;
        if settings.laddr.is_empty() {
            settings.laddr = default_laddr();
        }
        Ok(settings)
    }
}

fn default_laddr() -> String {
    DEFAULT_LADDR.to_string()
}

fn default_backoff() -> Duration {
    DEFAULT_BACKOFF
}

fn default_dial_timeout() -> Duration {
    DEFAULT_DIAL_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

/// Integer seconds or a humantime string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(raw) => parse_duration(&raw).map_err(de::Error::custom),
    }
}

fn de_policy<'de, D>(deserializer: D) -> std::result::Result<ResolvePolicy, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(ResolvePolicy::default());
    }
    ResolvePolicy::from_str(&raw).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_on_empty_config() {
        let settings = GrpcSettings::from_config(&Config::empty()).unwrap();
        assert_eq!(settings.laddr, ":8080");
        assert_eq!(settings.backoff, Duration::from_secs(5));
        assert_eq!(settings.dial_timeout, Duration::from_secs(20));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.policy, ResolvePolicy::Tolerant);
    }

    #[test]
    fn test_durations_and_overrides() {
        let config = Config::from_toml(
            r#"
            backoff = "250ms"
            dial_timeout = 3
            provider_policy = "strict"
            "#,
        )
        .unwrap()
        .with(LADDR, "127.0.0.1:0")
        .unwrap();

        let settings = GrpcSettings::from_config(&config).unwrap();
        assert_eq!(settings.backoff, Duration::from_millis(250));
        assert_eq!(settings.dial_timeout, Duration::from_secs(3));
        assert_eq!(settings.laddr, "127.0.0.1:0");
        assert_eq!(settings.policy, ResolvePolicy::Strict);
    }

    #[test]
    fn test_string_seconds_and_unknown_policy() {
        let config = Config::empty().with(POLL_INTERVAL, "3").unwrap();
        let settings = GrpcSettings::from_config(&config).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(3));

        let config = Config::empty().with(PROVIDER_POLICY, "lenient").unwrap();
        assert!(matches!(
            GrpcSettings::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let config = Config::empty().with(BACKOFF, "soon").unwrap();
        let err = GrpcSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_remote_is_unset() {
        let config = Config::empty().with(REMOTE, "").unwrap();
        assert_eq!(config.opt_string(REMOTE), None);
        assert!(!Config::empty().contains(REMOTE));
    }

    #[test]
    fn test_section_and_file_loading() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[services.proxy]\nremote = \"127.0.0.1:9000\"\ntimeout = \"2s\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        let proxy = config.section("services").unwrap().section("proxy").unwrap();
        assert_eq!(proxy.opt_string(REMOTE).as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(
            proxy.opt_duration(TIMEOUT).unwrap(),
            Some(Duration::from_secs(2))
        );

        let missing = config.section("nothing").unwrap();
        assert_eq!(missing.opt_string(REMOTE), None);
    }
}
