//! Startup configuration: a JSON file overridden by environment variables.
//!
//! Keys are the same upper-case names in both places (`API_KEY`,
//! `LIMIT_SHARE`, ...). The file path comes from `CONFIG_FILE` and defaults to
//! `config.json`; a missing file is an empty config. Loaded once, immutable
//! afterwards.

use crate::limit::{LimitSettings, ScopeKind};
use crate::route::{region_placeholder, RouteResolver, DEFAULT_REGIONS};
use chrono::TimeDelta;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://{}.api.riotgames.com";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LIMIT_SHARE must be in (0, 1] or (1, 100] as a percentage, got {0}")]
    InvalidLimitShare(f64),
    #[error("API_KEY is not set")]
    MissingApiKey,
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings handed to the upstream forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub api_key: String,
    /// Base URL with one `{}` (or `%s`) placeholder for the region.
    pub api_url: String,
    /// Fraction of the upstream quota this instance may claim.
    pub limit_share: f64,
    pub debug: bool,
    pub safety_margin: u32,
    pub end_padding_secs: u32,
    pub upstream_timeout_secs: u64,
    pub allowed_regions: Vec<String>,
    /// Scope whose handlers are checked first during admission.
    pub first_limit: ScopeKind,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            limit_share: 1.0,
            debug: false,
            safety_margin: 5,
            end_padding_secs: 2,
            upstream_timeout_secs: 10,
            allowed_regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            first_limit: ScopeKind::Method,
        }
    }
}

/// File values with environment lookups layered on top.
struct Sources<F> {
    file: Map<String, Value>,
    env: F,
}

impl<F: Fn(&str) -> Option<String>> Sources<F> {
    fn get(&self, key: &'static str) -> Option<Value> {
        if let Some(value) = (self.env)(key).filter(|v| !v.is_empty()) {
            info!(target: "quotaguard::config", key, "setting taken from environment");
            return Some(Value::String(value));
        }
        let value = self.file.get(key).filter(|v| !v.is_null())?;
        info!(target: "quotaguard::config", key, "setting taken from config file");
        Some(value.clone())
    }

    fn string(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(invalid(key, &other)),
        }
    }

    fn number(&self, key: &'static str) -> Result<Option<f64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(key, &Value::Number(n))),
            Some(Value::String(s)) => {
                s.trim().parse().map(Some).map_err(|_| invalid(key, &Value::String(s)))
            }
            Some(other) => Err(invalid(key, &other)),
        }
    }

    fn unsigned(&self, key: &'static str) -> Result<Option<u64>, ConfigError> {
        match self.number(key)? {
            None => Ok(None),
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => Ok(Some(n as u64)),
            Some(n) => Err(ConfigError::InvalidValue { key, value: n.to_string() }),
        }
    }

    fn boolean(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::String(s)) => Ok(Some(parse_bool(&s))),
            Some(other) => Err(invalid(key, &other)),
        }
    }

    fn list(&self, key: &'static str) -> Result<Option<Vec<String>>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(
                s.split(',').map(str::trim).filter(|r| !r.is_empty()).map(str::to_string).collect(),
            )),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(invalid(key, &other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(invalid(key, &other)),
        }
    }
}

fn invalid(key: &'static str, value: &Value) -> ConfigError {
    ConfigError::InvalidValue { key, value: value.to_string() }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "t" | "yes" | "y" | "1")
}

/// Fraction in `(0, 1]`; values above 1 are read as a percentage.
fn normalize_share(raw: f64) -> Result<f64, ConfigError> {
    let share = if raw > 1.0 { raw / 100.0 } else { raw };
    if share.is_finite() && share > 0.0 && share <= 1.0 {
        Ok(share)
    } else {
        Err(ConfigError::InvalidLimitShare(raw))
    }
}

fn parse_scope_kind(value: &str) -> Option<ScopeKind> {
    match value.trim().to_ascii_uppercase().as_str() {
        "APP" => Some(ScopeKind::App),
        "METHOD" => Some(ScopeKind::Method),
        _ => None,
    }
}

fn read_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(target: "quotaguard::config", path = %path.display(), "no config file; using defaults and environment");
            return Ok(Map::new());
        }
        Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
    };
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

impl ProxyConfig {
    /// Load from `CONFIG_FILE` (default `config.json`) and the process
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_sources(Path::new(&path), |key| std::env::var(key).ok())
    }

    /// Load from `path`, with `env` consulted first for every key.
    pub fn from_sources<F>(path: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sources = Sources { file: read_file(path)?, env };
        let defaults = Self::default();

        let api_key = sources.string("API_KEY")?.ok_or(ConfigError::MissingApiKey)?;
        let limit_share = match sources.number("LIMIT_SHARE")? {
            Some(raw) => normalize_share(raw)?,
            None => defaults.limit_share,
        };
        let first_limit = match sources.string("FIRST_LIMIT")? {
            Some(raw) => parse_scope_kind(&raw)
                .ok_or(ConfigError::InvalidValue { key: "FIRST_LIMIT", value: raw })?,
            None => defaults.first_limit,
        };

        let api_url = sources.string("API_URL")?.unwrap_or(defaults.api_url);
        if region_placeholder(&api_url).is_none() {
            return Err(ConfigError::InvalidValue { key: "API_URL", value: api_url });
        }

        let config = Self {
            api_key,
            api_url,
            limit_share,
            debug: sources.boolean("DEBUG")?.unwrap_or(defaults.debug),
            safety_margin: sources
                .unsigned("SAFETY_MARGIN")?
                .map_or(defaults.safety_margin, |v| v as u32),
            end_padding_secs: sources
                .unsigned("END_PADDING_SECS")?
                .map_or(defaults.end_padding_secs, |v| v as u32),
            upstream_timeout_secs: sources
                .unsigned("UPSTREAM_TIMEOUT_SECS")?
                .unwrap_or(defaults.upstream_timeout_secs),
            allowed_regions: sources.list("ALLOWED_REGIONS")?.unwrap_or(defaults.allowed_regions),
            first_limit,
        };
        debug!(
            target: "quotaguard::config",
            api_url = %config.api_url,
            limit_share = config.limit_share,
            safety_margin = config.safety_margin,
            first_limit = %config.first_limit,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn limit_settings(&self) -> LimitSettings {
        LimitSettings {
            safety_margin: self.safety_margin,
            limit_share: self.limit_share,
            end_padding: TimeDelta::seconds(i64::from(self.end_padding_secs)),
        }
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
        }
    }

    pub fn route_resolver(&self) -> RouteResolver {
        RouteResolver::new(self.allowed_regions.iter().cloned())
    }
}
