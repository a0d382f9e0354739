//! Server configuration from `INTERVIEWD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::engine::EngineConfig;
use crate::guard::{Role, RolePolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub engine: EngineConfig,
    pub policy: RolePolicy,
}

/// Parse a numeric variable, or `None` when unset or unparseable.
fn num<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Numeric knobs fall back to their
    /// defaults when unparseable; timezone, roles, and TLS must be valid.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let timezone: Tz = match get("INTERVIEWD_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse()
                .map_err(|e| format!("INTERVIEWD_TIMEZONE: {e}"))?,
            None => chrono_tz::UTC,
        };
        let default_role: Role = match get("INTERVIEWD_DEFAULT_ROLE") {
            Some(role) => role.parse().map_err(|e| format!("INTERVIEWD_DEFAULT_ROLE: {e}"))?,
            None => Role::Viewer,
        };
        let policy = RolePolicy::parse(&get("INTERVIEWD_ROLES").unwrap_or_default(), default_role)
            .map_err(|e| format!("INTERVIEWD_ROLES: {e}"))?;
        let tls = match (get("INTERVIEWD_TLS_CERT"), get("INTERVIEWD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            _ => {
                return Err(
                    "both INTERVIEWD_TLS_CERT and INTERVIEWD_TLS_KEY must be set, or neither".into(),
                );
            }
        };

        let defaults = EngineConfig::default();
        Ok(Self {
            port: num(&get, "INTERVIEWD_PORT").unwrap_or(5433),
            bind: get("INTERVIEWD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("INTERVIEWD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("INTERVIEWD_PASSWORD").unwrap_or_else(|| "interviewd".into()),
            max_connections: num(&get, "INTERVIEWD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: num(&get, "INTERVIEWD_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: num(&get, "INTERVIEWD_METRICS_PORT"),
            tls,
            engine: EngineConfig {
                timezone,
                token_ttl_ms: num(&get, "INTERVIEWD_TOKEN_TTL_MS").unwrap_or(defaults.token_ttl_ms),
            },
            policy,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
