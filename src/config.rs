use std::env;
use std::time::Duration;

use dotenvy::dotenv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: LedgerBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub bind_addr: String,
    pub strict_transitions: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL not set")]
    MissingDatabaseUrl,

    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

impl Config {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("LEDGER_BACKEND").as_deref() {
            None | Some("postgres") => LedgerBackend::Postgres,
            Some("memory") => LedgerBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LEDGER_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if backend == LedgerBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10u32)?;
        let acquire_timeout = Duration::from_secs(parse_or(
            &lookup,
            "DATABASE_ACQUIRE_TIMEOUT_SECS",
            5u64,
        )?);
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());

        let strict_transitions = match lookup("STRICT_STATUS_TRANSITIONS") {
            None => false,
            Some(value) => parse_flag(&value).ok_or(ConfigError::Invalid {
                key: "STRICT_STATUS_TRANSITIONS",
                value,
            })?,
        };

        Ok(Config {
            backend,
            database_url,
            max_connections,
            acquire_timeout,
            bind_addr,
            strict_transitions,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
