use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite before the compactor runs.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// Administrator created on first start if no account has this email.
    pub admin_email: String,
    pub admin_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both ROOMBOOK_TLS_CERT and ROOMBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("ROOMBOOK_MAX_CONNECTIONS must be at least 1")]
    NoConnections,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (lookup("ROOMBOOK_TLS_CERT"), lookup("ROOMBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        let config = Self {
            port: parsed(&lookup, "ROOMBOOK_PORT")?.unwrap_or(5433),
            bind: lookup("ROOMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("ROOMBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("ROOMBOOK_PASSWORD").unwrap_or_else(|| "roombook".into()),
            max_connections: parsed(&lookup, "ROOMBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "ROOMBOOK_METRICS_PORT")?,
            tls,
            admin_email: lookup("ROOMBOOK_ADMIN_EMAIL").unwrap_or_else(|| "admin@example.com".into()),
            admin_name: lookup("ROOMBOOK_ADMIN_NAME").unwrap_or_else(|| "Admin User".into()),
        };
        if config.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
