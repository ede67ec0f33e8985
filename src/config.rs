use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_STORAGE_DIR: &str = "./encrypted_uploads";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8000";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 24;
const MAX_TOKEN_LIFETIME_HOURS: i64 = 24 * 365 * 100;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("TLS_CERT_FILE and TLS_KEY_FILE must be set together")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Deployment settings. The encryption key is loaded on its own by
/// `keys::EncryptionKey::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub storage_dir: PathBuf,
    pub bind_address: String,
    pub public_base_url: String,
    pub token_lifetime_hours: i64,
    pub max_upload_bytes: u64,
    pub tls: Option<TlsConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let storage_dir = var("STORAGE_DIR").unwrap_or_else(|| DEFAULT_STORAGE_DIR.to_string());
        let bind_address =
            var("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let public_base_url = var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let token_lifetime_hours = parse_or(
            "TOKEN_LIFETIME_HOURS",
            var("TOKEN_LIFETIME_HOURS"),
            DEFAULT_TOKEN_LIFETIME_HOURS,
        )?;
        if token_lifetime_hours <= 0 || token_lifetime_hours > MAX_TOKEN_LIFETIME_HOURS {
            return Err(ConfigError::Invalid {
                name: "TOKEN_LIFETIME_HOURS",
                value: token_lifetime_hours.to_string(),
            });
        }

        let max_upload_bytes = parse_or(
            "MAX_UPLOAD_BYTES",
            var("MAX_UPLOAD_BYTES"),
            DEFAULT_MAX_UPLOAD_BYTES,
        )?;

        let tls = match (var("TLS_CERT_FILE"), var("TLS_KEY_FILE")) {
            (Some(cert_file), Some(key_file)) => Some(TlsConfig {
                cert_file: cert_file.into(),
                key_file: key_file.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Config {
            database_url,
            storage_dir: storage_dir.into(),
            bind_address,
            public_base_url,
            token_lifetime_hours,
            max_upload_bytes,
            tls,
        })
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse();
            parsed.map_err(|_| ConfigError::Invalid { name, value })
        }
    }
}
