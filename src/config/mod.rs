pub mod venue;

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

pub use venue::{Venue, VenueConfig, VenueError, VenueWarning};

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub store: StoreConfig,
    pub allocator: AllocatorConfig,
    pub venue: VenueSource,
    pub audit: AuditConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
    pub index_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}', expected pretty or json", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend '{}', expected postgres or memory", other),
        }
    }
}

// Настройки хранилища регистраций и курсора
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub pool_size: u32,
    pub seed_file: Option<String>,
}

// Повторы транзакции check-in при конфликте
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

// Откуда брать конфигурацию зала (None - встроенная)
#[derive(Debug, Clone, Deserialize)]
pub struct VenueSource {
    pub path: Option<String>,
}

// Периодическая сверка курсора и выданных мест
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app: AppConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                environment: "development".to_string(),
                rust_log: "checkin_system=debug,tower_http=debug".to_string(),
                log_format: LogFormat::Pretty,
                index_file: "static/index.html".to_string(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                database_url: None,
                pool_size: 20,
                seed_file: None,
            },
            allocator: AllocatorConfig {
                max_attempts: 5,
                backoff_ms: 20,
            },
            venue: VenueSource { path: None },
            audit: AuditConfig { interval_seconds: 300 },
        }
    }
}

fn var_or<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Config {
            app: AppConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: var_or("PORT", "5000")?,
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                rust_log: env::var("RUST_LOG")
                    .unwrap_or_else(|_| "checkin_system=debug,tower_http=debug".to_string()),
                log_format: var_or("LOG_FORMAT", "pretty")?,
                index_file: env::var("INDEX_FILE").unwrap_or_else(|_| "static/index.html".to_string()),
            },
            store: StoreConfig {
                backend: var_or("STORE_BACKEND", "postgres")?,
                database_url: var_opt("DATABASE_URL"),
                pool_size: var_or("DB_POOL_SIZE", "20")?,
                seed_file: var_opt("SEED_FILE"),
            },
            allocator: AllocatorConfig {
                max_attempts: var_or("CHECKIN_MAX_ATTEMPTS", "5")?,
                backoff_ms: var_or("CHECKIN_BACKOFF_MS", "20")?,
            },
            venue: VenueSource { path: var_opt("VENUE_CONFIG") },
            audit: AuditConfig {
                interval_seconds: var_or("AUDIT_INTERVAL_SECONDS", "300")?,
            },
        };

        if config.store.backend == StoreBackend::Postgres && config.store.database_url.is_none() {
            bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }
        if config.allocator.max_attempts == 0 {
            bail!("CHECKIN_MAX_ATTEMPTS must be at least 1");
        }

        Ok(config)
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.store
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }
}
