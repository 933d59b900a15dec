//! TOML configuration: server address, logging, request limits and optional
//! replacement tables. A missing file means built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing_subscriber::{EnvFilter, fmt};

use crate::core::{AllocationTables, DEFAULT_SIMULATION_RUNS, TaxTables};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl LoggingConfig {
    /// Installs the global subscriber. `RUST_LOG` wins over the configured level.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

/// Bounds enforced at the HTTP and CLI boundary; the engine itself accepts
/// any valid size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_simulation_runs: u32,
    pub default_simulation_runs: u32,
    pub max_horizon_years: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_simulation_runs: 100_000,
            default_simulation_runs: DEFAULT_SIMULATION_RUNS,
            max_horizon_years: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub limits: LimitsConfig,
    /// TOML file replacing the built-in tax tables.
    pub tax_tables: Option<PathBuf>,
    /// TOML file replacing the built-in allocation tables.
    pub allocation_tables: Option<PathBuf>,
}

/// Tables handed to every request.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub tax: TaxTables,
    pub allocation: AllocationTables,
}

impl Config {
    /// Reads `path` when given; `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::parse_toml(&read(path)?).map_err(|e| match e {
                ConfigError::Parse { source, .. } => ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                },
                other => other,
            })?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".into(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_simulation_runs == 0 {
            return Err(invalid("limits.max_simulation_runs", "must be > 0"));
        }
        if limits.default_simulation_runs == 0
            || limits.default_simulation_runs > limits.max_simulation_runs
        {
            return Err(invalid(
                "limits.default_simulation_runs",
                "must be between 1 and limits.max_simulation_runs",
            ));
        }
        if limits.max_horizon_years == 0 {
            return Err(invalid("limits.max_horizon_years", "must be > 0"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(invalid("logging.format", "must be \"json\" or \"pretty\""));
        }
        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host", "must not be empty"));
        }
        Ok(())
    }

    /// Built-in tables, replaced by the configured files where present.
    pub fn load_tables(&self) -> Result<Tables, ConfigError> {
        let tax = match &self.tax_tables {
            Some(path) => load_table::<TaxTables>(path)?,
            None => TaxTables::default(),
        };
        tax.validate()?;

        let allocation = match &self.allocation_tables {
            Some(path) => load_table::<AllocationTables>(path)?,
            None => AllocationTables::default(),
        };
        allocation.validate()?;

        Ok(Tables { tax, allocation })
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })
}

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    toml::from_str(&read(path)?).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}
