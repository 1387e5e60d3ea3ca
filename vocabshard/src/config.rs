use crate::errors::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a vocabshard deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub sharding: ShardingConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

/// Model dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub seq_len: usize,
    /// Seed for generated parameters when no parameter file is given
    pub seed: u64,
    /// CBOR parameter file (supports `~`)
    pub params_path: Option<String>,
}

/// Shard layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub shard_count: usize,
    pub top_k: usize,
}

/// Executor behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub coalesce_copies: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            model: ModelConfig {
                vocab_size: 50272,
                embedding_dim: 1600,
                seq_len: 256,
                seed: 42,
                params_path: None,
            },
            sharding: ShardingConfig {
                shard_count: 2,
                top_k: 4,
            },
            executor: ExecutorConfig {
                timeout_ms: 30_000,
                coalesce_copies: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: "~/.vocabshard/logs".to_string(),
            },
        }
    }
}

impl LoggingConfig {
    /// Log directory with `~` expanded
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.log_dir).into_owned())
    }
}

impl Config {
    /// Get default configuration file path: `~/.vocabshard/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ShardError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".vocabshard").join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: Config = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sharding.shard_count == 0 {
            return Err(ShardError::Config(
                "shard_count must be at least 1".into(),
            ));
        }

        if self.model.vocab_size < self.sharding.shard_count {
            return Err(ShardError::Config(format!(
                "vocab_size {} is smaller than shard_count {}",
                self.model.vocab_size, self.sharding.shard_count
            )));
        }

        if self.sharding.top_k == 0 {
            return Err(ShardError::Config("top_k must be at least 1".into()));
        }

        let narrowest = self.model.vocab_size / self.sharding.shard_count;
        if self.sharding.top_k > narrowest {
            return Err(ShardError::Config(format!(
                "top_k {} exceeds the narrowest shard width {}",
                self.sharding.top_k, narrowest
            )));
        }

        if self.model.embedding_dim == 0 || self.model.seq_len == 0 {
            return Err(ShardError::Config(
                "embedding_dim and seq_len must be at least 1".into(),
            ));
        }

        if self.executor.timeout_ms == 0 {
            return Err(ShardError::Config("timeout_ms must be at least 1".into()));
        }

        // Validate log level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ShardError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Parameter file path with `~` expanded
    pub fn params_path(&self) -> Option<PathBuf> {
        self.model
            .params_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}
