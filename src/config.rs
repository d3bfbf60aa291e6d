use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngramConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub working_memory: WorkingMemoryConfig,
    pub retrieval: RetrievalConfig,
    pub decay: DecayConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// `"stdio"` or `"http"`.
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Per-operation deadline in seconds; elapsed deadlines abort in-flight
    /// model and store calls with a timeout error.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Embedding dimension D. Fixed at index creation; changing it requires
    /// re-embedding every row.
    pub embedding_dim: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the model service (Ollama-compatible API).
    pub host: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    /// Default session capacity in tokens.
    pub default_max_tokens: i64,
    /// Evicted items at or above this relevance are promoted to long-term.
    pub eviction_promotion_threshold: f64,
    /// Checkpoint/clear promote items at or above this relevance.
    pub checkpoint_relevance_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum cosine similarity for recall results.
    pub min_similarity: f64,
    /// Cosine similarity at or above which a new memory merges with an
    /// existing one instead of inserting.
    pub dedup_threshold: f64,
    /// Cosine similarity floor for contradiction candidates.
    pub contradiction_threshold: f64,
    /// Half-life in days for the recency term of the composite score.
    pub recency_half_life_days: f64,
    /// Access count at which the frequency term saturates.
    pub access_count_cap: u64,
    pub weight_semantic: f64,
    pub weight_recency: f64,
    pub weight_frequency: f64,
    pub weight_importance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DecayConfig {
    pub rate: f64,
    pub inactive_days: i64,
    pub importance_floor: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 8377,
            log_level: "info".into(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_engram_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            embedding_dim: 768,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:11434".into(),
            chat_model: "llama3.1".into(),
            embedding_model: "nomic-embed-text".into(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 8_000,
            eviction_promotion_threshold: 0.6,
            checkpoint_relevance_threshold: 0.5,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.7,
            dedup_threshold: 0.95,
            contradiction_threshold: 0.75,
            recency_half_life_days: 30.0,
            access_count_cap: 100,
            weight_semantic: 0.5,
            weight_recency: 0.2,
            weight_frequency: 0.1,
            weight_importance: 0.2,
        }
    }
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            rate: 0.98,
            inactive_days: 7,
            importance_floor: 0.1,
        }
    }
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl EngramConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngramConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (ENGRAM_DB, ENGRAM_LOG_LEVEL,
    /// ENGRAM_MODEL_HOST). Secrets arrive only via this channel or the config
    /// file; the core reads no other process environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENGRAM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_MODEL_HOST") {
            self.model.host = val;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.storage.embedding_dim == 0 {
            anyhow::bail!("storage.embedding_dim must be positive");
        }
        for (name, value) in [
            ("retrieval.min_similarity", self.retrieval.min_similarity),
            ("retrieval.dedup_threshold", self.retrieval.dedup_threshold),
            (
                "retrieval.contradiction_threshold",
                self.retrieval.contradiction_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be within [0.0, 1.0], got {value}");
            }
        }
        if self.working_memory.default_max_tokens <= 0 {
            anyhow::bail!("working_memory.default_max_tokens must be positive");
        }
        if !(0.0..=1.0).contains(&self.decay.rate) {
            anyhow::bail!("decay.rate must be within [0.0, 1.0]");
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngramConfig::default();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.storage.embedding_dim, 768);
        assert_eq!(config.working_memory.default_max_tokens, 8_000);
        assert!((config.retrieval.dedup_threshold - 0.95).abs() < f64::EPSILON);
        assert!(config.storage.db_path.ends_with("memory.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/engram-test.db"
embedding_dim = 1536

[retrieval]
min_similarity = 0.5

[decay]
rate = 0.95
"#;
        let config: EngramConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/engram-test.db");
        assert_eq!(config.storage.embedding_dim, 1536);
        assert!((config.retrieval.min_similarity - 0.5).abs() < f64::EPSILON);
        assert!((config.decay.rate - 0.95).abs() < f64::EPSILON);
        // defaults still apply for unset fields
        assert!((config.retrieval.dedup_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.decay.inactive_days, 7);
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let mut config = EngramConfig::default();
        config.retrieval.dedup_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngramConfig::default();
        config.storage.embedding_dim = 0;
        assert!(config.validate().is_err());

        let mut config = EngramConfig::default();
        config.working_memory.default_max_tokens = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngramConfig::default();
        std::env::set_var("ENGRAM_DB", "/tmp/override.db");
        std::env::set_var("ENGRAM_LOG_LEVEL", "trace");
        std::env::set_var("ENGRAM_MODEL_HOST", "http://model.internal:11434");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.model.host, "http://model.internal:11434");

        std::env::remove_var("ENGRAM_DB");
        std::env::remove_var("ENGRAM_LOG_LEVEL");
        std::env::remove_var("ENGRAM_MODEL_HOST");
    }
}
