use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub gateway: Gateway,
    #[serde(default)]
    pub journal: Journal,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub base_url: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_qr_ttl_ms")]
    pub qr_ttl_ms: u64,
}

/// Where webhook payloads that failed processing are kept for manual replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default)]
    pub failed_events_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_qr_ttl_ms() -> u64 {
    20_000
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    let base_url = cfg.gateway.base_url.trim();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "gateway.base_url={base_url} must be an http(s) URL"
        )));
    }
    if cfg.gateway.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gateway.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg
        .journal
        .failed_events_path
        .as_ref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(false)
    {
        return Err(ConfigError::UnsupportedConfig(
            "journal.failed_events_path must not be empty when set".to_string(),
        ));
    }
    if !matches!(
        cfg.logging.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.level={} is not one of trace, debug, info, warn, error",
            cfg.logging.level
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("zapcrm-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

gateway:
  base_url: "https://api.z-api.io"
  timeout_ms: 5000
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should load");
        assert_eq!(cfg.gateway.qr_ttl_ms, 20_000);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.journal.failed_events_path.is_none());
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_without_path() {
        let path = write_temp_config(&base_yaml().replace("type: \"memory\"", "type: \"sqlite\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_non_http_gateway_url() {
        let path = write_temp_config(
            &base_yaml().replace("https://api.z-api.io", "ftp://api.z-api.io"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let path = write_temp_config(&format!("{}\nlogging:\n  level: \"loud\"\n", base_yaml()));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn reads_journal_path() {
        let path = write_temp_config(&format!(
            "{}\njournal:\n  failed_events_path: \"./failed.jsonl\"\n",
            base_yaml()
        ));
        let cfg = load_and_validate(&path).expect("journal config should load");
        assert_eq!(
            cfg.journal.failed_events_path.as_deref(),
            Some("./failed.jsonl")
        );
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/example-config.yaml");
        let cfg = load_and_validate(&path.to_string_lossy()).expect("example config should load");
        assert_eq!(cfg.store.kind, "sqlite");
        assert!(cfg.journal.failed_events_path.is_some());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_and_validate("/definitely/not/here.yaml").expect_err("expected error");
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
