//! Layered YAML configuration loading: later files deep-merge over earlier
//! ones, the merged document is canonicalised (sorted keys, compact JSON)
//! and hashed, then deserialised into [`Config`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Load + merge YAML files in order, then canonicalise to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value = serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("failed to parse configuration into the typed schema: {0}")]
    Parse(String),
}

/// Top-level replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Auto-generated when omitted.
    #[serde(default)]
    pub server_id: Option<u32>,
    #[serde(default)]
    pub gtid_mode: bool,
    pub source: SourceConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            listen_addr: default_listen_addr(),
            data_file: default_data_file(),
            plugin_dir: default_plugin_dir(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_seconds_behind_master")]
    pub seconds_behind_master: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            seconds_behind_master: default_health_seconds_behind_master(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub syslog_enabled: bool,
    #[serde(default)]
    pub file_enabled: bool,
    #[serde(default = "default_log_filename")]
    pub file_name: String,
    #[serde(default = "default_log_file_max_size")]
    pub file_max_size: u32,
    #[serde(default = "default_log_file_max_backups")]
    pub file_max_backups: u32,
    #[serde(default = "default_log_file_max_age")]
    pub file_max_age: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            syslog_enabled: false,
            file_enabled: false,
            file_name: default_log_filename(),
            file_max_size: default_log_file_max_size(),
            file_max_backups: default_log_file_max_backups(),
            file_max_age: default_log_file_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    #[serde(default)]
    pub extra_options: Vec<String>,
    #[serde(default)]
    pub exec_path: String,
    #[serde(default = "default_load_in_file_flush_threshold")]
    pub load_in_file_flush_threshold: u32,
    #[serde(default)]
    pub load_in_file_enabled: bool,
    #[serde(default)]
    pub skip_master_data: bool,
    #[serde(default = "default_arg_enclose")]
    pub arg_enclose: String,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            extra_options: Vec::new(),
            exec_path: String::new(),
            load_in_file_flush_threshold: default_load_in_file_flush_threshold(),
            load_in_file_enabled: false,
            skip_master_data: false,
            arg_enclose: default_arg_enclose(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub dump: DumpConfig,
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub source: RuleSourceConfig,
    pub upstream: RuleUpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSourceConfig {
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleUpstreamConfig {
    pub plugin: PluginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

fn default_listen_addr() -> String {
    ":8080".into()
}
fn default_data_file() -> String {
    "/etc/mymy/state.info".into()
}
fn default_plugin_dir() -> String {
    "plugins".into()
}
fn default_health_seconds_behind_master() -> u32 {
    10
}
fn default_log_level() -> String {
    "debug".into()
}
fn default_log_filename() -> String {
    "/var/log/mymy.log".into()
}
fn default_log_file_max_size() -> u32 {
    256
}
fn default_log_file_max_backups() -> u32 {
    3
}
fn default_log_file_max_age() -> u32 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_charset() -> String {
    "utf8mb4".into()
}
fn default_max_open_conns() -> u32 {
    200
}
fn default_max_idle_conns() -> u32 {
    200
}
fn default_connect_timeout_secs() -> u64 {
    1
}
fn default_write_timeout_secs() -> u64 {
    1
}
fn default_load_in_file_flush_threshold() -> u32 {
    5000
}
fn default_arg_enclose() -> String {
    "\"".into()
}

/// Load a single config file (no layering) and deserialise it into the
/// typed [`Config`] schema — the common case for a daemon started with
/// `--config`.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path_str = path.as_ref().to_string_lossy().into_owned();
    let loaded = load_layered_yaml(&[&path_str]).map_err(|e| ConfigError::Load(e.to_string()))?;
    serde_json::from_value(loaded.config_json).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load and deep-merge several config files (e.g. a base file plus an
/// environment overlay), then deserialise the merged document.
pub fn load_layered_config(paths: &[&str]) -> Result<Config, ConfigError> {
    let loaded = load_layered_yaml(paths).map_err(|e| ConfigError::Load(e.to_string()))?;
    serde_json::from_value(loaded.config_json).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn deep_merge_overrides_later_files() {
        let base = write_temp_yaml(
            "app:\n  listen_addr: \":8080\"\nreplication:\n  source:\n    addr: \"base:3306\"\n    user: u\n    password: p\n    database: db\n  upstream:\n    addr: \"up:3306\"\n    user: u\n    password: p\n    database: db\n",
        );
        let overlay = write_temp_yaml("replication:\n  source:\n    addr: \"override:3306\"\n");

        let base_path = base.path().to_string_lossy().into_owned();
        let overlay_path = overlay.path().to_string_lossy().into_owned();
        let cfg = load_layered_config(&[&base_path, &overlay_path]).unwrap();

        assert_eq!(cfg.replication.source.addr, "override:3306");
        assert_eq!(cfg.app.listen_addr, ":8080");
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let file = write_temp_yaml(
            "replication:\n  source:\n    addr: \"a:3306\"\n    user: u\n    password: p\n    database: db\n  upstream:\n    addr: \"b:3306\"\n    user: u\n    password: p\n    database: db\n",
        );
        let path = file.path().to_string_lossy().into_owned();
        let cfg = load_config_file(&path).unwrap();

        assert_eq!(cfg.app.data_file, "/etc/mymy/state.info");
        assert_eq!(cfg.replication.upstream.max_retries, 5);
        assert_eq!(cfg.replication.source.charset, "utf8mb4");
        assert!(!cfg.replication.gtid_mode);
    }

    #[test]
    fn canonical_hash_is_stable_across_key_order() {
        let a = write_temp_yaml("b: 2\na: 1\n");
        let b = write_temp_yaml("a: 1\nb: 2\n");
        let a_path = a.path().to_string_lossy().into_owned();
        let b_path = b.path().to_string_lossy().into_owned();

        let loaded_a = load_layered_yaml(&[&a_path]).unwrap();
        let loaded_b = load_layered_yaml(&[&b_path]).unwrap();
        assert_eq!(loaded_a.config_hash, loaded_b.config_hash);
    }
}
