//! Application configuration for the oerflow pipeline.
//!
//! User config lives at `~/.oerflow/oerflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "oerflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".oerflow";

// ---------------------------------------------------------------------------
// Config structs (matching oerflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline runtime settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Content-extraction collaborator settings.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Concept-enrichment collaborator settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Validation policy.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Catalog storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[pipeline]` section — runtime knobs for the topology scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Max unacknowledged in-flight records between a producer and a
    /// consumer (bounded channel capacity).
    #[serde(default = "default_backpressure_window")]
    pub backpressure_window: usize,

    /// Concurrent `process` calls within a single stage instance.
    #[serde(default = "default_stage_fan_out")]
    pub stage_fan_out: usize,

    /// Max spout messages awaiting full-DAG acknowledgment.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Bounded teardown wait in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            backpressure_window: default_backpressure_window(),
            stage_fan_out: default_stage_fan_out(),
            max_pending: default_max_pending(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    2000
}
fn default_backpressure_window() -> usize {
    32
}
fn default_stage_fan_out() -> usize {
    1
}
fn default_max_pending() -> usize {
    64
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Endpoint of the content-extraction service.
    #[serde(default = "default_extraction_endpoint")]
    pub endpoint: String,

    /// Bounded timeout per extraction call, in milliseconds.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_extraction_endpoint(),
            timeout_ms: default_collaborator_timeout_ms(),
        }
    }
}

fn default_extraction_endpoint() -> String {
    "http://localhost:8091/extract".into()
}
fn default_collaborator_timeout_ms() -> u64 {
    30_000
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Endpoint of the concept-annotation service.
    #[serde(default = "default_enrichment_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the service user key
    /// (never store the key itself).
    #[serde(default = "default_user_key_env")]
    pub user_key_env: String,

    /// Bounded timeout per annotation call, in milliseconds.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: default_enrichment_endpoint(),
            user_key_env: default_user_key_env(),
            timeout_ms: default_collaborator_timeout_ms(),
        }
    }
}

fn default_enrichment_endpoint() -> String {
    "http://localhost:8092/annotate".into()
}
fn default_user_key_env() -> String {
    "OERFLOW_WIKIFIER_KEY".into()
}

/// `[validation]` section — which fields the validator mandates.
///
/// Title, a 2-letter language code, and a mimetype are always required;
/// these flags control the optional parts of the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Fail records whose extraction produced no text.
    #[serde(default = "default_true")]
    pub require_extracted_content: bool,

    /// Fail records with no license string.
    #[serde(default)]
    pub require_license: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_extracted_content: default_true(),
            require_license: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// How partial-sink write failures surface to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Warn-level log entry only.
    Log,
    /// Error-level log entry, picked up by operator alerting.
    Alert,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Production catalog table.
    #[serde(default = "default_production_table")]
    pub production_table: String,

    /// Staging catalog table.
    #[serde(default = "default_staging_table")]
    pub staging_table: String,

    /// Partial-capture table.
    #[serde(default = "default_partial_table")]
    pub partial_table: String,

    /// Bounded retry attempts for catalog writes.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Base backoff delay between catalog write retries, in milliseconds
    /// (doubles per attempt).
    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,

    /// Consecutive retry-exhausted writes before the sink reports itself
    /// unavailable and spout intake is halted.
    #[serde(default = "default_unavailable_threshold")]
    pub unavailable_threshold: u32,

    /// How partial-sink write failures surface. Deliberately has no
    /// default: the partial sink refuses to start until operators choose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_failure_policy: Option<PartialFailurePolicy>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            production_table: default_production_table(),
            staging_table: default_staging_table(),
            partial_table: default_partial_table(),
            write_attempts: default_write_attempts(),
            write_backoff_ms: default_write_backoff_ms(),
            unavailable_threshold: default_unavailable_threshold(),
            partial_failure_policy: None,
        }
    }
}

fn default_db_path() -> String {
    "var/oerflow.db".into()
}
fn default_production_table() -> String {
    "oer_materials".into()
}
fn default_staging_table() -> String {
    "oer_materials_staging".into()
}
fn default_partial_table() -> String {
    "oer_materials_partial".into()
}
fn default_write_attempts() -> u32 {
    3
}
fn default_write_backoff_ms() -> u64 {
    250
}
fn default_unavailable_threshold() -> u32 {
    3
}

impl StorageConfig {
    /// Resolve the partial-failure policy, erroring if operators have not
    /// chosen one. Called at partial-sink init, so a missing value aborts
    /// topology startup rather than silently picking a behavior.
    pub fn partial_failure_policy(&self) -> Result<PartialFailurePolicy> {
        self.partial_failure_policy.ok_or_else(|| {
            PipelineError::config(
                "storage.partial_failure_policy must be set to \"log\" or \"alert\"",
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.oerflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.oerflow/oerflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does
/// not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the enrichment user key env var is set and non-empty.
pub fn validate_user_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.enrichment.user_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(PipelineError::config(format!(
            "enrichment user key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("heartbeat_ms"));
        assert!(toml_str.contains("oer_materials"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.heartbeat_ms, 2000);
        assert_eq!(parsed.pipeline.stage_fan_out, 1);
        assert_eq!(parsed.storage.write_attempts, 3);
    }

    #[test]
    fn partial_policy_has_no_default() {
        let config = AppConfig::default();
        let result = config.storage.partial_failure_policy();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("partial_failure_policy")
        );
    }

    #[test]
    fn partial_policy_parses() {
        let toml_str = r#"
[storage]
partial_failure_policy = "alert"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(
            config.storage.partial_failure_policy().expect("policy set"),
            PartialFailurePolicy::Alert
        );
    }

    #[test]
    fn pipeline_overrides_parse() {
        let toml_str = r#"
[pipeline]
backpressure_window = 4
max_pending = 2

[validation]
require_extracted_content = false
require_license = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.backpressure_window, 4);
        assert_eq!(config.pipeline.max_pending, 2);
        assert!(!config.validation.require_extracted_content);
        assert!(config.validation.require_license);
    }

    #[test]
    fn user_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.enrichment.user_key_env = "OERFLOW_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_user_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("user key"));
    }
}
