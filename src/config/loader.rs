//! Configuration Loader
//!
//! Handles loading and saving engine configuration as YAML.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::validator::validate_config;
use super::EngineConfig;
use crate::error::EngineError;

/// Loads an engine configuration from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Fills in defaults for omitted fields
/// 3. Validates the result
///
/// # Example
///
/// ```rust,no_run
/// use duraflow::config::load_config;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_config("duraflow.yaml")?;
///     println!("{} worker threads", config.total_threads());
///     Ok(())
/// }
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, EngineError> {
    let path = path.as_ref();
    info!("Loading engine configuration from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "Failed to read config file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let config = parse_config(&yaml_content)?;

    info!(
        "Configuration loaded: {} worker queues, {} threads",
        config.workers.len(),
        config.total_threads()
    );

    Ok(config)
}

/// Parses and validates configuration from YAML text.
pub fn parse_config(yaml_content: &str) -> Result<EngineConfig, EngineError> {
    let config: EngineConfig = serde_yaml::from_str(yaml_content)?;
    validate_config(&config).map_err(EngineError::InvalidConfig)?;
    Ok(config)
}

/// Saves a configuration to a YAML file.
pub fn save_config(config: &EngineConfig, path: impl AsRef<Path>) -> Result<(), EngineError> {
    let yaml_content = serde_yaml::to_string(config)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Configuration saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/duraflow.yaml");
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_config_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("duraflow.yaml");

        let yaml_content = r#"
lease_ms: 10000
sweep_interval_ms: 100
workers:
  - task_queue: processor-task-queue
    threads: 4
  - task_queue: accuracy-task-queue
    threads: 1
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.lease_duration, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_millis(100));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].threads, 4);
        assert_eq!(config.total_threads(), 5);
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.yaml");
        fs::write(&config_path, "this is not valid yaml: [[[").unwrap();

        let result = load_config(&config_path);
        assert!(matches!(result, Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn test_parse_config_rejects_invalid_values() {
        let result = parse_config("workers:\n  - task_queue: q\n    threads: 0\n");
        match result {
            Err(EngineError::InvalidConfig(msg)) => assert!(msg.contains("threads")),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("saved.yaml");

        let config = EngineConfig::new()
            .with_worker("ingestion-task-queue", 2)
            .with_state_dir(temp_dir.path().join("state"));
        save_config(&config, &config_path).unwrap();

        let loaded = load_config(&config_path).unwrap();
        assert_eq!(loaded, config);
    }
}
