//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Runtime configuration for the scheduler core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Per-run statement budget before a fiber is judged runaway.
    pub max_steps: u32,
    /// Whether fiber run/yield trace events are emitted.
    pub trace_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 128 * 1024,
            trace_enabled: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_steps, 128 * 1024);
        assert!(!config.trace_enabled);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: RuntimeConfig = toml::from_str("max_steps = 64").unwrap();
        assert_eq!(config.max_steps, 64);
        assert!(!config.trace_enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_steps = 1000\ntrace_enabled = true").unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.max_steps, 1000);
        assert!(config.trace_enabled);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/ember.toml")).unwrap_err();
        assert!(err.contains("failed to read"));
    }
}
