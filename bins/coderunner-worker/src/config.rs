// Language configuration for the Docker sandbox
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Sandbox language id, as used by questions (e.g. `python3`).
    pub name: String,
    pub image: String,
    /// Name the program is saved under inside `/code`.
    pub source_filename: String,
    #[serde(default)]
    pub compile_command: Option<String>,
    pub run_command: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
}

fn default_cpu_limit() -> f32 {
    1.0
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone, Default)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.run_command.trim().is_empty() {
                bail!("Language '{}' has an empty run_command", lang.name);
            }
            configs.insert(lang.name.to_lowercase(), lang);
        }

        Ok(Self { configs })
    }

    /// Get configuration for a language, ignoring case
    pub fn get_config(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(&language.to_lowercase())
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "languages": [
            {"name": "python3", "image": "python:3.12-slim", "source_filename": "prog.py",
             "run_command": "python3 prog.py"},
            {"name": "C", "image": "gcc:14", "source_filename": "prog.c",
             "compile_command": "gcc -o prog prog.c", "run_command": "./prog", "cpu_limit": 0.5}
        ]
    }"#;

    #[test]
    fn test_from_json() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        assert_eq!(manager.list_languages(), vec!["c", "python3"]);

        let c = manager.get_config("c").unwrap();
        assert_eq!(c.compile_command.as_deref(), Some("gcc -o prog prog.c"));
        assert_eq!(c.cpu_limit, 0.5);

        let py = manager.get_config("Python3").unwrap();
        assert_eq!(py.compile_command, None);
        assert_eq!(py.cpu_limit, 1.0);
        assert!(manager.get_config("cobol").is_none());
    }

    #[test]
    fn test_empty_run_command_rejected() {
        let bad = r#"{"languages": [{"name": "x", "image": "i", "source_filename": "f", "run_command": " "}]}"#;
        assert!(LanguageConfigManager::from_json(bad).is_err());
    }

    #[test]
    fn test_shipped_config_parses() {
        let manager = LanguageConfigManager::from_json(include_str!("../../../config/languages.json")).unwrap();
        assert!(manager.get_config("python3").is_some());
    }
}
