// Application configuration shared by the worker, API and CLI.
// Values come from the environment; binaries call dotenvy first so a .env
// file works in development.

use crate::outcome::TruncationLimits;
use crate::types::SandboxLimits;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },

    #[error("Unknown sandbox '{0}' (expected 'jobe' or 'docker')")]
    UnknownSandbox(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Jobe,
    Docker,
}

impl FromStr for SandboxKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jobe" | "jobesandbox" => Ok(SandboxKind::Jobe),
            "docker" => Ok(SandboxKind::Docker),
            other => Err(ConfigError::UnknownSandbox(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub sandbox: SandboxKind,
    pub jobe_servers: Vec<String>,
    pub jobe_api_key: Option<String>,
    pub languages_config: String,
    pub truncation: TruncationLimits,
    pub default_limits: SandboxLimits,
    pub api_bind_addr: String,
    pub result_ttl_secs: u64,
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        _ => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Split a `;`-separated server list, dropping blanks.
pub fn parse_servers(hosts: &str) -> Vec<String> {
    hosts
        .split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sandbox = env_string("SANDBOX", "jobe").parse()?;
        let mut jobe_servers = parse_servers(&env_string("JOBE_HOST", "localhost"));
        if jobe_servers.is_empty() {
            jobe_servers.push("localhost".to_string());
        }

        Ok(Self {
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            sandbox,
            jobe_servers,
            jobe_api_key: std::env::var("JOBE_API_KEY").ok().filter(|k| !k.is_empty()),
            languages_config: env_string("LANGUAGES_CONFIG", "config/languages.json"),
            truncation: TruncationLimits {
                max_lines: env_or("RESULT_MAX_LINES", 100)?,
                max_line_length: env_or("RESULT_MAX_LINE_LENGTH", 200)?,
            },
            default_limits: SandboxLimits {
                cpu_time_secs: Some(env_or("DEFAULT_CPU_TIME_SECS", 3.0)?),
                wall_time_secs: Some(env_or("DEFAULT_WALL_TIME_SECS", 30.0)?),
                memory_mb: Some(env_or("DEFAULT_MEMORY_MB", 64)?),
                disk_kb: Some(env_or("DEFAULT_DISK_KB", 10240)?),
                max_processes: Some(env_or("DEFAULT_MAX_PROCESSES", 20)?),
            },
            api_bind_addr: env_string("API_BIND_ADDR", "0.0.0.0:3000"),
            result_ttl_secs: env_or("RESULT_TTL_SECS", 86400)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_servers() {
        assert_eq!(parse_servers("a.example; b.example;;"), vec!["a.example", "b.example"]);
        assert!(parse_servers(" ").is_empty());
    }

    #[test]
    fn test_sandbox_kind() {
        assert_eq!("Jobe".parse::<SandboxKind>().unwrap(), SandboxKind::Jobe);
        assert_eq!("docker".parse::<SandboxKind>().unwrap(), SandboxKind::Docker);
        assert_eq!(
            "firejail".parse::<SandboxKind>(),
            Err(ConfigError::UnknownSandbox("firejail".to_string()))
        );
    }

    #[test]
    fn test_env_or_reports_bad_values() {
        std::env::set_var("CODERUNNER_TEST_BAD_NUMBER", "lots");
        let err = env_or::<u64>("CODERUNNER_TEST_BAD_NUMBER", 1).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "CODERUNNER_TEST_BAD_NUMBER",
                value: "lots".to_string()
            }
        );
        assert_eq!(env_or::<u64>("CODERUNNER_TEST_UNSET_NUMBER", 7).unwrap(), 7);
    }
}
