//! Configuration management for labsim.
//!
//! This module handles loading and saving the settings for remote lab hosts,
//! the lifecycle tool, container routing and session pooling.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/labsim/config.yml`
//! - macOS: `~/Library/Application Support/labsim/config.yml`
//! - Windows: `C:\Users\<User>\AppData\Roaming\labsim\config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! remotes:
//!   workstation:
//!     host: "workstation.lab.example.com"
//!     user: "student"
//!     port: 22
//!     ssh_key: "~/.ssh/lab_rsa"
//! defaults:
//!   remote: workstation
//! lab:
//!   binary: "lab"
//!   lifecycle_timeout: 600
//!   command_timeout: 120
//! container:
//!   enabled: true
//!   runtime: "podman"
//!   fallback_image_patterns: ["ee-supported", "ee-minimal"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default SSH port
const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH connection timeout in seconds
const DEFAULT_TIMEOUT: u64 = 30;

/// Default timeout for start/grade/finish/solve in seconds
const DEFAULT_LIFECYCLE_TIMEOUT: u64 = 600;

/// Default timeout for a single instruction command in seconds
const DEFAULT_COMMAND_TIMEOUT: u64 = 120;

/// Main configuration structure for labsim.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Lab hosts reachable over SSH
    #[serde(default)]
    pub remotes: HashMap<String, RemoteConfig>,

    /// Default settings that apply when not overridden
    #[serde(default)]
    pub defaults: DefaultSettings,

    #[serde(default)]
    pub lab: LabSettings,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default)]
    pub pool: PoolConfig,
}

/// Configuration for a remote lab host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Hostname or IP address of the lab workstation
    pub host: String,

    /// SSH username for authentication
    pub user: String,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Path to SSH private key file (optional, falls back to the agent)
    pub ssh_key: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Default settings for the application.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefaultSettings {
    /// Remote used when none is named on the command line
    pub remote: Option<String>,
}

/// Settings for the remote lifecycle tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSettings {
    /// Name or path of the lifecycle CLI on the lab host
    #[serde(default = "default_lab_binary")]
    pub binary: String,

    /// Timeout for start/grade/finish/solve, in seconds
    #[serde(default = "default_lifecycle_timeout")]
    pub lifecycle_timeout: u64,

    /// Timeout for each instruction command, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Literal passwords that appear as typed tokens in exercise prose
    #[serde(default = "default_known_passwords")]
    pub known_passwords: Vec<String>,

    /// Issue the solve verb before grading with solution
    #[serde(default)]
    pub solve_before_grade: bool,
}

/// Settings for container-scoped execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Container runtime CLI on the lab host
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Directory on the lab host holding one working directory per exercise
    #[serde(default = "default_exercise_root")]
    pub exercise_root: String,

    /// Manifest location relative to the exercise working directory
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Working directory inside the container when the manifest names none
    #[serde(default = "default_workdir")]
    pub default_workdir: String,

    /// Substrings tried in order against cached images when a pull fails
    #[serde(default = "default_fallback_patterns")]
    pub fallback_image_patterns: Vec<String>,

    /// Credential material bind-mounted into every container
    #[serde(default = "default_credential_mounts")]
    pub credential_mounts: Vec<MountSpec>,
}

/// A bind mount from the lab host into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub options: Option<String>,
}

/// Configuration for the session pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live sessions per pool
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

fn default_lab_binary() -> String {
    "lab".to_string()
}

fn default_lifecycle_timeout() -> u64 {
    DEFAULT_LIFECYCLE_TIMEOUT
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_known_passwords() -> Vec<String> {
    ["redhat", "student", "redhat123", "Redhat123@"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_runtime() -> String {
    "podman".to_string()
}

fn default_exercise_root() -> String {
    "~".to_string()
}

fn default_manifest_path() -> String {
    ".devcontainer/devcontainer.json".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_fallback_patterns() -> Vec<String> {
    ["ee-supported", "ee-minimal", "creator-ee"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_credential_mounts() -> Vec<MountSpec> {
    vec![MountSpec {
        host: "~/.ssh".to_string(),
        container: "/home/runner/.ssh".to_string(),
        options: Some("ro".to_string()),
    }]
}

fn default_max_sessions() -> usize {
    4
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            binary: default_lab_binary(),
            lifecycle_timeout: DEFAULT_LIFECYCLE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            known_passwords: default_known_passwords(),
            solve_before_grade: false,
        }
    }
}

impl LabSettings {
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime: default_runtime(),
            exercise_root: default_exercise_root(),
            manifest_path: default_manifest_path(),
            default_workdir: default_workdir(),
            fallback_image_patterns: default_fallback_patterns(),
            credential_mounts: default_credential_mounts(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

impl Config {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("labsim").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(Config::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(Config::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read config file: {}\n\n\
                     File path: {}\n\n\
                     Suggestions:\n\
                     • Check file permissions: ls -la {}\n\
                     • Verify the file is readable",
                    e,
                    path.display(),
                    path.display()
                ),
            ))
        })?;

        Self::from_yaml(&contents).map_err(|e| {
            Error::Config(format!(
                "{}\n\n\
                 File path: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs\n\n\
                 Example valid config:\n\
                 remotes:\n\
                   workstation:\n\
                     host: \"workstation.lab.example.com\"\n\
                     user: \"student\"",
                e,
                path.display()
            ))
        })
    }

    /// Parses configuration from YAML text and validates it.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        for (name, remote) in &self.remotes {
            if remote.host.trim().is_empty() {
                return Err(Error::Config(format!("remote '{}' has an empty host", name)));
            }
            if remote.user.trim().is_empty() {
                return Err(Error::Config(format!("remote '{}' has an empty user", name)));
            }
        }
        if let Some(default) = &self.defaults.remote {
            if !self.remotes.contains_key(default) {
                return Err(Error::Config(format!(
                    "default remote '{}' is not defined under remotes",
                    default
                )));
            }
        }
        if self.lab.binary.trim().is_empty() {
            return Err(Error::Config("lab.binary must not be empty".to_string()));
        }
        if self.lab.lifecycle_timeout == 0 || self.lab.command_timeout == 0 {
            return Err(Error::Config("lab timeouts must be positive".to_string()));
        }
        if self.pool.max_sessions == 0 {
            return Err(Error::Config("pool.max_sessions must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Saves configuration to a specific file path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create config directory: {}\n\n\
                         Directory: {}\n\n\
                         Suggestions:\n\
                         • Check write permissions for parent directory\n\
                         • Create directory manually: mkdir -p {}",
                        e,
                        parent.display(),
                        parent.display()
                    ),
                ))
            })?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("Could not determine configuration directory".to_string()))?;
        self.save_to(&path)
    }

    /// Removes a remote configuration by name.
    pub fn remove_remote(&mut self, name: &str) -> Option<RemoteConfig> {
        let removed = self.remotes.remove(name);
        if removed.is_some() && self.defaults.remote.as_deref() == Some(name) {
            self.defaults.remote = None;
        }
        removed
    }

    /// Gets a remote configuration by name.
    pub fn get_remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.get(name)
    }

    /// Adds or updates a remote configuration.
    pub fn set_remote(&mut self, name: String, config: RemoteConfig) {
        self.remotes.insert(name, config);
    }

    /// Picks the named remote, or the configured default when no name is given.
    pub fn resolve_remote(&self, name: Option<&str>) -> Result<&RemoteConfig> {
        let name = match name.or(self.defaults.remote.as_deref()) {
            Some(n) => n,
            None if self.remotes.len() == 1 => {
                return self
                    .remotes
                    .values()
                    .next()
                    .ok_or_else(|| Error::Config("no remotes configured".to_string()));
            }
            None => {
                return Err(Error::Config(
                    "no remote named and no default remote configured\n\n\
                     Suggestions:\n\
                     • Pass --remote <name>\n\
                     • Set defaults.remote in the config file"
                        .to_string(),
                ))
            }
        };
        self.get_remote(name)
            .ok_or_else(|| Error::Config(format!("remote '{}' is not configured", name)))
    }
}

impl RemoteConfig {
    /// Creates a new remote configuration with required fields.
    pub fn new(host: String, user: String) -> Self {
        Self {
            host,
            user,
            port: DEFAULT_SSH_PORT,
            ssh_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builder method to set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder method to set the SSH key path.
    pub fn with_ssh_key(mut self, key_path: String) -> Self {
        self.ssh_key = Some(key_path);
        self
    }

    /// Builder method to set the timeout.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the SSH connection string (user@host:port).
    pub fn connection_string(&self) -> String {
        if self.port == DEFAULT_SSH_PORT {
            format!("{}@{}", self.user, self.host)
        } else {
            format!("{}@{}:{}", self.user, self.host, self.port)
        }
    }

    /// Expands the SSH key path, replacing ~ with the home directory.
    pub fn expanded_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_key.as_ref().map(|key| {
            if let Some(stripped) = key.strip_prefix("~/") {
                if let Some(home) = dirs::home_dir() {
                    return home.join(stripped);
                }
            }
            PathBuf::from(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.remotes.is_empty());
        assert_eq!(config.lab.binary, "lab");
        assert_eq!(config.lab.command_timeout(), Duration::from_secs(120));
        assert_eq!(config.lab.lifecycle_timeout(), Duration::from_secs(600));
        assert!(!config.container.enabled);
        assert_eq!(config.pool.max_sessions, 4);
    }

    #[test]
    fn test_remote_config_builder() {
        let remote = RemoteConfig::new("lab.example.com".to_string(), "student".to_string())
            .with_port(2222)
            .with_ssh_key("~/.ssh/lab_rsa".to_string())
            .with_timeout(90);

        assert_eq!(remote.port, 2222);
        assert_eq!(remote.ssh_key, Some("~/.ssh/lab_rsa".to_string()));
        assert_eq!(remote.timeout, 90);
    }

    #[test]
    fn test_connection_string() {
        let remote = RemoteConfig::new("lab.example.com".to_string(), "student".to_string());
        assert_eq!(remote.connection_string(), "student@lab.example.com");

        let remote_custom_port = remote.with_port(2222);
        assert_eq!(
            remote_custom_port.connection_string(),
            "student@lab.example.com:2222"
        );
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
remotes:
  workstation:
    host: "workstation.lab.example.com"
    user: "student"
lab:
  command_timeout: 30
container:
  enabled: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let remote = config.get_remote("workstation").unwrap();
        assert_eq!(remote.port, 22);
        assert_eq!(config.lab.command_timeout, 30);
        assert_eq!(config.lab.lifecycle_timeout, 600);
        assert!(config.container.enabled);
        assert_eq!(config.container.runtime, "podman");
        assert_eq!(config.container.credential_mounts.len(), 1);
    }

    #[test]
    fn test_validation_rejects_unknown_default_remote() {
        let yaml = r#"
defaults:
  remote: missing
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = Config::default();
        config.lab.command_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_remote() {
        let mut config = Config::default();
        assert!(config.resolve_remote(None).is_err());

        config.set_remote(
            "ws".to_string(),
            RemoteConfig::new("ws.example.com".to_string(), "student".to_string()),
        );
        assert_eq!(config.resolve_remote(None).unwrap().host, "ws.example.com");
        assert!(config.resolve_remote(Some("other")).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yml");

        let mut config = Config::default();
        config.set_remote(
            "ws".to_string(),
            RemoteConfig::new("ws.example.com".to_string(), "student".to_string()),
        );
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.get_remote("ws"), config.get_remote("ws"));
    }

    #[test]
    fn test_load_missing_file_gives_default() {
        let config = Config::load_from(Path::new("/nonexistent/labsim/config.yml")).unwrap();
        assert!(config.remotes.is_empty());
    }
}
