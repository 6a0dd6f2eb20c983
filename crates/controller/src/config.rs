// OpenVPN Manager - Controller Config Module
// Handles controller configuration (helper invocation, timeouts, buffers, markers)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::{Marker, MarkerTable};
use crate::helper::HelperInvocation;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Absolute path to the privileged helper script
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,

    /// Command prefix used to run the helper with elevated rights
    /// Empty runs the helper directly (useful when already privileged)
    #[serde(default = "default_elevate_command")]
    pub elevate_command: Vec<String>,

    /// Non-interactive privilege listing used by the permission check
    #[serde(default = "default_probe_command")]
    pub probe_command: Vec<String>,

    /// Upper bound for the permission probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long to wait for credentials once the VPN client prompts
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Number of stderr lines kept for exit diagnostics
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    /// Capacity of the output queue between the pipe readers and the session
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,

    /// Longer output lines are truncated
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Per-session log file; an empty path (`log_file = ""`) disables it
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Directories searched for .ovpn/.conf files, in priority order
    #[serde(default = "default_config_dirs")]
    pub config_dirs: Vec<PathBuf>,

    /// Extra output markers appended to the built-in table
    #[serde(default)]
    pub markers: Vec<Marker>,
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/openvpn-gui-helper.sh")
}

fn default_elevate_command() -> Vec<String> {
    vec!["sudo".to_string(), "-n".to_string()]
}

fn default_probe_command() -> Vec<String> {
    vec!["sudo".to_string(), "-n".to_string(), "-l".to_string()]
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_auth_timeout_ms() -> u64 {
    120_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_stderr_tail_lines() -> usize {
    20
}

fn default_output_buffer_lines() -> usize {
    256
}

fn default_max_line_length() -> usize {
    4096
}

fn default_log_file() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("openvpn-manager").join("openvpn.log"))
        .unwrap_or_default()
}

fn default_config_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(user_dir) = openvpn_manager_common::user_configs_dir() {
        dirs.push(user_dir);
    }
    dirs.extend(openvpn_manager_common::system_configs_dirs());
    dirs
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            helper_path: default_helper_path(),
            elevate_command: default_elevate_command(),
            probe_command: default_probe_command(),
            probe_timeout_ms: default_probe_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
            output_buffer_lines: default_output_buffer_lines(),
            max_line_length: default_max_line_length(),
            log_file: default_log_file(),
            config_dirs: default_config_dirs(),
            markers: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Validate the controller configuration
    pub fn validate(&self) -> Result<()> {
        if !self.helper_path.is_absolute() {
            anyhow::bail!(
                "helper_path must be absolute (got {}). The privilege policy line \
                 names the helper by its full path.",
                self.helper_path.display()
            );
        }
        if self.probe_command.is_empty() {
            anyhow::bail!("probe_command cannot be empty");
        }
        if self.probe_timeout_ms == 0 || self.auth_timeout_ms == 0 || self.stop_grace_ms == 0 {
            anyhow::bail!("Timeouts must be greater than 0");
        }
        if self.output_buffer_lines == 0 || self.max_line_length == 0 {
            anyhow::bail!("output_buffer_lines and max_line_length must be greater than 0");
        }
        if self.markers.iter().any(|m| m.pattern.is_empty()) {
            anyhow::bail!("Marker patterns cannot be empty");
        }

        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Built-in marker table extended with the configured markers
    pub fn marker_table(&self) -> MarkerTable {
        let mut table = MarkerTable::default();
        for marker in &self.markers {
            table.push(marker.clone());
        }
        table
    }

    /// The session log file, unless logging to a file is switched off
    pub fn session_log(&self) -> Option<&Path> {
        Some(self.log_file.as_path()).filter(|path| !path.as_os_str().is_empty())
    }

    pub fn helper(&self) -> HelperInvocation {
        HelperInvocation::new(self.elevate_command.clone(), self.helper_path.clone())
    }

    /// Load controller configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No controller configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load and validate a configuration file at an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .context("Failed to read controller configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse controller configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded controller configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save controller configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize controller configuration")?;

        fs::write(&config_path, contents)
            .context("Failed to write controller configuration")?;

        crate::permissions::set_file_permissions_private(&config_path)?;

        info!("Saved controller configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the controller configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("openvpn-manager").join("controller.toml"))
    }
}
