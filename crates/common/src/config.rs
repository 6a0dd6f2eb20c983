// VPN configuration records

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Extensions recognised as OpenVPN client configurations
pub const CONFIG_EXTENSIONS: [&str; 2] = ["ovpn", "conf"];

/// An OpenVPN client configuration file
///
/// The controller treats it as a read-only reference: only the catalog
/// imports or deletes the underlying file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VpnConfig {
    /// Stable identifier, the file stem ("work" for `work.ovpn`)
    pub id: String,
    /// Display name, the file name
    pub name: String,
    /// Absolute path to the configuration file
    pub path: PathBuf,
}

impl VpnConfig {
    /// Build a configuration record from a file path
    pub fn from_path(path: &Path) -> Result<Self> {
        if !has_config_extension(path) {
            return Err(Error::InvalidPath(format!(
                "{} is not an .ovpn or .conf file",
                path.display()
            )));
        }

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
            .to_string();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
            .to_string();

        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        Ok(Self { id, name, path })
    }
}

pub fn has_config_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| CONFIG_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
