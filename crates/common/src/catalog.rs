// OpenVPN Manager - Configuration Catalog
// Discovery, import and deletion of .ovpn/.conf files

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{has_config_extension, VpnConfig};
use crate::error::{Error, Result};

/// Get the per-user configuration directory
pub fn user_configs_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("openvpn-manager").join("configs"))
}

/// System-wide directories searched after the user directory
pub fn system_configs_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/openvpn/client"),
        PathBuf::from("/etc/openvpn"),
    ]
}

/// Discover configurations in the given directories
///
/// Directories are searched in order and the id (file stem) is unique in the
/// result: when two files share an id, the one in the earlier directory wins,
/// and within one directory the file name that sorts first wins. The result
/// is sorted by name.
pub fn discover_configs(dirs: &[PathBuf]) -> Result<Vec<VpnConfig>> {
    let mut seen = HashSet::new();
    let mut configs = Vec::new();

    for dir in dirs {
        if !dir.is_dir() {
            debug!("Config directory does not exist: {}", dir.display());
            continue;
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read config directory {}: {}", dir.display(), e);
                continue;
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && has_config_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match VpnConfig::from_path(&path) {
                Ok(config) => {
                    if seen.insert(config.id.clone()) {
                        configs.push(config);
                    } else {
                        debug!("{} is shadowed by an earlier '{}'", path.display(), config.id);
                    }
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    configs.sort_by(|a, b| a.name.cmp(&b.name));
    info!("{} VPN configurations found", configs.len());
    Ok(configs)
}

/// Find a configuration by id
pub fn find_config(dirs: &[PathBuf], id: &str) -> Result<VpnConfig> {
    discover_configs(dirs)?
        .into_iter()
        .find(|config| config.id == id)
        .ok_or_else(|| Error::ConfigNotFound(id.to_string()))
}

/// Copy a configuration file into the user directory
pub fn import_config(source: &Path, user_dir: &Path) -> Result<VpnConfig> {
    if !source.is_file() {
        return Err(Error::ConfigNotFound(source.display().to_string()));
    }

    let file_name = source
        .file_name()
        .ok_or_else(|| Error::InvalidPath(source.display().to_string()))?;
    let destination = user_dir.join(file_name);
    // Validate the name before touching the filesystem
    let config = VpnConfig::from_path(&destination)?;

    if destination.exists() {
        return Err(Error::ConfigExists(config.name));
    }

    fs::create_dir_all(user_dir)?;
    fs::copy(source, &destination)?;

    info!(
        "Configuration imported from '{}' to '{}'",
        source.display(),
        destination.display()
    );
    Ok(config)
}

/// Delete a configuration file from the user directory
///
/// Files outside `user_dir` are never deleted. A file that is already gone
/// is not an error.
pub fn delete_config(config: &VpnConfig, user_dir: &Path) -> Result<()> {
    let parent = config
        .path
        .parent()
        .ok_or_else(|| Error::InvalidPath(config.path.display().to_string()))?;

    let same_dir = match (parent.canonicalize(), user_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => parent == user_dir,
    };
    if !same_dir {
        warn!("Attempt to delete non-user config denied: {}", config.path.display());
        return Err(Error::PermissionDenied(
            "Only configurations in the user directory can be deleted".to_string(),
        ));
    }

    match fs::remove_file(&config.path) {
        Ok(()) => {
            info!("Configuration deleted: {}", config.path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Config to be deleted was not found (already deleted?): {}",
                config.path.display()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
