// Privilege checks for the helper script and permission hardening for our files

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use openvpn_manager_common::PermissionReport;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;

/// Name used when the current user cannot be determined
const USERNAME_PLACEHOLDER: &str = "USERNAME";

/// The sudoers line that allows `user` to run `helper` without a password
pub fn policy_line(user: &str, helper: &Path) -> String {
    format!("{} ALL=(ALL) NOPASSWD: {}", user, helper.display())
}

/// User-facing instructions naming the exact policy line to add
pub fn remediation_text(user: &str, helper: &Path) -> String {
    format!(
        "The helper script {helper} cannot be run with sudo without a password.\n\
         Add the following line to the sudo policy, for example with\n\
         'sudo visudo -f /etc/sudoers.d/openvpn-manager':\n\
         \n    {line}\n",
        helper = helper.display(),
        line = policy_line(user, helper)
    )
}

fn current_username() -> String {
    users::get_current_username()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| USERNAME_PLACEHOLDER.to_string())
}

/// Non-interactive check that the helper may be run with elevated rights
///
/// Runs the probe command (by default `sudo -n -l`) and looks for a
/// `NOPASSWD` rule covering the helper in its listing. The probe never asks
/// for a password. A probe that times out, cannot be started, or exits with
/// an error yields `ok = false`.
#[derive(Debug, Clone)]
pub struct PermissionVerifier {
    probe_command: Vec<String>,
    timeout: Duration,
}

impl PermissionVerifier {
    pub fn new(probe_command: Vec<String>, timeout: Duration) -> Self {
        Self {
            probe_command,
            timeout,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.probe_command.clone(), config.probe_timeout())
    }

    pub async fn check(&self, helper_path: &Path) -> PermissionReport {
        let ok = self.probe(helper_path).await;
        if ok {
            info!("Passwordless sudo rule found for {}", helper_path.display());
        }

        PermissionReport {
            ok,
            helper_path: helper_path.display().to_string(),
            remediation_text: remediation_text(&current_username(), helper_path),
        }
    }

    async fn probe(&self, helper_path: &Path) -> bool {
        let Some((program, args)) = self.probe_command.split_first() else {
            warn!("Permission probe command is empty");
            return false;
        };

        let child = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Permission probe '{}' could not be started: {}", program, e);
                return false;
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Permission probe '{}' failed: {}", program, e);
                return false;
            }
            Err(_) => {
                warn!(
                    "Permission probe '{}' timed out after {}ms",
                    program,
                    self.timeout.as_millis()
                );
                return false;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("a password is required") {
                debug!("sudo requires a password to list privileges");
            } else {
                debug!("Permission probe exited with {}: {}", output.status, stderr.trim());
            }
            return false;
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        listing_allows(&listing, &helper_path.display().to_string())
    }
}

/// Whether a `sudo -l` listing grants passwordless execution of `helper`
///
/// Only rule lines (those starting with a runas list) are considered, and
/// only when the runas users include `root` or `ALL`, since the helper is
/// run as root. Runas lists and tags carry over to later commands of the same
/// comma-separated list until another one replaces them.
pub fn listing_allows(listing: &str, helper: &str) -> bool {
    listing.lines().any(|line| {
        let line = line.trim();
        if !line.starts_with('(') {
            return false;
        }

        let mut as_root = false;
        let mut passwordless = false;
        for entry in split_commands(line) {
            let mut entry = entry.trim();

            // "(root) NOPASSWD: SETENV: /path"
            loop {
                if let Some(inner) = entry.strip_prefix('(') {
                    let Some(end) = inner.find(')') else {
                        return false;
                    };
                    as_root = runas_includes_root(&inner[..end]);
                    entry = inner[end + 1..].trim_start();
                    continue;
                }
                let Some((tag, rest)) = entry.split_once(':') else {
                    break;
                };
                if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                    break;
                }
                match tag {
                    "NOPASSWD" => passwordless = true,
                    "PASSWD" => passwordless = false,
                    _ => {}
                }
                entry = rest.trim_start();
            }

            let command = entry.split_whitespace().next().unwrap_or("");
            if as_root && passwordless && (command == "ALL" || command == helper) {
                return true;
            }
        }
        false
    })
}

/// "root", "ALL", "ALL : ALL", "alice, root : wheel"
fn runas_includes_root(runas: &str) -> bool {
    let users = runas.split(':').next().unwrap_or("");
    users
        .split(',')
        .map(str::trim)
        .any(|user| user == "ALL" || user == "root")
}

/// Split on commas outside of runas parentheses
fn split_commands(line: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                entries.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&line[start..]);
    entries
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)
        .context(format!("Failed to set permissions on {}", path.display()))?;
    debug!("Set file permissions to 0600: {}", path.display());
    Ok(())
}
