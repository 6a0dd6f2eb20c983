// Command lines for the privileged helper script

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// How the helper is invoked: `[elevate...] helper <subcommand> <arg>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperInvocation {
    elevate: Vec<String>,
    helper_path: PathBuf,
}

impl HelperInvocation {
    pub fn new(elevate: Vec<String>, helper_path: PathBuf) -> Self {
        Self {
            elevate,
            helper_path,
        }
    }

    pub fn helper_path(&self) -> &Path {
        &self.helper_path
    }

    /// Program and arguments for `helper <subcommand> <arg>`
    pub fn command(&self, subcommand: &str, arg: &str) -> (String, Vec<String>) {
        let helper = self.helper_path.display().to_string();
        let mut args: Vec<String> = Vec::with_capacity(self.elevate.len() + 2);

        let program = match self.elevate.split_first() {
            Some((program, rest)) => {
                args.extend(rest.iter().cloned());
                args.push(helper);
                program.clone()
            }
            None => helper,
        };
        args.push(subcommand.to_string());
        args.push(arg.to_string());

        (program, args)
    }

    pub fn start_command(&self, config_path: &Path) -> (String, Vec<String>) {
        self.command("start", &config_path.display().to_string())
    }

    pub fn stop_command(&self, pid: u32) -> (String, Vec<String>) {
        self.command("stop", &pid.to_string())
    }

    /// Ask the helper to stop the VPN client it started, bounded by `timeout`
    ///
    /// Best effort: failures are logged, the caller still signals the process.
    pub async fn request_stop(&self, pid: u32, timeout: Duration) -> bool {
        let (program, args) = self.stop_command(pid);
        debug!("Running helper stop: {} {:?}", program, args);

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to run helper stop: {}", e);
                return false;
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                warn!(
                    "Helper stop exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Ok(Err(e)) => {
                warn!("Helper stop failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Helper stop timed out after {}ms", timeout.as_millis());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_start_command() {
        let helper = HelperInvocation::new(
            vec!["sudo".to_string(), "-n".to_string()],
            PathBuf::from("/usr/local/bin/openvpn-gui-helper.sh"),
        );
        let (program, args) = helper.start_command(Path::new("/home/a/work.ovpn"));
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            vec!["-n", "/usr/local/bin/openvpn-gui-helper.sh", "start", "/home/a/work.ovpn"]
        );
    }

    #[test]
    fn test_direct_stop_command() {
        let helper = HelperInvocation::new(Vec::new(), PathBuf::from("/opt/helper.sh"));
        let (program, args) = helper.stop_command(4242);
        assert_eq!(program, "/opt/helper.sh");
        assert_eq!(args, vec!["stop", "4242"]);
    }

    #[tokio::test]
    async fn test_request_stop_missing_helper() {
        let helper = HelperInvocation::new(Vec::new(), PathBuf::from("/nonexistent/helper.sh"));
        assert!(!helper.request_stop(1, Duration::from_secs(1)).await);
    }
}
