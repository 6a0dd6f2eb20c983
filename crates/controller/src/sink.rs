// Session log file: one file per session, truncated on connect

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use openvpn_manager_common::OutputStream;
use tracing::{debug, warn};

pub const LOG_BANNER: &str = "--- Log started ---";

/// Appends timestamped VPN client output to a private (0600) file
#[derive(Debug)]
pub struct FileLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    failed: bool,
}

impl FileLogSink {
    /// Truncate `path` and write the session banner
    pub fn create(path: &Path, config_name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        // mode() only applies when the file is created
        crate::permissions::set_file_permissions_private(path)?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", LOG_BANNER)?;
        writeln!(
            writer,
            "[{}] Connecting with {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            config_name
        )?;
        writer.flush()?;

        debug!("Writing session log to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line; after the first failure the sink goes quiet
    pub fn write_line(&mut self, stream: OutputStream, line: &str) {
        if self.failed {
            return;
        }
        let prefix = match stream {
            OutputStream::Stdout => "",
            OutputStream::Stderr => "stderr: ",
        };
        let result = writeln!(
            self.writer,
            "[{}] {}{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            prefix,
            line
        )
        .and_then(|_| self.writer.flush());

        if let Err(e) = result {
            warn!("Disabling session log {}: {}", self.path.display(), e);
            self.failed = true;
        }
    }
}
