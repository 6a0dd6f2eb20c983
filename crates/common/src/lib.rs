// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

// OpenVPN Manager - Common Library
// Shared types, configuration records and the configuration catalog

pub mod catalog;
pub mod config;
pub mod error;
pub mod types;

pub use catalog::{
    delete_config, discover_configs, find_config, import_config, system_configs_dirs,
    user_configs_dir,
};
pub use config::VpnConfig;
pub use error::{Error, Result};
pub use types::{
    ConnectionState, ControllerEvent, Credentials, ErrorKind, LogLine, OutputStream,
    PermissionReport, SessionError, SessionSnapshot,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
