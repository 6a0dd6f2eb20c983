// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

// OpenVPN Manager - Connection Controller
// Supervises the privileged OpenVPN helper and drives the connection state

pub mod classifier;
pub mod codec;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod helper;
pub mod machine;
pub mod permissions;
pub mod sink;
pub mod supervisor;

pub use classifier::{Classification, Marker, MarkerKind, MarkerTable};
pub use config::ControllerConfig;
pub use controller::{ConnectRequest, ConnectionController, ControllerError, SessionOutcome};
pub use credentials::{CredentialStore, DeleteOutcome, KeyringStore, MemoryStore, StoreError};
pub use permissions::PermissionVerifier;
pub use supervisor::{ExitStatus, ProcessHandle, ProcessSupervisor, SupervisorError};
