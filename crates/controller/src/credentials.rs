// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

//! Credential storage in the system secret store
//!
//! Errors from this module carry only the configuration id and an error
//! kind, never a username or password.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openvpn_manager_common::Credentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Keyring service name; the configuration id is the account
pub const KEYRING_SERVICE: &str = "openvpn-manager";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Secret store unavailable (config '{config_id}')")]
    Unavailable { config_id: String },

    #[error("Stored credentials for '{config_id}' are malformed")]
    Malformed { config_id: String },
}

impl StoreError {
    pub fn config_id(&self) -> &str {
        match self {
            StoreError::Unavailable { config_id } | StoreError::Malformed { config_id } => {
                config_id
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Get/put/delete of per-configuration credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for `config_id`
    async fn get(&self, config_id: &str) -> Result<Option<Credentials>, StoreError>;

    /// Insert or replace the record for `credentials.config_id()`
    async fn put(&self, credentials: &Credentials) -> Result<(), StoreError>;

    async fn delete(&self, config_id: &str) -> Result<DeleteOutcome, StoreError>;
}

/// Serialized form kept in the keyring entry
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredSecret {
    username: String,
    password: String,
}

/// Store backed by the OS keyring (Secret Service, Keychain, Credential Manager)
///
/// A missing or locked keyring yields `StoreError::Unavailable`; there is no
/// plaintext fallback.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(service: &str, config_id: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(service, config_id).map_err(|e| map_keyring_error(config_id, &e))
    }

    /// Keyring calls block on D-Bus; keep them off the async workers
    async fn blocking<T, F>(&self, config_id: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(String, String) -> Result<T, StoreError> + Send + 'static,
    {
        let service = self.service.clone();
        let id = config_id.to_string();
        tokio::task::spawn_blocking(move || op(service, id))
            .await
            .map_err(|_| StoreError::Unavailable {
                config_id: config_id.to_string(),
            })?
    }
}

fn map_keyring_error(config_id: &str, error: &keyring::Error) -> StoreError {
    // Only the variant name is logged, backend messages may quote attributes
    match error {
        keyring::Error::BadEncoding(_) => StoreError::Malformed {
            config_id: config_id.to_string(),
        },
        keyring::Error::NoStorageAccess(_) => {
            warn!("Secret store locked or inaccessible (config '{}')", config_id);
            StoreError::Unavailable {
                config_id: config_id.to_string(),
            }
        }
        keyring::Error::PlatformFailure(_) => {
            warn!("Secret store platform failure (config '{}')", config_id);
            StoreError::Unavailable {
                config_id: config_id.to_string(),
            }
        }
        _ => StoreError::Unavailable {
            config_id: config_id.to_string(),
        },
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, config_id: &str) -> Result<Option<Credentials>, StoreError> {
        self.blocking(config_id, |service, id| {
            let entry = Self::entry(&service, &id)?;
            let raw = match entry.get_password() {
                Ok(raw) => Zeroizing::new(raw),
                Err(keyring::Error::NoEntry) => {
                    debug!("No stored credentials for '{}'", id);
                    return Ok(None);
                }
                Err(e) => return Err(map_keyring_error(&id, &e)),
            };
            let secret: StoredSecret = serde_json::from_str(&raw)
                .map_err(|_| StoreError::Malformed { config_id: id.clone() })?;
            info!("Retrieved credentials for '{}'", id);
            Ok(Some(Credentials::new(
                id.as_str(),
                secret.username.as_str(),
                secret.password.as_str(),
            )))
        })
        .await
    }

    async fn put(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let secret = StoredSecret {
            username: credentials.username().to_string(),
            password: credentials.password().to_string(),
        };
        self.blocking(credentials.config_id(), move |service, id| {
            let raw = Zeroizing::new(
                serde_json::to_string(&secret)
                    .map_err(|_| StoreError::Malformed { config_id: id.clone() })?,
            );
            let entry = Self::entry(&service, &id)?;
            entry
                .set_password(&raw)
                .map_err(|e| map_keyring_error(&id, &e))?;
            info!("Saved credentials for '{}'", id);
            Ok(())
        })
        .await
    }

    async fn delete(&self, config_id: &str) -> Result<DeleteOutcome, StoreError> {
        self.blocking(config_id, |service, id| {
            let entry = Self::entry(&service, &id)?;
            match entry.delete_credential() {
                Ok(()) => {
                    info!("Deleted credentials for '{}'", id);
                    Ok(DeleteOutcome::Deleted)
                }
                Err(keyring::Error::NoEntry) => Ok(DeleteOutcome::NotFound),
                Err(e) => Err(map_keyring_error(&id, &e)),
            }
        })
        .await
    }
}

/// In-process store, for tests and for running without a keyring
///
/// `set_available(false)` simulates a locked store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Credentials>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self, config_id: &str) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                config_id: config_id.to_string(),
            })
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credentials>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, config_id: &str) -> Result<Option<Credentials>, StoreError> {
        self.check(config_id)?;
        Ok(self.entries().get(config_id).cloned())
    }

    async fn put(&self, credentials: &Credentials) -> Result<(), StoreError> {
        self.check(credentials.config_id())?;
        self.entries()
            .insert(credentials.config_id().to_string(), credentials.clone());
        Ok(())
    }

    async fn delete(&self, config_id: &str) -> Result<DeleteOutcome, StoreError> {
        self.check(config_id)?;
        Ok(match self.entries().remove(config_id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}
