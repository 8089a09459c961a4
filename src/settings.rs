//! Locally persisted client settings.
//!
//! The file is a CBOR envelope (magic, schema version, blake3 checksum of
//! the payload). Writes go to a temp file that is renamed into place. Values
//! are validated again on load, so a hand-edited file cannot smuggle in an
//! override the UI would have refused.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BackendConfig, BackendOverride, BackendTarget, ConfigError};
use crate::{AppError, ErrorKind};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SETTINGS_BYTES: usize = 64 * 1024;
const SETTINGS_MAGIC: &[u8; 4] = b"HDST";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted settings: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed")]
    IntegrityCheckFailed,

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("settings file too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("stored override rejected: {0}")]
    Config(#[from] ConfigError),
}

impl From<ciborium::de::Error<std::io::Error>> for SettingsError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        SettingsError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SettingsError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        SettingsError::Serialization(e.to_string())
    }
}

impl From<SettingsError> for AppError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Config(config) => config.into(),
            other => AppError::new(ErrorKind::Storage, "Could not read saved settings").with_detail(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct SettingsEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Default)]
struct SettingsPayload {
    override_endpoint: Option<String>,
    override_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalSettings {
    pub backend_override: Option<BackendOverride>,
}

/// One settings file on disk.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means defaults.
    pub fn load(&self, deployment: Option<&BackendConfig>) -> Result<LocalSettings, SettingsError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no saved settings");
            return Ok(LocalSettings::default());
        }
        let bytes = std::fs::read(&self.path)?;
        if bytes.is_empty() {
            return Err(SettingsError::Corrupted { reason: "empty file" });
        }
        decode(&bytes, deployment)
    }

    pub fn save(&self, settings: &LocalSettings) -> Result<(), SettingsError> {
        let bytes = encode(settings)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SettingsError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the override, or forgets it when `None`.
    pub fn set_override(&self, backend_override: Option<BackendOverride>) -> Result<(), SettingsError> {
        match backend_override {
            Some(backend_override) => self.save(&LocalSettings {
                backend_override: Some(backend_override),
            }),
            None => self.clear(),
        }
    }

    /// Saved override if there is a valid one, else the deployment. A file
    /// that fails to load is ignored.
    pub fn backend_target(&self, deployment: BackendConfig) -> BackendTarget {
        match self.load(Some(&deployment)) {
            Ok(LocalSettings {
                backend_override: Some(backend_override),
            }) => BackendTarget::Override(backend_override),
            Ok(_) => BackendTarget::Deployment(deployment),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring saved settings");
                BackendTarget::Deployment(deployment)
            }
        }
    }
}

fn encode(settings: &LocalSettings) -> Result<Vec<u8>, SettingsError> {
    let payload = SettingsPayload {
        override_endpoint: settings.backend_override.as_ref().map(|o| o.endpoint().to_string()),
        override_key: settings
            .backend_override
            .as_ref()
            .map(|o| o.api_key().expose_secret().clone()),
    };
    seal(&payload, CURRENT_SCHEMA_VERSION)
}

fn seal(payload: &SettingsPayload, schema_version: u32) -> Result<Vec<u8>, SettingsError> {
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(payload, &mut payload_bytes)?;

    let envelope = SettingsEnvelope {
        magic: *SETTINGS_MAGIC,
        schema_version,
        checksum: *blake3::hash(&payload_bytes).as_bytes(),
        payload: payload_bytes,
    };
    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;
    Ok(envelope_bytes)
}

fn decode(bytes: &[u8], deployment: Option<&BackendConfig>) -> Result<LocalSettings, SettingsError> {
    if bytes.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsError::TooLarge {
            size: bytes.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let envelope: SettingsEnvelope = ciborium::from_reader(bytes)?;
    if envelope.magic != *SETTINGS_MAGIC {
        return Err(SettingsError::Corrupted {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(SettingsError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if blake3::hash(&envelope.payload).as_bytes() != &envelope.checksum {
        warn!("settings checksum mismatch");
        return Err(SettingsError::IntegrityCheckFailed);
    }

    let payload: SettingsPayload = ciborium::from_reader(&envelope.payload[..])?;
    let backend_override = match (payload.override_endpoint, payload.override_key) {
        (Some(endpoint), Some(key)) => Some(BackendOverride::new(&endpoint, SecretString::new(key), deployment)?),
        (None, None) => None,
        _ => {
            return Err(SettingsError::Corrupted {
                reason: "override is missing its endpoint or key",
            })
        }
    };
    Ok(LocalSettings { backend_override })
}
