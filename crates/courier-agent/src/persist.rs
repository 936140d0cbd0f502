use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use courier_proto::ModeratorId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("agent state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent state is unreadable: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("agent state could not be encoded: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLease {
    pub lease_id: Uuid,
    pub lease_token: String,
}

/// What survives an agent restart: enough to resume heartbeating without re-pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAgentState {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_id: Option<ModeratorId>,
    #[serde(default)]
    pub was_connected: bool,
    /// Kept last: TOML tables must follow plain values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<PersistedLease>,
}

impl PersistedAgentState {
    pub fn is_paired(&self) -> bool {
        self.credential.is_some()
    }

    /// Drops credential material after the manager rejected it.
    pub fn wipe_credential(&mut self) {
        self.credential = None;
        self.moderator_id = None;
        self.lease = None;
        self.was_connected = false;
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh, unpaired agent.
    pub fn load(&self) -> Result<PersistedAgentState, PersistError> {
        if !self.path.exists() {
            return Ok(PersistedAgentState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Writes a sibling temp file and renames it over the target.
    pub fn save(&self, state: &PersistedAgentState) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = toml::to_string_pretty(state)?;
        let tmp = self.path.with_extension("toml.tmp");
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
