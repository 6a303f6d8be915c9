//! Wire types shared by all command channels.
//!
//! Commands arrive as `{"operation": "mount"|"unmount", "device": "<name>"}`
//! and device-set updates leave as `{"devices": ["<name>", ...]}`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{Error, MalformedCommandSnafu, Result};

/// Names of the devices currently mounted by the daemon.
pub type DeviceSet = BTreeSet<String>;

/// Hidden entries, including the `.#...` links udev creates before renaming
/// them into place, are never treated as devices.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// Operation requested by an external command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Mount,
    Unmount,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Mount => f.write_str("mount"),
            Operation::Unmount => f.write_str("unmount"),
        }
    }
}

/// A mount or unmount request for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOperation {
    pub operation: Operation,
    pub device: String,
}

impl CommandOperation {
    pub fn new(operation: Operation, device: impl Into<String>) -> Self {
        Self {
            operation,
            device: device.into(),
        }
    }

    /// Decodes a JSON payload received from a channel.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context(MalformedCommandSnafu)
    }

    /// Checks that the device is a single plain, non-hidden path component,
    /// so it cannot address anything outside the watched and mount
    /// directories.
    pub fn validate(&self) -> Result<()> {
        let mut components = Path::new(&self.device).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None)
                if !self.device.contains('/') && !is_hidden_name(&self.device) =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidDeviceName {
                name: self.device.clone(),
            }),
        }
    }
}

/// Snapshot of the managed device set as published to channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesMessage {
    pub devices: Vec<String>,
}

impl From<&DeviceSet> for DevicesMessage {
    fn from(set: &DeviceSet) -> Self {
        Self {
            devices: set.iter().cloned().collect(),
        }
    }
}

/// Result of handling a command that reached the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Mounted,
    AlreadyMounted,
    Unmounted,
    NotManaged,
    /// The external mount/unmount command failed; carries its error text.
    Failed(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandOutcome::Failed(_))
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Mounted => f.write_str("device mounted"),
            CommandOutcome::AlreadyMounted => f.write_str("device already mounted"),
            CommandOutcome::Unmounted => f.write_str("device unmounted"),
            CommandOutcome::NotManaged => f.write_str("device not managed"),
            CommandOutcome::Failed(message) => f.write_str(message),
        }
    }
}
