//! Filesystem type detection using `blkid`, and type overrides.
//!
//! Some kernels mount a detected type with a poor default driver (e.g. `ntfs`
//! through the read-only driver instead of `ntfs3`). An override map lets the
//! daemon pass an explicit `-t <type>` to `mount` for such devices.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::executor::CommandRunner;

/// Mapping from detected filesystem type to the type passed to `mount -t`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsOverrides(BTreeMap<String, String>);

impl FsOverrides {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// Parses `detected=override` entries, e.g. `["ntfs=ntfs3"]`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (from, to) = entry
                .split_once('=')
                .map(|(f, t)| (f.trim(), t.trim()))
                .filter(|(f, t)| !f.is_empty() && !t.is_empty())
                .ok_or_else(|| Error::InvalidOverride {
                    entry: entry.to_string(),
                })?;
            map.insert(from.to_string(), to.to_string());
        }
        Ok(Self(map))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, detected: &str) -> Option<&str> {
        self.0.get(detected).map(String::as_str)
    }
}

/// Parses one line of `blkid <device>` output into lowercase keys.
///
/// Example: `/dev/sdb1: LABEL="USBKEY" UUID="0A1B-2C3D" TYPE="vfat"`
fn parse_blkid_line(line: &str) -> Option<HashMap<String, String>> {
    let (_, attrs) = line.split_once(": ")?;
    let mut fields = HashMap::new();
    let mut rest = attrs.trim();

    while !rest.is_empty() {
        let (key, after_key) = rest.split_once("=\"")?;
        let mut value = String::new();
        let mut chars = after_key.char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    end = Some(i);
                    break;
                }
                _ => value.push(c),
            }
        }
        let end = end?;
        fields.insert(key.trim().to_lowercase(), value);
        rest = after_key[end + 1..].trim_start();
    }

    Some(fields)
}

/// Extracts the `TYPE` field from `blkid` output.
pub fn parse_blkid_type(output: &str) -> Option<String> {
    output
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(parse_blkid_line)
        .and_then(|mut fields| fields.remove("type"))
}

/// Resolves override filesystem types for devices about to be mounted.
pub struct FilesystemDetector {
    runner: Arc<dyn CommandRunner>,
    tool: String,
    overrides: FsOverrides,
    tool_installed: bool,
}

impl FilesystemDetector {
    /// Creates the detector, probing once for the detection tool when
    /// overrides are configured.
    pub fn new(runner: Arc<dyn CommandRunner>, tool: impl Into<String>, overrides: FsOverrides) -> Self {
        let tool = tool.into();
        let tool_installed = !overrides.is_empty() && runner.is_installed(&tool);
        if !overrides.is_empty() && !tool_installed {
            warn!(tool = %tool, "filesystem detection tool not installed, overrides disabled");
        }

        Self {
            runner,
            tool,
            overrides,
            tool_installed,
        }
    }

    /// Runs the detection tool once and returns the reported type.
    pub fn detect_filesystem_type(&self, device: &Path) -> Option<String> {
        let device_arg = device.to_string_lossy();
        let out = self.runner.run(&self.tool, &[device_arg.as_ref()]);
        if !out.success() {
            error!(device = %device.display(), output = %out.output, "failed determining filesystem type");
            return None;
        }

        let detected = parse_blkid_type(&out.output);
        if detected.is_none() {
            error!(device = %device.display(), output = %out.output, "failed parsing blkid output");
        }
        detected
    }

    /// Returns the override type for `device`, if one applies.
    pub fn resolve_override(&self, device: &Path) -> Option<String> {
        if self.overrides.is_empty() {
            return None;
        }
        if !self.tool_installed {
            warn!(tool = %self.tool, "cannot detect filesystem for override, using default");
            return None;
        }

        let detected = self.detect_filesystem_type(device)?;
        let override_type = self.overrides.get(&detected)?;
        debug!(
            device = %device.display(),
            detected = %detected,
            override_type,
            "filesystem type overridden"
        );
        Some(override_type.to_string())
    }
}
