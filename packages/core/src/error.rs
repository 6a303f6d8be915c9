//! Unified error types for the automount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to inspect a path while checking for an existing mount.
    #[snafu(display("failed to inspect {}", path.display()))]
    MountPointInspect { path: PathBuf, source: nix::Error },

    /// The `mount` command exited with a non-zero code.
    #[snafu(display("failed to mount {device} in {}: {output}", mount_point.display()))]
    Mount {
        device: String,
        mount_point: PathBuf,
        output: String,
    },

    /// The `umount` command exited with a non-zero code.
    #[snafu(display("failed to unmount {}: {output}", path.display()))]
    Unmount { path: PathBuf, output: String },

    /// A configured glob pattern could not be compiled.
    #[snafu(display("invalid filter pattern '{pattern}'"))]
    FilterPattern {
        pattern: String,
        source: glob::PatternError,
    },

    /// A filesystem override entry is not of the form `detected=override`.
    #[snafu(display("invalid filesystem override '{entry}', expected 'detected=override'"))]
    InvalidOverride { entry: String },

    /// A command payload could not be decoded.
    #[snafu(display("malformed command payload"))]
    MalformedCommand { source: serde_json::Error },

    /// A device name that is not a single path component.
    #[snafu(display("invalid device name '{name}'"))]
    InvalidDeviceName { name: String },

    /// The watched directory could not be listed.
    #[snafu(display("failed to read watched directory {}", path.display()))]
    WatchDirRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The directory watcher could not be installed.
    #[snafu(display("failed to watch {}", path.display()))]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    /// Pub/sub transport failure.
    #[snafu(display("redis error: {source}"))]
    Redis { source: redis::RedisError },

    /// The HTTP server could not bind its listening address.
    #[snafu(display("failed to bind HTTP server on {address}: {message}"))]
    HttpBind { address: String, message: String },

    /// Failed to accept or answer an HTTP request.
    #[snafu(display("HTTP transport error"))]
    HttpIo { source: std::io::Error },

    /// A command arrived on a channel with no registered receiver.
    #[snafu(display("no receiver registered on channel {channel}"))]
    NoReceiver { channel: String },

    /// A channel was started twice or its thread could not be spawned.
    #[snafu(display("failed to start channel {channel}: {message}"))]
    ChannelStart { channel: String, message: String },

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[snafu(display("{what} lock poisoned"))]
    Poisoned { what: String },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Short, stable class name for logs and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MountPointCreation { .. } => "MountPointCreation",
            Error::MountPointInspect { .. } => "MountPointInspect",
            Error::Mount { .. } => "MountError",
            Error::Unmount { .. } => "UnmountError",
            Error::FilterPattern { .. } => "FilterPattern",
            Error::InvalidOverride { .. } => "InvalidOverride",
            Error::MalformedCommand { .. } => "MalformedCommand",
            Error::InvalidDeviceName { .. } => "InvalidDeviceName",
            Error::WatchDirRead { .. } => "WatchDirRead",
            Error::Watch { .. } => "Watch",
            Error::Redis { .. } => "RedisError",
            Error::HttpBind { .. } => "HttpBind",
            Error::HttpIo { .. } => "HttpIo",
            Error::NoReceiver { .. } => "NoReceiver",
            Error::ChannelStart { .. } => "ChannelStart",
            Error::Poisoned { .. } => "Poisoned",
            Error::Generic { .. } => "Error",
        }
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for watched directory listing errors.
    fn watch_dir_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn watch_dir_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(WatchDirReadSnafu { path: path.into() })
    }
}
