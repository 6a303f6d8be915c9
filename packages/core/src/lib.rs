//! automount-core: Core library for the device auto-mount daemon.
//!
//! This library watches a device directory (usually `/dev/disk/by-label`),
//! mounts devices that pass the configured filters under a base directory,
//! and exposes mount/unmount commands over pluggable channels.
//!
//! # Modules
//!
//! - [`filter`]: Allow/block glob filtering of device names
//! - [`fstype`]: Filesystem type detection (`blkid`) and overrides
//! - [`executor`]: External command execution
//! - [`mount`]: Mount/unmount operations and mount directory management
//! - [`manager`]: Device lifecycle orchestration and the managed device set
//! - [`command`]: Command and device-set wire types
//! - [`channel`]: Redis pub/sub and HTTP command channels
//! - [`watcher`]: Device directory watching
//! - [`config`]: Daemon settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use automount_core::{Settings, SystemRunner};
//!
//! let mut settings = Settings::new("/mnt/auto");
//! settings.filter_allow = vec!["USB*".to_string()];
//!
//! let manager = Arc::new(settings.device_manager(Arc::new(SystemRunner)).unwrap());
//! manager.mount_all_filtered().unwrap();
//! println!("{:?}", manager.managed_devices().unwrap());
//! ```

pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod fstype;
pub mod manager;
pub mod mount;
pub mod watcher;

// Re-export commonly used types
pub use channel::{CommandChannel, DevicesListener, HttpChannel, RedisChannel, StopSignal};
pub use command::{CommandOperation, CommandOutcome, DeviceSet, Operation};
pub use config::Settings;
pub use error::{Error, Result};
pub use executor::{CommandRunner, SystemRunner};
pub use manager::DeviceManager;
pub use watcher::{DeviceEvent, DeviceWatcher};
