//! Daemon settings and the components built from them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::channel::{HttpConfig, RedisConfig};
use crate::error::Result;
use crate::executor::CommandRunner;
use crate::filter::Filters;
use crate::fstype::{FilesystemDetector, FsOverrides};
use crate::manager::DeviceManager;
use crate::mount::MountExecutor;
use crate::watcher::WatcherConfig;

pub const DEFAULT_WATCH_DIR: &str = "/dev/disk/by-label";
pub const DEFAULT_BLKID_PATH: &str = "blkid";

/// Immutable daemon configuration.
///
/// Serializes without secrets, for logging at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub mountpoints_base_dir: PathBuf,
    pub watch_dev_dir: PathBuf,
    pub filter_allow: Vec<String>,
    pub filter_block: Vec<String>,
    pub filesystem_types_overrides: FsOverrides,
    pub automount_at_start: bool,
    pub unmount_at_exit: bool,
    pub remove_mountdirs_after_unmount: bool,
    pub blkid_path: String,
    pub watch_polling: bool,
    #[serde(rename = "watch_poll_interval_ms", serialize_with = "as_millis")]
    pub watch_poll_interval: Duration,
    /// Pub/sub channel; `None` when no Redis host is configured.
    pub redis: Option<RedisConfig>,
    /// HTTP channel; `None` when disabled.
    pub http: Option<HttpConfig>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Settings {
    pub fn new(mountpoints_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            mountpoints_base_dir: mountpoints_base_dir.into(),
            watch_dev_dir: PathBuf::from(DEFAULT_WATCH_DIR),
            filter_allow: Vec::new(),
            filter_block: Vec::new(),
            filesystem_types_overrides: FsOverrides::default(),
            automount_at_start: false,
            unmount_at_exit: true,
            remove_mountdirs_after_unmount: true,
            blkid_path: DEFAULT_BLKID_PATH.to_string(),
            watch_polling: false,
            watch_poll_interval: crate::watcher::DEFAULT_POLL_INTERVAL,
            redis: None,
            http: None,
        }
    }

    /// Compiles the filter patterns. Fails on the first invalid glob.
    pub fn filters(&self) -> Result<Filters> {
        Filters::new(&self.filter_allow, &self.filter_block)
    }

    /// The startup sweep only runs when asked for and some filter is set.
    pub fn should_automount(&self) -> bool {
        self.automount_at_start && self.filters().is_ok_and(|filters| !filters.is_empty())
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            dir: self.watch_dev_dir.clone(),
            polling: self.watch_polling,
            poll_interval: self.watch_poll_interval,
        }
    }

    /// Builds the orchestrator with its executor and detector.
    pub fn device_manager(&self, runner: Arc<dyn CommandRunner>) -> Result<DeviceManager> {
        let filters = self.filters()?;
        let detector = FilesystemDetector::new(
            runner.clone(),
            &self.blkid_path,
            self.filesystem_types_overrides.clone(),
        );
        let executor = MountExecutor::new(
            runner,
            detector,
            &self.mountpoints_base_dir,
            self.remove_mountdirs_after_unmount,
        );
        Ok(DeviceManager::new(&self.watch_dev_dir, filters, executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::RecordingRunner;

    #[test]
    fn test_defaults() {
        let settings = Settings::new("/mnt/auto");
        assert_eq!(settings.watch_dev_dir, PathBuf::from("/dev/disk/by-label"));
        assert!(settings.unmount_at_exit);
        assert!(settings.remove_mountdirs_after_unmount);
        assert!(!settings.should_automount());
    }

    #[test]
    fn test_should_automount_requires_filters() {
        let mut settings = Settings::new("/mnt/auto");
        settings.automount_at_start = true;
        assert!(!settings.should_automount());

        settings.filter_block = vec!["SYSTEM".to_string()];
        assert!(settings.should_automount());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let mut settings = Settings::new("/mnt/auto");
        settings.filter_allow = vec!["[".to_string()];
        let runner = Arc::new(RecordingRunner::new());
        assert!(settings.device_manager(runner).is_err());
    }

    #[test]
    fn test_serialization_redacts_password() {
        let mut settings = Settings::new("/mnt/auto");
        let mut redis = RedisConfig::new("localhost");
        redis.password = Some("hunter2".to_string());
        settings.redis = Some(redis);
        settings.filesystem_types_overrides = FsOverrides::parse(&["ntfs=ntfs3"]).unwrap();

        let json = serde_json::to_value(&settings).unwrap();
        assert!(!json.to_string().contains("hunter2"));
        assert_eq!(json["redis"]["host"], "localhost");
        assert_eq!(json["filesystem_types_overrides"]["ntfs"], "ntfs3");
        assert_eq!(json["watch_poll_interval_ms"], 1000);
    }
}
