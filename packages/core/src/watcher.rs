//! Watches the device directory and turns entry changes into device events.
//!
//! Uses the platform watcher (inotify on Linux) unless polling is requested
//! or the native backend cannot be created. Raw notify events are forwarded
//! over a channel to a dispatch thread, which calls the handler.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use crate::channel::StopSignal;
use crate::command::is_hidden_name;
use crate::error::{Error, Result, WatchSnafu};

/// How long the dispatch thread waits for an event before re-checking the
/// stop signal.
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A device entry appearing in or disappearing from the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected { path: PathBuf, name: String },
    Disconnected { path: PathBuf, name: String },
}

impl DeviceEvent {
    fn connected(path: &Path) -> Option<Self> {
        device_name(path).map(|name| DeviceEvent::Connected {
            path: path.to_path_buf(),
            name,
        })
    }

    fn disconnected(path: &Path) -> Option<Self> {
        device_name(path).map(|name| DeviceEvent::Disconnected {
            path: path.to_path_buf(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            DeviceEvent::Connected { name, .. } | DeviceEvent::Disconnected { name, .. } => name,
        }
    }

    /// Maps a raw notify event to device events.
    ///
    /// Linux reports a rename as `From`, `To` and then `Both`; only the first
    /// two are used.
    pub fn from_notify(event: &Event) -> Vec<DeviceEvent> {
        let map: fn(&Path) -> Option<DeviceEvent> = match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                DeviceEvent::connected
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                DeviceEvent::disconnected
            }
            // Backends that cannot tell the direction of a rename.
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => |path: &Path| {
                if path.symlink_metadata().is_ok() {
                    DeviceEvent::connected(path)
                } else {
                    DeviceEvent::disconnected(path)
                }
            },
            _ => return Vec::new(),
        };

        event.paths.iter().filter_map(|p| map(p)).collect()
    }
}

/// Entry name of `path`, skipping hidden entries.
fn device_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.is_empty() || is_hidden_name(name) {
        return None;
    }
    Some(name.to_string())
}

/// How the watched directory is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    pub dir: PathBuf,
    pub polling: bool,
    pub poll_interval: Duration,
}

impl WatcherConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            polling: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type EventSender = mpsc::Sender<notify::Result<Event>>;

fn create_watcher(config: &WatcherConfig, tx: EventSender) -> Result<Box<dyn Watcher + Send>> {
    if !config.polling {
        match notify::recommended_watcher(tx.clone()) {
            Ok(watcher) => return Ok(Box::new(watcher)),
            Err(e) => warn!(error = %e, "native watcher unavailable, falling back to polling"),
        }
    }

    let poll_config = Config::default().with_poll_interval(config.poll_interval);
    let watcher = PollWatcher::new(tx, poll_config).context(WatchSnafu {
        path: config.dir.clone(),
    })?;
    Ok(Box::new(watcher))
}

fn dispatch_loop<F>(rx: Receiver<notify::Result<Event>>, stop: StopSignal, handler: F)
where
    F: Fn(&DeviceEvent),
{
    while !stop.is_set() {
        let event = match rx.recv_timeout(DISPATCH_POLL_INTERVAL) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                warn!(error = %e, "watcher error");
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        for device_event in DeviceEvent::from_notify(&event) {
            debug!(?device_event, "device event");
            handler(&device_event);
        }
    }
    debug!("watcher dispatch loop exited");
}

/// Running directory watcher. Stops on [`DeviceWatcher::stop`] or drop.
pub struct DeviceWatcher {
    dir: PathBuf,
    watcher: Mutex<Option<Box<dyn Watcher + Send>>>,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceWatcher {
    /// Starts watching `config.dir`, calling `handler` for every device event.
    pub fn start<F>(config: &WatcherConfig, handler: F) -> Result<Self>
    where
        F: Fn(&DeviceEvent) + Send + 'static,
    {
        // The polling backend accepts a missing path silently.
        if !config.dir.is_dir() {
            return Err(Error::Watch {
                path: config.dir.clone(),
                source: notify::Error::path_not_found().add_path(config.dir.clone()),
            });
        }

        let (tx, rx) = mpsc::channel();
        let mut watcher = create_watcher(config, tx)?;
        watcher
            .watch(&config.dir, RecursiveMode::NonRecursive)
            .context(WatchSnafu {
                path: config.dir.clone(),
            })?;

        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("watcher".to_string())
            .spawn(move || dispatch_loop(rx, thread_stop, handler))
            .map_err(|e| Error::Watch {
                path: config.dir.clone(),
                source: notify::Error::io(e),
            })?;

        info!(dir = %config.dir.display(), polling = config.polling, "watching for devices");
        Ok(Self {
            dir: config.dir.clone(),
            watcher: Mutex::new(Some(watcher)),
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Removes the watch and waits for the dispatch thread to exit.
    pub fn stop(&self) {
        self.stop.set();
        // Dropping the watcher closes the event channel.
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(dir = %self.dir.display(), "watcher thread terminated abnormally");
            }
            info!(dir = %self.dir.display(), "watcher stopped");
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CallbackRegistry;
    use crate::command::{CommandOperation, Operation};
    use crate::executor::fake::RecordingRunner;
    use crate::filter::Filters;
    use crate::fstype::{FilesystemDetector, FsOverrides};
    use crate::manager::DeviceManager;
    use crate::mount::MountExecutor;
    use notify::event::{CreateKind, RemoveKind};
    use std::fs;
    use std::sync::Arc;
    use std::time::Instant;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn test_from_notify_create_and_remove() {
        let created = event(EventKind::Create(CreateKind::Any), &["/dev/disk/by-label/USBKEY"]);
        assert_eq!(
            DeviceEvent::from_notify(&created),
            vec![DeviceEvent::Connected {
                path: PathBuf::from("/dev/disk/by-label/USBKEY"),
                name: "USBKEY".to_string(),
            }]
        );

        let removed = event(EventKind::Remove(RemoveKind::Any), &["/dev/disk/by-label/USBKEY"]);
        assert_eq!(DeviceEvent::from_notify(&removed)[0].name(), "USBKEY");
        assert!(matches!(
            DeviceEvent::from_notify(&removed)[0],
            DeviceEvent::Disconnected { .. }
        ));
    }

    #[test]
    fn test_from_notify_renames() {
        let to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/dev/disk/by-label/USBKEY"],
        );
        assert!(matches!(
            DeviceEvent::from_notify(&to)[..],
            [DeviceEvent::Connected { .. }]
        ));

        let from = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/dev/disk/by-label/USBKEY"],
        );
        assert!(matches!(
            DeviceEvent::from_notify(&from)[..],
            [DeviceEvent::Disconnected { .. }]
        ));

        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/dev/disk/by-label/.#USBKEY", "/dev/disk/by-label/USBKEY"],
        );
        assert!(DeviceEvent::from_notify(&both).is_empty());
    }

    #[test]
    fn test_from_notify_skips_hidden_and_other_kinds() {
        let hidden = event(EventKind::Create(CreateKind::Any), &["/dev/disk/by-label/.#USBKEY"]);
        assert!(DeviceEvent::from_notify(&hidden).is_empty());

        let access = event(EventKind::Access(notify::event::AccessKind::Any), &["/x/USBKEY"]);
        assert!(DeviceEvent::from_notify(&access).is_empty());
    }

    #[test]
    fn test_polling_watcher_delivers_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = WatcherConfig {
            dir: dir.path().to_path_buf(),
            polling: true,
            poll_interval: Duration::from_millis(50),
        };
        let (tx, rx) = mpsc::channel();
        let watcher = DeviceWatcher::start(&config, move |e| {
            let _ = tx.send(e.clone());
        })
        .unwrap();

        let device = dir.path().join("USBKEY");
        fs::write(&device, b"").unwrap();
        let connected = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            connected,
            DeviceEvent::Connected {
                path: device.clone(),
                name: "USBKEY".to_string()
            }
        );

        fs::remove_file(&device).unwrap();
        let disconnected = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(disconnected, DeviceEvent::Disconnected { name, .. } if name == "USBKEY"));

        watcher.stop();
    }

    #[test]
    fn test_watch_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatcherConfig::new(dir.path().join("missing"));
        config.polling = true;
        assert!(DeviceWatcher::start(&config, |_| {}).is_err());
    }

    #[test]
    fn test_end_to_end_watcher_and_commands() {
        let watch = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let detector = FilesystemDetector::new(runner.clone(), "blkid", FsOverrides::default());
        let executor = MountExecutor::new(runner.clone(), detector, base.path(), true);
        let manager = Arc::new(DeviceManager::new(
            watch.path(),
            Filters::new(&["USB*"], &[]).unwrap(),
            executor,
        ));

        let config = WatcherConfig {
            dir: watch.path().to_path_buf(),
            polling: true,
            poll_interval: Duration::from_millis(50),
        };
        let handler_manager = manager.clone();
        let watcher =
            DeviceWatcher::start(&config, move |e| handler_manager.handle_event(e)).unwrap();

        let mount_point = base.path().join("USBKEY");
        fs::write(watch.path().join("USBKEY"), b"").unwrap();
        assert!(wait_for(|| manager.managed_devices().unwrap().contains("USBKEY")));
        assert!(mount_point.is_dir());

        fs::remove_file(watch.path().join("USBKEY")).unwrap();
        assert!(wait_for(|| manager.managed_devices().unwrap().is_empty()));
        assert!(!mount_point.exists());

        // Commands bypass the filters and need no directory entry.
        let registry = CallbackRegistry::new();
        registry.register(manager.receive_callback());
        let outcome = registry
            .dispatch("test", &CommandOperation::new(Operation::Mount, "CAMERA"))
            .unwrap();
        assert!(outcome.is_success());
        watcher.stop();

        assert_eq!(runner.calls_to("mount").len(), 2);
        assert_eq!(runner.calls_to("umount").len(), 1);
    }
}
