//! Device lifecycle orchestration.
//!
//! [`DeviceManager`] owns the set of devices the daemon has mounted. Watcher
//! events and channel commands both end up here, and every check-then-mount
//! or check-then-unmount sequence runs under one lock, so two notifications
//! for the same device can never race into a double mount or unmount.
//!
//! Per device the state machine is `Unmanaged -> Managed -> Unmanaged`: a
//! failed mount leaves the device unmanaged (no automatic retry), a failed
//! unmount leaves it managed so a later event or command can retry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use snafu::whatever;
use tracing::{debug, error, info, warn};

use crate::channel::{DevicesListener, ReceiveCallback};
use crate::command::{CommandOperation, CommandOutcome, DeviceSet, Operation, is_hidden_name};
use crate::error::{Error, IoResultExt, Result};
use crate::filter::Filters;
use crate::mount::MountExecutor;
use crate::watcher::DeviceEvent;

/// Reconciles device events and commands into the managed device set.
pub struct DeviceManager {
    watch_dir: PathBuf,
    filters: Filters,
    executor: MountExecutor,
    managed: Mutex<DeviceSet>,
    listeners: RwLock<Vec<Arc<dyn DevicesListener>>>,
}

impl DeviceManager {
    pub fn new(watch_dir: impl Into<PathBuf>, filters: Filters, executor: MountExecutor) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            filters,
            executor,
            managed: Mutex::new(DeviceSet::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a hook notified with a snapshot after every set change.
    pub fn add_listener(&self, listener: Arc<dyn DevicesListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Snapshot of the currently managed devices.
    pub fn managed_devices(&self) -> Result<DeviceSet> {
        Ok(self.lock_devices()?.clone())
    }

    /// Callback handing channel commands to this manager.
    ///
    /// Holds only a weak reference, so channels never keep the manager alive.
    pub fn receive_callback(self: &Arc<Self>) -> ReceiveCallback {
        let manager = Arc::downgrade(self);
        Arc::new(move |command: &CommandOperation| match manager.upgrade() {
            Some(manager) => manager.command_received(command),
            None => whatever!("device manager has shut down"),
        })
    }

    fn lock_devices(&self) -> Result<MutexGuard<'_, DeviceSet>> {
        self.managed.lock().map_err(|_| Error::Poisoned {
            what: "managed device set".to_string(),
        })
    }

    /// Dispatches a watcher event.
    pub fn handle_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Connected { path, name } => self.device_connected(path, name),
            DeviceEvent::Disconnected { path, name } => self.device_disconnected(path, name),
        }
    }

    /// A device entry appeared: mount it if it passes the filters and is not
    /// managed yet. Hidden entries are never mounted.
    pub fn device_connected(&self, path: &Path, name: &str) {
        if is_hidden_name(name) {
            debug!(device = name, "ignoring hidden entry");
            return;
        }
        if !self.filters.passes(name) {
            info!(device = name, "device connected, but excluded from configured filters");
            return;
        }

        let mut devices = match self.lock_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!(device = name, error = %e, "cannot process connected device");
                return;
            }
        };
        if devices.contains(name) {
            info!(device = name, "device connected, but was already being managed");
            return;
        }

        info!(device = name, "device connected, mounting...");
        self.mount_locked(&mut devices, path, name);
    }

    /// A device entry disappeared: unmount it if it is managed.
    pub fn device_disconnected(&self, path: &Path, name: &str) {
        let mut devices = match self.lock_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!(device = name, error = %e, "cannot process disconnected device");
                return;
            }
        };
        if !devices.contains(name) {
            debug!(device = name, path = %path.display(), "device disconnected, but not managed");
            return;
        }

        info!(device = name, "device disconnected, unmounting...");
        self.unmount_locked(&mut devices, name);
    }

    /// Handles an external command. Commands bypass the filters.
    ///
    /// Mount/unmount failures are reported through [`CommandOutcome::Failed`];
    /// `Err` is reserved for invalid commands and internal failures.
    pub fn command_received(&self, command: &CommandOperation) -> Result<CommandOutcome> {
        command.validate()?;
        let name = command.device.as_str();
        debug!(operation = %command.operation, device = name, "received command");

        let mut devices = self.lock_devices()?;
        let outcome = match command.operation {
            Operation::Mount if devices.contains(name) => {
                info!(device = name, "device is already mounted");
                CommandOutcome::AlreadyMounted
            }
            Operation::Mount => {
                let path = self.watch_dir.join(name);
                self.mount_locked(&mut devices, &path, name)
            }
            Operation::Unmount if !devices.contains(name) => {
                info!(device = name, "device is not managed, nothing to unmount");
                CommandOutcome::NotManaged
            }
            Operation::Unmount => self.unmount_locked(&mut devices, name),
        };
        Ok(outcome)
    }

    /// Startup sweep: connects every watched entry that passes the filters.
    ///
    /// Returns the number of entries that were considered for mounting.
    pub fn mount_all_filtered(&self) -> Result<usize> {
        let entries = std::fs::read_dir(&self.watch_dir).watch_dir_context(&self.watch_dir)?;
        let mut attempted = 0;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %self.watch_dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "skipping entry with non UTF-8 name");
                continue;
            };
            if !is_hidden_name(&name) && self.filters.passes(&name) {
                info!(device = %name, "automounting device...");
                self.device_connected(&entry.path(), &name);
                attempted += 1;
            }
        }

        Ok(attempted)
    }

    /// Teardown: unmounts every managed device, in no particular order.
    ///
    /// Devices are removed from the set before unmounting, so a failure is
    /// logged but not retried.
    pub fn unmount_all(&self) {
        let mut devices = match self.lock_devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "cannot unmount managed devices");
                return;
            }
        };

        while let Some(name) = devices.pop_first() {
            let mount_point = self.executor.mount_path(&name);
            if let Err(e) = self.executor.unmount(&mount_point) {
                error!(device = %name, kind = e.kind(), error = %e, "failed unmounting at exit");
            }
            self.devices_changed(&devices);
        }
    }

    fn mount_locked(&self, devices: &mut DeviceSet, path: &Path, name: &str) -> CommandOutcome {
        let fs_type = self.executor.resolve_override(path);
        let mount_point = self.executor.mount_path(name);

        match self.executor.mount(path, &mount_point, fs_type.as_deref()) {
            Ok(()) => {
                devices.insert(name.to_string());
                self.devices_changed(devices);
                CommandOutcome::Mounted
            }
            Err(e) => {
                error!(device = name, kind = e.kind(), error = %e, "device failed to be mounted");
                CommandOutcome::Failed(e.to_string())
            }
        }
    }

    fn unmount_locked(&self, devices: &mut DeviceSet, name: &str) -> CommandOutcome {
        let mount_point = self.executor.mount_path(name);

        match self.executor.unmount(&mount_point) {
            Ok(()) => {
                devices.remove(name);
                self.devices_changed(devices);
                CommandOutcome::Unmounted
            }
            Err(e) => {
                error!(device = name, kind = e.kind(), error = %e, "device failed to be unmounted");
                CommandOutcome::Failed(e.to_string())
            }
        }
    }

    /// Pushes a snapshot to every listener; one failing listener does not
    /// affect the others.
    fn devices_changed(&self, devices: &DeviceSet) {
        let snapshot = devices.clone();
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.notify_devices_changed(&snapshot)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    channel = listener.name(),
                    kind = e.kind(),
                    error = %e,
                    "failed calling devices-changed callback"
                ),
                Err(_) => warn!(
                    channel = listener.name(),
                    kind = "Panic",
                    "devices-changed callback panicked"
                ),
            }
        }
    }
}
