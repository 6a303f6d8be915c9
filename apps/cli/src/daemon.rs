//! Daemon run and teardown sequencing.
//!
//! Startup order: orchestrator, optional auto-mount sweep, channels, watcher.
//! Ctrl-C or SIGTERM sets a stop signal; teardown then stops the watcher,
//! unmounts managed devices if configured and stops every channel.

use std::sync::Arc;

use automount_core::channel::StopSignal;
use automount_core::{
    CommandChannel, CommandRunner, DeviceManager, DeviceWatcher, Error, HttpChannel, RedisChannel,
    Result, Settings, SystemRunner,
};
use snafu::ResultExt;
use tracing::{error, info};

/// Runs the daemon until interrupted.
pub fn run(settings: Settings) -> Result<()> {
    let settings_json = serde_json::to_string(&settings).expect("Failed to serialize settings");
    info!(settings = %settings_json, "running with settings");

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.set())
        .whatever_context::<_, Error>("failed to install signal handler")?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let manager = Arc::new(settings.device_manager(runner)?);
    let channels = build_channels(&settings, &manager)?;

    if settings.should_automount() {
        match manager.mount_all_filtered() {
            Ok(count) => info!(count, "automount at start finished"),
            Err(e) => error!(kind = e.kind(), error = %e, "automount at start failed"),
        }
    }

    for channel in &channels {
        if let Err(e) = channel.start() {
            stop_channels(&channels);
            return Err(e);
        }
    }

    let watcher_manager = manager.clone();
    let watcher = match DeviceWatcher::start(&settings.watcher_config(), move |event| {
        watcher_manager.handle_event(event)
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            shutdown(&settings, &manager, &channels);
            return Err(e);
        }
    };

    stop.wait();

    info!("Stopping...");
    watcher.stop();
    shutdown(&settings, &manager, &channels);
    info!("Stopped");
    Ok(())
}

/// Releases managed devices if configured, then stops every channel.
///
/// Runs once the watcher is stopped or failed to start, so nothing else
/// mutates the device set.
fn shutdown(settings: &Settings, manager: &DeviceManager, channels: &[Arc<dyn CommandChannel>]) {
    if settings.unmount_at_exit {
        manager.unmount_all();
    }
    stop_channels(channels);
}

/// Creates the configured channels, subscribed to device-set changes and
/// wired to the orchestrator's command entry point.
fn build_channels(
    settings: &Settings,
    manager: &Arc<DeviceManager>,
) -> Result<Vec<Arc<dyn CommandChannel>>> {
    let mut channels: Vec<Arc<dyn CommandChannel>> = Vec::new();

    if let Some(config) = &settings.redis {
        let channel = Arc::new(RedisChannel::new(config.clone())?);
        manager.add_listener(channel.clone());
        channels.push(channel);
    }
    if let Some(config) = &settings.http {
        let channel = Arc::new(HttpChannel::new(config.clone()));
        manager.add_listener(channel.clone());
        channels.push(channel);
    }

    for channel in &channels {
        channel.register_receive_callback(manager.receive_callback());
    }
    Ok(channels)
}

fn stop_channels(channels: &[Arc<dyn CommandChannel>]) {
    for channel in channels {
        channel.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automount_core::executor::CommandOutput;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl CommandRunner for Calls {
        fn run(&self, program: &str, _args: &[&str]) -> CommandOutput {
            self.0.lock().unwrap().push(program.to_string());
            CommandOutput::new(0, "")
        }
    }

    fn connected_manager(
        unmount_at_exit: bool,
    ) -> (Settings, DeviceManager, Arc<Calls>, [tempfile::TempDir; 2]) {
        let watch = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        fs::write(watch.path().join("USBKEY"), b"").unwrap();

        let mut settings = Settings::new(base.path());
        settings.watch_dev_dir = watch.path().to_path_buf();
        settings.unmount_at_exit = unmount_at_exit;

        let calls = Arc::new(Calls::default());
        let manager = settings.device_manager(calls.clone()).unwrap();
        manager.device_connected(&watch.path().join("USBKEY"), "USBKEY");
        assert_eq!(manager.managed_devices().unwrap().len(), 1);
        (settings, manager, calls, [watch, base])
    }

    #[test]
    fn test_shutdown_unmounts_when_configured() {
        let (settings, manager, calls, _dirs) = connected_manager(true);

        shutdown(&settings, &manager, &[]);

        assert!(manager.managed_devices().unwrap().is_empty());
        assert!(calls.0.lock().unwrap().iter().any(|p| p == "umount"));
    }

    #[test]
    fn test_shutdown_keeps_mounts_when_disabled() {
        let (settings, manager, calls, _dirs) = connected_manager(false);

        shutdown(&settings, &manager, &[]);

        assert_eq!(manager.managed_devices().unwrap().len(), 1);
        assert!(!calls.0.lock().unwrap().iter().any(|p| p == "umount"));
    }

    #[test]
    fn test_watcher_failure_still_unmounts() {
        let (mut settings, manager, calls, _dirs) = connected_manager(true);
        settings.watch_dev_dir = settings.watch_dev_dir.join("missing");

        let Err(e) = DeviceWatcher::start(&settings.watcher_config(), |_| {}) else {
            panic!("watcher started on a missing directory");
        };
        assert!(e.to_string().contains("missing"));
        shutdown(&settings, &manager, &[]);

        assert!(manager.managed_devices().unwrap().is_empty());
        assert!(calls.0.lock().unwrap().iter().any(|p| p == "umount"));
    }
}
