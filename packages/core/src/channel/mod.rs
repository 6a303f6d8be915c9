//! Pluggable command channels.
//!
//! A channel receives mount/unmount commands from some transport and hands
//! them to its registered receive callbacks, and republishes the managed
//! device set whenever the orchestrator reports a change.
//!
//! - [`pubsub`]: Redis pub/sub topics
//! - [`http`]: a small JSON HTTP interface
//! - [`supervisor`]: the restart-with-backoff loop both transports run on

pub mod http;
pub mod pubsub;
pub mod supervisor;

use std::sync::{Arc, PoisonError, RwLock};

use crate::command::{CommandOperation, CommandOutcome, DeviceSet};
use crate::error::{Error, Result};

pub use http::{HttpChannel, HttpConfig};
pub use pubsub::{RedisChannel, RedisConfig};
pub use supervisor::{ChannelRuntime, StopSignal};

/// Handler invoked for every command a channel receives.
pub type ReceiveCallback =
    Arc<dyn Fn(&CommandOperation) -> Result<CommandOutcome> + Send + Sync>;

/// Receives snapshots of the managed device set after every change.
pub trait DevicesListener: Send + Sync {
    /// Identity used in logs.
    fn name(&self) -> &str;

    fn notify_devices_changed(&self, devices: &DeviceSet) -> Result<()>;
}

/// A transport that feeds external commands into the orchestrator.
pub trait CommandChannel: DevicesListener {
    /// Launches the receive loop on its own thread and returns immediately.
    fn start(&self) -> Result<()>;

    /// Signals the receive loop, releases transport resources and waits for
    /// the loop thread to exit.
    fn stop(&self);

    fn register_receive_callback(&self, callback: ReceiveCallback);
}

/// Receive callbacks registered on one channel.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<Vec<ReceiveCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: ReceiveCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Runs every callback on `command`, returning the last outcome.
    ///
    /// Fails if nothing is registered or if any callback fails.
    pub fn dispatch(&self, channel: &str, command: &CommandOperation) -> Result<CommandOutcome> {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut outcome = None;
        for callback in &callbacks {
            outcome = Some(callback(command)?);
        }
        outcome.ok_or_else(|| Error::NoReceiver {
            channel: channel.to_string(),
        })
    }
}
