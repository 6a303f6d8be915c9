//! Supervised receive loops for command channels.
//!
//! Each channel runs its loop body on a dedicated thread. A body that fails
//! (or panics) is logged and re-entered after a backoff, which the stop
//! signal can cut short. Cancellation is cooperative: bodies are expected to
//! poll [`StopSignal::is_set`] at their own iteration boundaries.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Error, Result};

/// Pause between a failed loop body and its next run.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Cloneable, waitable stop flag shared between a loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`, returning early once stopped.
    ///
    /// Returns true if the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }

    /// Blocks until the signal is set.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = cvar.wait(stopped).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Runs `body` until `stop` is set, backing off after each failure.
pub fn run_supervised<F>(name: &str, stop: &StopSignal, backoff: Duration, mut body: F)
where
    F: FnMut(&StopSignal) -> Result<()>,
{
    while !stop.is_set() {
        match catch_unwind(AssertUnwindSafe(|| body(stop))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(channel = name, kind = e.kind(), error = %e, "exception in channel loop");
                stop.wait_timeout(backoff);
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(channel = name, kind = "Panic", error = %message, "channel loop panicked");
                stop.wait_timeout(backoff);
            }
        }
    }
    debug!(channel = name, "channel loop exited");
}

/// Owns the thread and stop signal of one channel's supervised loop.
pub struct ChannelRuntime {
    name: String,
    backoff: Duration,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl ChannelRuntime {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff: DEFAULT_BACKOFF,
            stop: StopSignal::new(),
            handle: Mutex::new(None),
            started: Mutex::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Spawns the supervised loop. A runtime can only be started once.
    pub fn start<F>(&self, body: F) -> Result<()>
    where
        F: FnMut(&StopSignal) -> Result<()> + Send + 'static,
    {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started {
            return Err(Error::ChannelStart {
                channel: self.name.clone(),
                message: "already started".to_string(),
            });
        }

        let name = self.name.clone();
        let stop = self.stop.clone();
        let backoff = self.backoff;
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_supervised(&name, &stop, backoff, body))
            .map_err(|e| Error::ChannelStart {
                channel: self.name.clone(),
                message: e.to_string(),
            })?;

        *started = true;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Sets the stop signal and waits for the loop thread to exit.
    pub fn stop(&self) {
        self.stop.set();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(channel = %self.name, "channel thread terminated abnormally");
            }
        }
    }
}
