//! Redis pub/sub command channel.
//!
//! Subscribes to a commands topic and, when a status topic is configured,
//! publishes `{"devices": [...]}` after every device-set change.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use redis::{Client, Commands, Connection};
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use super::supervisor::{ChannelRuntime, StopSignal};
use super::{CallbackRegistry, CommandChannel, DevicesListener, ReceiveCallback};
use crate::command::{CommandOperation, DeviceSet, DevicesMessage};
use crate::error::{RedisSnafu, Result};

const CHANNEL_NAME: &str = "RedisChannel";

/// How long a blocking read waits before re-checking the stop signal.
const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishing runs under the device manager lock, so its connect attempt is
/// kept short and a failed attempt is not repeated before the delay passes.
const PUBLISH_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PUBLISH_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Redis connection parameters and topic names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub db: i64,
    /// Topic to receive commands from; `None` disables receiving.
    pub topic_commands: Option<String>,
    /// Topic to publish the device set to; `None` disables publishing.
    pub topic_status: Option<String>,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 6379,
            password: None,
            db: 0,
            topic_commands: Some("mountagne/cmd".to_string()),
            topic_status: None,
        }
    }

    /// Connection URL, e.g. `redis://:secret@localhost:6379/0`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                utf8_percent_encode(password, NON_ALPHANUMERIC),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Lazily connected publishing side.
#[derive(Default)]
struct Publisher {
    conn: Option<Connection>,
    /// Set after a failure; no connect is attempted before this instant.
    retry_at: Option<Instant>,
}

/// Command channel backed by Redis pub/sub.
pub struct RedisChannel {
    config: RedisConfig,
    client: Client,
    publisher: Mutex<Publisher>,
    callbacks: CallbackRegistry,
    runtime: ChannelRuntime,
}

impl RedisChannel {
    /// Creates the channel. No connection is made until it is started.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url()).context(RedisSnafu)?;
        Ok(Self {
            config,
            client,
            publisher: Mutex::new(Publisher::default()),
            callbacks: CallbackRegistry::new(),
            runtime: ChannelRuntime::new(CHANNEL_NAME),
        })
    }

    fn publish(&self, topic: &str, data: &str) -> Result<()> {
        let mut publisher = self.publisher.lock().unwrap_or_else(PoisonError::into_inner);
        if publisher.conn.is_none() {
            if let Some(retry_at) = publisher.retry_at {
                if Instant::now() < retry_at {
                    debug!(channel = CHANNEL_NAME, topic, "publisher unavailable, dropping update");
                    return Ok(());
                }
            }
            match self.client.get_connection_with_timeout(PUBLISH_CONNECT_TIMEOUT) {
                Ok(conn) => publisher.conn = Some(conn),
                Err(e) => {
                    publisher.retry_at = Some(Instant::now() + PUBLISH_RECONNECT_DELAY);
                    return Err(e).context(RedisSnafu);
                }
            }
        }

        let result = match publisher.conn.as_mut() {
            Some(conn) => conn.publish::<_, _, ()>(topic, data).context(RedisSnafu),
            None => Ok(()),
        };
        match &result {
            Ok(()) => publisher.retry_at = None,
            // Reconnect on the next publish.
            Err(_) => publisher.conn = None,
        }
        result
    }
}

/// Decodes one payload and forwards it to the registered callbacks.
///
/// Every failure is logged here; a bad message never ends the loop.
pub(crate) fn handle_payload(channel: &str, callbacks: &CallbackRegistry, payload: &[u8]) {
    let result = CommandOperation::from_json(payload).and_then(|command| {
        command.validate()?;
        debug!(channel, operation = %command.operation, device = %command.device, "command received");
        callbacks.dispatch(channel, &command)
    });

    match result {
        Ok(outcome) => debug!(channel, %outcome, "command processed"),
        Err(e) => error!(channel, kind = e.kind(), error = %e, "exception processing payload"),
    }
}

fn receive_loop(
    client: &Client,
    topic: Option<&str>,
    callbacks: &CallbackRegistry,
    stop: &StopSignal,
) -> Result<()> {
    let Some(topic) = topic else {
        stop.wait();
        return Ok(());
    };

    let mut conn = client
        .get_connection_with_timeout(CONNECT_TIMEOUT)
        .context(RedisSnafu)?;
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(topic).context(RedisSnafu)?;
    pubsub
        .set_read_timeout(Some(READ_POLL_INTERVAL))
        .context(RedisSnafu)?;
    debug!(topic, "redis listening to commands");

    while !stop.is_set() {
        match pubsub.get_message() {
            Ok(message) => handle_payload(CHANNEL_NAME, callbacks, message.get_payload_bytes()),
            Err(e) if e.is_timeout() => continue,
            // Errors caused by shutting down are not worth a backoff cycle.
            Err(_) if stop.is_set() => break,
            Err(e) => return Err(e).context(RedisSnafu),
        }
    }
    Ok(())
}

impl DevicesListener for RedisChannel {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn notify_devices_changed(&self, devices: &DeviceSet) -> Result<()> {
        let Some(topic) = self.config.topic_status.as_deref() else {
            return Ok(());
        };

        let data = match serde_json::to_string(&DevicesMessage::from(devices)) {
            Ok(data) => data,
            Err(e) => {
                warn!(channel = CHANNEL_NAME, error = %e, "failed serializing device set");
                return Ok(());
            }
        };

        debug!(topic, %data, "redis publish");
        if let Err(e) = self.publish(topic, &data) {
            warn!(channel = CHANNEL_NAME, kind = e.kind(), error = %e, "exception publishing redis");
        }
        Ok(())
    }
}

impl CommandChannel for RedisChannel {
    fn start(&self) -> Result<()> {
        let client = self.client.clone();
        let topic = self.config.topic_commands.clone();
        let callbacks = self.callbacks.clone();
        self.runtime
            .start(move |stop| receive_loop(&client, topic.as_deref(), &callbacks, stop))?;
        info!(channel = CHANNEL_NAME, host = %self.config.host, "redis started");
        Ok(())
    }

    fn stop(&self) {
        self.runtime.stop();
        *self.publisher.lock().unwrap_or_else(PoisonError::into_inner) = Publisher::default();
        info!(channel = CHANNEL_NAME, "redis stopped");
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        self.callbacks.register(callback);
    }
}
