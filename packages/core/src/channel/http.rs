//! HTTP command channel.
//!
//! Routes:
//! - `POST /mount/{device_name}`
//! - `POST /unmount/{device_name}`
//! - `GET /devices`
//!
//! Mount and unmount answer `{"success": bool, "message": string}`: status 200
//! when the command was handled (even if the mount itself failed, in which
//! case `success` is false) and 500 when handling raised an error.

use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tiny_http::{Header, Method, Response, Server};
use tracing::{debug, info, warn};

use super::supervisor::{ChannelRuntime, StopSignal};
use super::{CallbackRegistry, CommandChannel, DevicesListener, ReceiveCallback};
use crate::command::{CommandOperation, DeviceSet, DevicesMessage, Operation};
use crate::error::{Error, HttpIoSnafu, Result};

const CHANNEL_NAME: &str = "HttpChannel";

/// How long the server waits for a request before re-checking the stop signal.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bind address of the HTTP channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl HttpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Body of mount/unmount responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// State shared between the server thread and the devices-changed hook.
#[derive(Clone, Default)]
struct HttpState {
    callbacks: CallbackRegistry,
    devices: Arc<RwLock<DeviceSet>>,
}

/// A routed response: status code and JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            body: serde_json::to_string(value).expect("Failed to serialize response"),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(
            status,
            &OperationResponse {
                success: false,
                message: message.to_string(),
            },
        )
    }

    fn into_response(self) -> Response<Cursor<Vec<u8>>> {
        let mut response = Response::from_string(self.body).with_status_code(self.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response.add_header(header);
        }
        response
    }
}

impl HttpState {
    fn route(&self, method: &Method, url: &str) -> Reply {
        let path = url.split('?').next().unwrap_or_default();

        if path == "/devices" {
            return match method {
                Method::Get => self.list_devices(),
                _ => Reply::error(405, "method not allowed"),
            };
        }

        let (operation, raw_name) = if let Some(name) = path.strip_prefix("/mount/") {
            (Operation::Mount, name)
        } else if let Some(name) = path.strip_prefix("/unmount/") {
            (Operation::Unmount, name)
        } else {
            return Reply::error(404, "not found");
        };

        if *method != Method::Post {
            return Reply::error(405, "method not allowed");
        }

        let device_name = percent_decode_str(raw_name).decode_utf8_lossy();
        self.operation_handler(operation, &device_name)
    }

    fn operation_handler(&self, operation: Operation, device_name: &str) -> Reply {
        let command = CommandOperation::new(operation, device_name);
        debug!(channel = CHANNEL_NAME, %operation, device = device_name, "command received");

        let result = catch_unwind(AssertUnwindSafe(|| {
            command.validate()?;
            self.callbacks.dispatch(CHANNEL_NAME, &command)
        }));

        match result {
            Ok(Ok(outcome)) => Reply::json(
                200,
                &OperationResponse {
                    success: outcome.is_success(),
                    message: outcome.to_string(),
                },
            ),
            Ok(Err(e)) => Reply::error(500, &format!("{}: {}", e.kind(), e)),
            Err(_) => Reply::error(500, "Panic: command handler panicked"),
        }
    }

    fn list_devices(&self) -> Reply {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        Reply::json(200, &DevicesMessage::from(&*devices))
    }
}

fn serve_loop(address: &str, state: &HttpState, stop: &StopSignal) -> Result<()> {
    let server = Server::http(address).map_err(|e| Error::HttpBind {
        address: address.to_string(),
        message: e.to_string(),
    })?;
    info!(channel = CHANNEL_NAME, %address, "REST server listening");

    while !stop.is_set() {
        let Some(request) = server.recv_timeout(ACCEPT_POLL_INTERVAL).context(HttpIoSnafu)? else {
            continue;
        };

        let reply = state.route(request.method(), request.url());
        debug!(
            channel = CHANNEL_NAME,
            method = %request.method(),
            url = request.url(),
            status = reply.status,
            "request handled"
        );
        if let Err(e) = request.respond(reply.into_response()) {
            warn!(channel = CHANNEL_NAME, error = %e, "failed sending response");
        }
    }
    Ok(())
}

/// Command channel exposing a small JSON HTTP interface.
pub struct HttpChannel {
    config: HttpConfig,
    state: HttpState,
    runtime: ChannelRuntime,
}

impl HttpChannel {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            state: HttpState::default(),
            runtime: ChannelRuntime::new(CHANNEL_NAME),
        }
    }
}

impl DevicesListener for HttpChannel {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn notify_devices_changed(&self, devices: &DeviceSet) -> Result<()> {
        *self
            .state
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner) = devices.clone();
        Ok(())
    }
}

impl CommandChannel for HttpChannel {
    fn start(&self) -> Result<()> {
        let address = self.config.address();
        let state = self.state.clone();
        self.runtime
            .start(move |stop| serve_loop(&address, &state, stop))
    }

    fn stop(&self) {
        self.runtime.stop();
        info!(channel = CHANNEL_NAME, "REST server stopped");
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        self.state.callbacks.register(callback);
    }
}
