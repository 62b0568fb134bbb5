//! Method-call surface for embedding hosts.
//!
//! Hosts that talk in `(method, arguments)` pairs drive the watcher through
//! [`WatchBridge::handle`]. Every outcome is a map with a `success` flag and
//! an optional `error` message; failures never surface as Rust errors.
//! Events are pushed back through the emitter as
//! `("onFileSystemEvent", {eventType, path, eventName})`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::watcher::{EventMask, WatchError, WatchEvent, WatchOptions, WatchService};

/// Method name used for pushed events.
pub const EVENT_METHOD: &str = "onFileSystemEvent";

/// Receives pushed events: `(method, payload)`.
pub type Emitter = Arc<dyn Fn(&str, Value) + Send + Sync + 'static>;

/// Incoming call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Response map for a handled call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Identifier of a started watch (its path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub watching: Option<bool>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Result<(), WatchError>> for Response {
    fn from(result: Result<(), WatchError>) -> Self {
        match result {
            Ok(()) => Response::ok(),
            Err(e) => Response::failure(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodResult {
    Success(Response),
    NotImplemented,
}

impl MethodResult {
    /// The response, if the method was recognised.
    pub fn response(&self) -> Option<&Response> {
        match self {
            MethodResult::Success(response) => Some(response),
            MethodResult::NotImplemented => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchArgs {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recursive: bool,
    event_mask: Option<u32>,
}

impl WatchArgs {
    fn parse(arguments: &Value) -> Result<Self, String> {
        if arguments.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(arguments.clone()).map_err(|e| format!("Invalid arguments: {e}"))
    }

    fn options(&self) -> WatchOptions {
        WatchOptions::default()
            .recursive(self.recursive)
            .mask(self.event_mask.map_or(EventMask::ALL_EVENTS, EventMask::from_code))
    }
}

pub struct WatchBridge {
    service: Arc<WatchService>,
    emitter: Emitter,
}

impl WatchBridge {
    pub fn new(
        service: Arc<WatchService>,
        emitter: impl Fn(&str, Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            service,
            emitter: Arc::new(emitter),
        }
    }

    pub fn service(&self) -> &Arc<WatchService> {
        &self.service
    }

    /// Dispatch one call.
    pub async fn handle(&self, call: &MethodCall) -> MethodResult {
        crate::debug_event!("bridge", "call", "{}", call.method);

        let response = match call.method.as_str() {
            "startWatching" => self.start_watching(&call.arguments).await,
            "stopWatching" => match WatchArgs::parse(&call.arguments) {
                Ok(args) => self.service.stop_watching(&args.path).await.into(),
                Err(e) => Response::failure(e),
            },
            "stopAllWatching" => self.service.stop_all().await.map(|_| ()).into(),
            "getWatchedPaths" => self.watched_paths(),
            "isWatching" => self.is_watching(&call.arguments),
            "dispose" => {
                self.service.dispose();
                Response::ok()
            }
            _ => return MethodResult::NotImplemented,
        };

        if let Some(error) = &response.error {
            crate::debug_event!("bridge", "failed", "{}: {error}", call.method);
        }
        MethodResult::Success(response)
    }

    async fn start_watching(&self, arguments: &Value) -> Response {
        let args = match WatchArgs::parse(arguments) {
            Ok(args) => args,
            Err(e) => return Response::failure(e),
        };

        let emitter = Arc::clone(&self.emitter);
        let on_event = move |event: WatchEvent| match serde_json::to_value(&event) {
            Ok(payload) => emitter(EVENT_METHOD, payload),
            Err(e) => tracing::error!("[bridge] cannot encode event: {e}"),
        };

        match self
            .service
            .start_watching(PathBuf::from(&args.path), args.options(), on_event)
            .await
        {
            Ok(id) => Response {
                watch_id: Some(id.to_string_lossy().into_owned()),
                ..Response::ok()
            },
            Err(e) => Response::failure(e),
        }
    }

    fn watched_paths(&self) -> Response {
        if self.service.is_disposed() {
            return Response::failure(WatchError::Disposed);
        }
        let paths = self
            .service
            .watched_paths()
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Response {
            paths: Some(paths),
            ..Response::ok()
        }
    }

    fn is_watching(&self, arguments: &Value) -> Response {
        if self.service.is_disposed() {
            return Response::failure(WatchError::Disposed);
        }
        match WatchArgs::parse(arguments) {
            Ok(args) => Response {
                watching: Some(self.service.is_watching(&args.path)),
                ..Response::ok()
            },
            Err(e) => Response::failure(e),
        }
    }
}

impl std::fmt::Debug for WatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchBridge")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
