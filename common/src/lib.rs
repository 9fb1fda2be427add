//! Common types and utilities for vidwall.
//!
//! This crate defines the control protocol shared between the daemon
//! (`vidwalld`) and client (`vwctl`).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using JSON-serialized
//! messages, one per line. The client sends a [`Request`] naming one of the
//! fixed control methods and receives a [`Response`]. The method set is
//! fixed and unversioned:
//!
//! | Method      | Args            |
//! |-------------|-----------------|
//! | `play`      | none            |
//! | `pause`     | none            |
//! | `stop`      | none            |
//! | `setVideo`  | uri: string     |
//! | `setVolume` | volume: float64 |
//! | `setLoop`   | loop: bool      |
//!
//! # Examples
//!
//! ```
//! use common::{ControlCommand, Request};
//!
//! let request = Request::with_arg("setVolume", 0.5);
//! let command = ControlCommand::from_request(&request).unwrap();
//! assert_eq!(command, ControlCommand::SetVolume { volume: 0.5 });
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced on the RPC boundary.
///
/// These are the only errors a client ever sees; everything else is handled
/// (and logged) inside the daemon.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcError {
    /// The request named a method outside the fixed method set.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Argument unpacking or dispatch failed; carries the underlying message.
    #[error("failed: {0}")]
    Failed(String),
}

/// A control request as sent over the wire.
///
/// Arguments are positional, mirroring the method table in the crate docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl Request {
    /// Build a request for a method that takes no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Build a request for a method with a single positional argument.
    pub fn with_arg(method: impl Into<String>, arg: impl Into<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            args: vec![arg.into()],
        }
    }
}

/// A validated control command, one per RPC method.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Play,
    Pause,
    Stop,
    SetVideo { uri: String },
    SetVolume { volume: f64 },
    SetLoop { enabled: bool },
}

impl ControlCommand {
    /// Unpack a wire request into a command.
    ///
    /// An unrecognized method name yields [`RpcError::UnknownMethod`]; a
    /// missing or wrongly-typed argument yields [`RpcError::Failed`].
    pub fn from_request(request: &Request) -> Result<Self, RpcError> {
        match request.method.as_str() {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            "setVideo" => {
                let uri = string_arg(request, 0, "uri")?;
                Ok(Self::SetVideo { uri })
            }
            "setVolume" => {
                let volume = float_arg(request, 0, "volume")?;
                Ok(Self::SetVolume { volume })
            }
            "setLoop" => {
                let enabled = bool_arg(request, 0, "loop")?;
                Ok(Self::SetLoop { enabled })
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

fn missing_arg(request: &Request, name: &str, expected: &str) -> RpcError {
    RpcError::Failed(format!(
        "{}: missing or invalid '{}' argument (expected {})",
        request.method, name, expected
    ))
}

fn string_arg(request: &Request, index: usize, name: &str) -> Result<String, RpcError> {
    request
        .args
        .get(index)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| missing_arg(request, name, "string"))
}

fn float_arg(request: &Request, index: usize, name: &str) -> Result<f64, RpcError> {
    request
        .args
        .get(index)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| missing_arg(request, name, "float"))
}

fn bool_arg(request: &Request, index: usize, name: &str) -> Result<bool, RpcError> {
    request
        .args
        .get(index)
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| missing_arg(request, name, "bool"))
}

/// Response from daemon to client.
///
/// Control methods carry no return payload; the reply is the implicit
/// success/error outcome only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(RpcError),
}

/// IPC socket path helper
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("vidwall.sock")
}
