#![forbid(unsafe_code)]

//! Gateway wire protocol.
//!
//! ```text
//! POST /execute HTTP/1.1
//! X-Auth-Token: <token>
//! Content-Type: application/json
//!
//! {"command":"apply_selection","args":{"items":[...]}}
//! ```
//!
//! The response is always `application/json` `{"success":bool,"output":"...","error":null}`.

use peerlink_core::SelectionItem;
use peerlink_core::wire::{RemoteOutput, parse_output};
use serde::{Deserialize, Serialize};

pub const EXECUTE_PATH: &str = "/execute";
/// Older clients post to this path.
pub const EXECUTE_PATH_ALIAS: &str = "/roslyn";
pub const HEALTH_PATH: &str = "/health";
pub const AUTH_HEADER: &str = "x-auth-token";

/// A typed request executed on the target peer's main context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Answered by the gateway itself with a `PEER` record.
    Ping,
    ListDocuments,
    Synchronize,
    ApplySelection {
        items: Vec<SelectionItem>,
    },
    /// Host-defined command; `args` is passed through untouched.
    Custom {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl RemoteCommand {
    pub fn name(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::ListDocuments => "list_documents",
            Self::Synchronize => "synchronize",
            Self::ApplySelection { .. } => "apply_selection",
            Self::Custom { name, .. } => name,
        }
    }

    /// Builds a command from a CLI-style name and optional JSON arguments.
    pub fn from_name_and_args(
        name: &str,
        args: Option<serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("command".to_string(), serde_json::Value::from(name));
        if let Some(args) = args {
            envelope.insert("args".to_string(), args);
        }
        match serde_json::from_value(serde_json::Value::Object(envelope.clone())) {
            Ok(command) => Ok(command),
            Err(err) if is_known_command(name) => Err(err),
            Err(_) => Ok(Self::Custom {
                name: name.to_string(),
                args: envelope.remove("args").unwrap_or_default(),
            }),
        }
    }
}

fn is_known_command(name: &str) -> bool {
    matches!(
        name,
        "ping" | "list_documents" | "synchronize" | "apply_selection" | "custom"
    )
}

/// A decoded request body.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Command(RemoteCommand),
    /// Raw source fragment for hosts that evaluate code.
    #[cfg(feature = "fragments")]
    Fragment(String),
}

impl Request {
    pub fn label(&self) -> &str {
        match self {
            Self::Command(command) => command.name(),
            #[cfg(feature = "fragments")]
            Self::Fragment(_) => "fragment",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ExecuteResponse {
    pub fn ok(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(output: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
        }
    }

    /// Records and `ERROR` lines carried in `output`.
    pub fn parsed_output(&self) -> RemoteOutput {
        parse_output(&self.output)
    }
}

/// Decodes a request body according to its content type. Failures read as compile errors.
pub fn decode_request(content_type: Option<&str>, body: &[u8]) -> Result<Request, String> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "application/json".to_string());

    match mime.as_str() {
        "application/json" => serde_json::from_slice::<RemoteCommand>(body)
            .map(Request::Command)
            .map_err(|err| format!("invalid command: {err}")),
        "text/plain" => decode_fragment(body),
        other => Err(format!("unsupported content type {other:?}")),
    }
}

#[cfg(feature = "fragments")]
fn decode_fragment(body: &[u8]) -> Result<Request, String> {
    let source = std::str::from_utf8(body).map_err(|_| "fragment is not utf-8".to_string())?;
    if source.trim().is_empty() {
        return Err("empty fragment".to_string());
    }
    Ok(Request::Fragment(source.to_string()))
}

#[cfg(not(feature = "fragments"))]
fn decode_fragment(_body: &[u8]) -> Result<Request, String> {
    Err("raw fragments are not enabled on this peer".to_string())
}
