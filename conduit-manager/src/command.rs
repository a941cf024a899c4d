//! Request and reply shapes for commands and configuration saves.

use conduit::Configuration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// `{cmdType: "custom", streamId, className, cmdId, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "cmdType", default = "default_cmd_type")]
    pub cmd_type: String,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "className", default)]
    pub class_name: String,
    #[serde(rename = "cmdId")]
    pub cmd_id: String,
    #[serde(default)]
    pub value: Value,
}

fn default_cmd_type() -> String {
    "custom".to_string()
}

/// Command failures returned to the caller, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    NoStream,
    CmdFuncInvalid,
    CmdFuncInvalidType,
    Failed(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NoStream => f.write_str("NO_STREAM"),
            CommandError::CmdFuncInvalid => f.write_str("CMD_FUNC_INVALID"),
            CommandError::CmdFuncInvalidType => f.write_str("CMD_FUNC_INVALID_TYPE"),
            CommandError::Failed(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for CommandError {}

/// `{result}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl fmt::Display) -> Self {
        Self {
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<Value, CommandError>> for Reply {
    fn from(result: Result<Value, CommandError>) -> Self {
        match result {
            Ok(value) => Reply::ok(value),
            Err(e) => Reply::err(e),
        }
    }
}

/// Configuration save request: a `{id, $set}` patch or a full document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SaveRequest {
    Patch {
        id: String,
        #[serde(rename = "$set")]
        set: Map<String, Value>,
    },
    Insert(Configuration),
}
