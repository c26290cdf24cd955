//! # Control messages and IPC frames.
//!
//! A [`ControlMessage`] is a tagged record `{ "kind": ..., ...fields }` that travels over the
//! control channel. The kind `"restart"` is reserved; every other kind names an action and the
//! remaining fields become that action's parameters.
//!
//! A [`Frame`] is one line on the pipe between the supervisor and a child process:
//! ```text
//! child  ─► supervisor : {"frame":"listening","addr":"127.0.0.1:8080"}
//! child  ─► supervisor : {"frame":"message","message":{"kind":"update","package":"foo"}}
//! super. ─► child      : {"frame":"message","message":{"kind":"complete"}}
//! super. ─► child      : {"frame":"disconnect"}
//! ```
//!
//! ## Rules
//! - `kind` is required; a line without it does not decode and is dropped by the reader.
//! - The optional `ref` field is a correlation id. Replies echo it; it is never an action parameter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved kind that triggers the restart protocol.
pub const RESTART: &str = "restart";
/// Reply kind for an action that exited with status 0.
pub const COMPLETE: &str = "complete";
/// Reply kind for an action that exited with a nonzero status.
pub const ERROR: &str = "error";
/// Correlation field echoed from a request into its reply.
pub const REF_FIELD: &str = "ref";

/// Tagged control record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Message kind (`restart`, an action name, or a reply kind).
    pub kind: String,
    /// Remaining fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Where the router sends a message.
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    /// Run the restart protocol.
    Restart,
    /// Start the named action with the given parameters.
    Action {
        name: &'a str,
        params: BTreeMap<String, String>,
    },
}

impl ControlMessage {
    /// Creates a message of the given kind with no fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attaches a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// `{ "kind": "restart" }`
    pub fn restart() -> Self {
        Self::new(RESTART)
    }

    #[inline]
    pub fn is_restart(&self) -> bool {
        self.kind == RESTART
    }

    /// Correlation id, if the sender set one.
    pub fn reference(&self) -> Option<&Value> {
        self.fields.get(REF_FIELD)
    }

    /// Classifies the message for the router.
    pub fn route(&self) -> Route<'_> {
        if self.is_restart() {
            Route::Restart
        } else {
            Route::Action {
                name: &self.kind,
                params: self.params(),
            }
        }
    }

    /// Fields rendered as environment-style parameters.
    ///
    /// Strings are passed verbatim, `null` becomes an empty string, anything else
    /// is rendered as JSON text (so `2` becomes `"2"`).
    pub fn params(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != REF_FIELD)
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Outcome reported to the requester of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// `{ "kind": "complete" }`
    Complete,
    /// `{ "kind": "error", "code": c }`
    Error { code: i32 },
}

impl Reply {
    /// Translates an exit code: `0` is complete, anything else is an error carrying the code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Reply::Complete,
            code => Reply::Error { code },
        }
    }

    /// Builds the reply message, echoing the request's correlation id.
    pub fn to_message(self, reference: Option<&Value>) -> ControlMessage {
        let msg = match self {
            Reply::Complete => ControlMessage::new(COMPLETE),
            Reply::Error { code } => ControlMessage::new(ERROR).with_field("code", code),
        };
        match reference {
            Some(r) => msg.with_field(REF_FIELD, r.clone()),
            None => msg,
        }
    }

    /// Parses a reply message; `None` if the kind is not a reply kind.
    pub fn from_message(msg: &ControlMessage) -> Option<Self> {
        match msg.kind.as_str() {
            COMPLETE => Some(Reply::Complete),
            ERROR => {
                let code = msg
                    .fields
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(1);
                Some(Reply::Error { code })
            }
            _ => None,
        }
    }
}

/// One line on a supervisor/child pipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Child is serving (workers only).
    Listening {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
    },
    /// Stop accepting new work, finish in-flight work, exit.
    Disconnect,
    /// A control message in either direction.
    Message { message: ControlMessage },
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Frame::Message { message }
    }
}
