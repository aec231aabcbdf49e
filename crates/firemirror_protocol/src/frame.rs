//! Server-push frame decoding.
//!
//! The change stream uses text event-stream framing:
//!
//! ```text
//! event: put
//! data: {"path": "/dino1", "data": {"height": 3}}
//!
//! event: keep-alive
//! data: null
//!
//! ```
//!
//! A frame is one or more `field: value` lines terminated by a blank line.
//! [`FrameDecoder`] assembles raw frames line by line and
//! [`ChangeEvent::from_frame`] interprets them.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::Value;

/// A frame as it appeared on the wire, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the `event` field, if present.
    pub event: Option<String>,
    /// Concatenated `data` lines, joined with `\n`.
    pub data: String,
}

/// Incremental line-oriented frame assembler.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (with or without its terminator).
    ///
    /// Returns a frame when `line` is the blank line closing it.
    pub fn push_line(&mut self, line: &str) -> Option<RawFrame> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry carry no meaning for this protocol
            _ => {}
        }
        None
    }

    /// Returns true if a partially assembled frame is buffered.
    pub fn has_partial(&self) -> bool {
        self.event.is_some() || !self.data.is_empty()
    }

    /// Drops any partially assembled frame.
    pub fn reset(&mut self) {
        self.event = None;
        self.data.clear();
    }

    fn dispatch(&mut self) -> Option<RawFrame> {
        if !self.has_partial() {
            return None;
        }
        let frame = RawFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

/// Kind of change announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Replace the subtree at `path`.
    Put,
    /// Replace each child of `path` named in `data`.
    Patch,
    /// Heartbeat; carries nothing.
    KeepAlive,
    /// The server ended the subscription.
    Cancel,
    /// The subscription's credential is no longer valid.
    AuthRevoked,
}

impl ChangeKind {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Put => "put",
            ChangeKind::Patch => "patch",
            ChangeKind::KeepAlive => "keep-alive",
            ChangeKind::Cancel => "cancel",
            ChangeKind::AuthRevoked => "auth_revoked",
        }
    }

    fn from_name(name: &str) -> ProtocolResult<Self> {
        match name {
            "put" => Ok(ChangeKind::Put),
            "patch" => Ok(ChangeKind::Patch),
            "keep-alive" => Ok(ChangeKind::KeepAlive),
            "cancel" => Ok(ChangeKind::Cancel),
            "auth_revoked" | "auth-revoked" => Ok(ChangeKind::AuthRevoked),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// A decoded change from the server-push stream.
///
/// Ephemeral: consumed by the engine as soon as it is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What kind of change this is.
    pub kind: ChangeKind,
    /// Path relative to the subscribed location (`/` for the root).
    pub path: String,
    /// Decoded payload. Only present for put and patch.
    pub data: Option<Value>,
}

impl ChangeEvent {
    /// Creates a put event.
    pub fn put(path: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ChangeKind::Put,
            path: path.into(),
            data: Some(data),
        }
    }

    /// Creates a patch event.
    pub fn patch(path: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ChangeKind::Patch,
            path: path.into(),
            data: Some(data),
        }
    }

    /// Interprets a raw frame.
    ///
    /// `data` is JSON-decoded only for put and patch. Cancel and revoked-auth
    /// frames decode successfully; callers turn them into terminal failures
    /// with [`ChangeEvent::terminal_error`].
    pub fn from_frame(frame: RawFrame) -> ProtocolResult<Self> {
        let name = frame
            .event
            .ok_or_else(|| ProtocolError::malformed("frame has no event field"))?;
        let kind = ChangeKind::from_name(&name)?;

        match kind {
            ChangeKind::Put | ChangeKind::Patch => {
                let body: Value = serde_json::from_str(&frame.data)
                    .map_err(|e| ProtocolError::InvalidData(e.to_string()))?;
                let Value::Object(mut body) = body else {
                    return Err(ProtocolError::InvalidData(format!(
                        "{name} data is not an object"
                    )));
                };
                let path = match body.remove("path") {
                    Some(Value::String(path)) => path,
                    _ => {
                        return Err(ProtocolError::InvalidData(format!(
                            "{name} data has no path"
                        )))
                    }
                };
                let data = body.remove("data").unwrap_or(Value::Null);
                Ok(Self {
                    kind,
                    path,
                    data: Some(data),
                })
            }
            ChangeKind::KeepAlive | ChangeKind::AuthRevoked => Ok(Self {
                kind,
                path: String::new(),
                data: None,
            }),
            ChangeKind::Cancel => Ok(Self {
                kind,
                path: String::new(),
                data: (!frame.data.is_empty()).then(|| Value::String(frame.data)),
            }),
        }
    }

    /// Returns the terminal failure this event represents, if any.
    pub fn terminal_error(&self) -> Option<ProtocolError> {
        match self.kind {
            ChangeKind::Cancel => {
                let reason = match &self.data {
                    Some(Value::String(reason)) => reason.clone(),
                    _ => "no reason given".to_string(),
                };
                Some(ProtocolError::Cancelled(reason))
            }
            ChangeKind::AuthRevoked => Some(ProtocolError::AuthRevoked),
            _ => None,
        }
    }

    /// Encodes the event back into wire framing, including the closing blank line.
    pub fn to_frame(&self) -> String {
        let data = match self.kind {
            ChangeKind::Put | ChangeKind::Patch => serde_json::json!({
                "path": self.path,
                "data": self.data.clone().unwrap_or(Value::Null),
            })
            .to_string(),
            ChangeKind::Cancel => match &self.data {
                Some(Value::String(reason)) => reason.clone(),
                _ => String::new(),
            },
            ChangeKind::KeepAlive | ChangeKind::AuthRevoked => "null".to_string(),
        };
        format!("event: {}\ndata: {}\n\n", self.kind.as_str(), data)
    }
}
