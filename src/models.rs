use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One argument of a command, response, or event.
///
/// The variant set is closed at encode time; `Opaque` is produced only by the
/// decoder when it meets an argument tag this protocol version does not know,
/// so newer remotes can add types without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Str(String),
    Coord(i64, i64, i64),
    Opaque { tag: String, raw: String },
}

impl ArgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_coord(&self) -> Option<(i64, i64, i64)> {
        match self {
            ArgValue::Coord(x, y, z) => Some((*x, *y, *z)),
            _ => None,
        }
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<(i64, i64, i64)> for ArgValue {
    fn from((x, y, z): (i64, i64, i64)) -> Self {
        ArgValue::Coord(x, y, z)
    }
}

/// A named remote operation with its ordered argument list.
///
/// Immutable once built; ownership passes to the correlator on submit.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<ArgValue>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }
}

/// Failure descriptor reported by the remote for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub code: String,
    pub message: String,
}

/// An unsolicited server-pushed notification of world change.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub target: String,
    pub name: String,
    pub args: Vec<ArgValue>,
}

impl Event {
    /// The JSON attribute payload, when the event carries one.
    ///
    /// By convention the first `s:` argument of an event holds a JSON object
    /// of attribute updates for the target.
    pub fn json_payload(&self) -> Option<Value> {
        let text = self.args.first()?.as_str()?;
        match serde_json::from_str::<Value>(text) {
            Ok(v) if v.is_object() => Some(v),
            _ => None,
        }
    }
}

/// A player or entity position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// The last-known state of a single block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockState {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub kind: String,
}

/// Cached last-known attributes of a world object.
///
/// The version is bumped on every applied change and only ever increases.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub target: String,
    pub version: u64,
    pub attrs: Value,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("target", &self.target)
            .field("version", &self.version)
            .field("attrs", &self.attrs.to_string())
            .finish()
    }
}

/// Connection and session options, supplied at client construction.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub staleness_window: Duration,
    pub event_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(250),
            staleness_window: Duration::from_secs(300),
            event_capacity: 256,
        }
    }
}

impl LinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
