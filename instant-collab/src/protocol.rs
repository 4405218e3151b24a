//! Wire protocol: tagged JSON arrays, one per WebSocket text frame.
//!
//! Wire format:
//! ```text
//! [ type, field1, field2, … ]
//!
//!  INFO        [5, session_share, username, agent]
//!  AVAILABLE   [2, is_first, client_id, session_share]
//!  CONNECT     [7, client_id, username]
//!  DISCONNECT  [8, client_id]
//!  REQUEST     [3]
//!  INITIAL     [6, buffer_name, [bufnr, host_id], [pid…], [line…]]
//!  TEXT        [1, [op, [[pid, char]…]], [bufnr, host_id], sender_id]
//!
//!  pid = [[digit, site], …]      op = 1 (delete) | 2 (insert)
//! ```
//!
//! Decoding always goes through [`validate`], which checks the tag, the
//! arity and every field's type, and reports all violations at once.

use instant_core::{Level, Pid, SiteId, Snapshot};
use serde_json::Value;
use std::fmt;

/// Participant id on the wire; doubles as the identifier site id.
pub type ClientId = SiteId;

/// Agent code sent in INFO.
pub const AGENT: i64 = 1;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Character operations
    Text = 1,
    /// Server reply to INFO
    Available = 2,
    /// Ask a peer for the current snapshot
    Request = 3,
    /// Client introduction, first message on a connection
    Info = 5,
    /// Snapshot of a buffer
    Initial = 6,
    /// Peer joined notification
    Connect = 7,
    /// Peer left notification
    Disconnect = 8,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Text),
            2 => Some(Self::Available),
            3 => Some(Self::Request),
            5 => Some(Self::Info),
            6 => Some(Self::Initial),
            7 => Some(Self::Connect),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Number of array elements, tag included.
    fn arity(self) -> usize {
        match self {
            Self::Request => 1,
            Self::Disconnect => 2,
            Self::Connect => 3,
            Self::Info | Self::Available | Self::Text => 4,
            Self::Initial => 5,
        }
    }
}

/// Character operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Delete = 1,
    Insert = 2,
}

impl OpKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Delete),
            2 => Some(Self::Insert),
            _ => None,
        }
    }
}

/// Buffer identity: the creator's buffer number and the host's client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferId {
    pub bufnr: i64,
    pub host_id: ClientId,
}

/// A batch of same-kind character operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOp {
    pub kind: OpKind,
    pub chars: Vec<(Pid, char)>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Info {
        session_share: bool,
        username: String,
        agent: i64,
    },
    Available {
        is_first: bool,
        client_id: ClientId,
        session_share: bool,
    },
    Connect {
        client_id: ClientId,
        username: String,
    },
    Disconnect {
        client_id: ClientId,
    },
    Request,
    Initial {
        buffer_name: String,
        buffer: BufferId,
        pids: Vec<Pid>,
        lines: Vec<String>,
    },
    Text {
        op: TextOp,
        buffer: BufferId,
        sender_id: ClientId,
    },
}

impl Message {
    /// INFO for this client. Session sharing is never requested.
    pub fn info(username: impl Into<String>) -> Self {
        Self::Info {
            session_share: false,
            username: username.into(),
            agent: AGENT,
        }
    }

    pub fn available(is_first: bool, client_id: ClientId) -> Self {
        Self::Available {
            is_first,
            client_id,
            session_share: false,
        }
    }

    pub fn initial(buffer_name: impl Into<String>, buffer: BufferId, snapshot: Snapshot) -> Self {
        Self::Initial {
            buffer_name: buffer_name.into(),
            buffer,
            pids: snapshot.pids,
            lines: snapshot.lines,
        }
    }

    pub fn text(kind: OpKind, chars: Vec<(Pid, char)>, buffer: BufferId, sender_id: ClientId) -> Self {
        Self::Text {
            op: TextOp { kind, chars },
            buffer,
            sender_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Info { .. } => MessageType::Info,
            Self::Available { .. } => MessageType::Available,
            Self::Connect { .. } => MessageType::Connect,
            Self::Disconnect { .. } => MessageType::Disconnect,
            Self::Request => MessageType::Request,
            Self::Initial { .. } => MessageType::Initial,
            Self::Text { .. } => MessageType::Text,
        }
    }

    /// JSON array form of this message.
    pub fn to_value(&self) -> Value {
        let tag = Value::from(self.message_type().code());
        let fields = match self {
            Self::Info {
                session_share,
                username,
                agent,
            } => vec![
                Value::from(*session_share),
                Value::from(username.as_str()),
                Value::from(*agent),
            ],
            Self::Available {
                is_first,
                client_id,
                session_share,
            } => vec![
                Value::from(*is_first),
                Value::from(*client_id),
                Value::from(*session_share),
            ],
            Self::Connect { client_id, username } => {
                vec![Value::from(*client_id), Value::from(username.as_str())]
            }
            Self::Disconnect { client_id } => vec![Value::from(*client_id)],
            Self::Request => Vec::new(),
            Self::Initial {
                buffer_name,
                buffer,
                pids,
                lines,
            } => vec![
                Value::from(buffer_name.as_str()),
                buffer_value(buffer),
                Value::Array(pids.iter().map(pid_value).collect()),
                Value::Array(lines.iter().map(|l| Value::from(l.as_str())).collect()),
            ],
            Self::Text {
                op,
                buffer,
                sender_id,
            } => vec![
                Value::Array(vec![
                    Value::from(op.kind.code()),
                    Value::Array(
                        op.chars
                            .iter()
                            .map(|(p, c)| Value::Array(vec![pid_value(p), Value::from(c.to_string())]))
                            .collect(),
                    ),
                ]),
                buffer_value(buffer),
                Value::from(*sender_id),
            ],
        };
        let mut items = Vec::with_capacity(fields.len() + 1);
        items.push(tag);
        items.extend(fields);
        Value::Array(items)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&self.to_value())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        validate(&value)
    }
}

fn pid_value(pid: &Pid) -> Value {
    Value::Array(
        pid.levels()
            .iter()
            .map(|l| Value::Array(vec![Value::from(l.digit), Value::from(l.site)]))
            .collect(),
    )
}

fn buffer_value(buffer: &BufferId) -> Value {
    Value::Array(vec![Value::from(buffer.bufnr), Value::from(buffer.host_id)])
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Message does not match the schema. Carries the offending message and
    /// every violation found.
    Validation {
        message: String,
        violations: Vec<String>,
    },
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { message, violations } => {
                write!(f, "Invalid message {message}: {}", violations.join("; "))
            }
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ───────────────────────────────────────────────────────────────────
// Validation
// ───────────────────────────────────────────────────────────────────

/// Field reader that records a violation for every missing or mistyped field.
struct Fields<'a> {
    items: &'a [Value],
    violations: Vec<String>,
}

impl<'a> Fields<'a> {
    fn get(&mut self, index: usize, name: &str) -> Option<&'a Value> {
        let value = self.items.get(index);
        if value.is_none() {
            self.violations.push(format!("missing field {index} ({name})"));
        }
        value
    }

    fn fail<T>(&mut self, index: usize, name: &str, expected: &str) -> Option<T> {
        self.violations
            .push(format!("field {index} ({name}): expected {expected}"));
        None
    }

    fn bool(&mut self, index: usize, name: &str) -> Option<bool> {
        match self.get(index, name)?.as_bool() {
            Some(b) => Some(b),
            None => self.fail(index, name, "boolean"),
        }
    }

    fn int(&mut self, index: usize, name: &str) -> Option<i64> {
        match self.get(index, name)?.as_i64() {
            Some(n) => Some(n),
            None => self.fail(index, name, "integer"),
        }
    }

    fn client_id(&mut self, index: usize, name: &str) -> Option<ClientId> {
        match self.get(index, name)?.as_u64().and_then(|n| ClientId::try_from(n).ok()) {
            Some(id) => Some(id),
            None => self.fail(index, name, "client id"),
        }
    }

    fn string(&mut self, index: usize, name: &str) -> Option<String> {
        match self.get(index, name)?.as_str() {
            Some(s) => Some(s.to_owned()),
            None => self.fail(index, name, "string"),
        }
    }

    fn buffer(&mut self, index: usize, name: &str) -> Option<BufferId> {
        let parsed = self.get(index, name)?.as_array().and_then(|pair| match pair.as_slice() {
            [bufnr, host_id] => Some(BufferId {
                bufnr: bufnr.as_i64()?,
                host_id: host_id.as_u64().and_then(|n| ClientId::try_from(n).ok())?,
            }),
            _ => None,
        });
        match parsed {
            Some(b) => Some(b),
            None => self.fail(index, name, "[bufnr, host_id]"),
        }
    }

    fn pids(&mut self, index: usize, name: &str) -> Option<Vec<Pid>> {
        let Some(list) = self.get(index, name)?.as_array() else {
            return self.fail(index, name, "list of identifiers");
        };
        let mut pids = Vec::with_capacity(list.len());
        for (i, v) in list.iter().enumerate() {
            match parse_pid(v) {
                Ok(p) => pids.push(p),
                Err(e) => {
                    self.violations.push(format!("field {index} ({name})[{i}]: {e}"));
                }
            }
        }
        (pids.len() == list.len()).then_some(pids)
    }

    fn lines(&mut self, index: usize, name: &str) -> Option<Vec<String>> {
        let lines = self.get(index, name)?.as_array().and_then(|list| {
            list.iter()
                .map(|l| l.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        });
        match lines {
            Some(l) => Some(l),
            None => self.fail(index, name, "list of strings"),
        }
    }

    fn op(&mut self, index: usize, name: &str) -> Option<TextOp> {
        let Some([code, chars]) = self.get(index, name)?.as_array().map(Vec::as_slice) else {
            return self.fail(index, name, "[op, [[pid, char]…]]");
        };
        let kind = code.as_u64().and_then(OpKind::from_code);
        if kind.is_none() {
            self.violations
                .push(format!("field {index} ({name}): unknown operation {code}"));
        }
        let Some(list) = chars.as_array() else {
            return self.fail(index, name, "list of [pid, char]");
        };
        let mut out = Vec::with_capacity(list.len());
        for (i, entry) in list.iter().enumerate() {
            match parse_char_op(entry) {
                Ok(pair) => out.push(pair),
                Err(e) => {
                    self.violations.push(format!("field {index} ({name})[{i}]: {e}"));
                }
            }
        }
        if out.len() != list.len() {
            return None;
        }
        Some(TextOp { kind: kind?, chars: out })
    }
}

fn parse_pid(value: &Value) -> Result<Pid, String> {
    let levels = value
        .as_array()
        .ok_or_else(|| "identifier must be a list of [digit, site]".to_string())?;
    let levels = levels
        .iter()
        .map(|level| match level.as_array().map(Vec::as_slice) {
            Some([digit, site]) => {
                let digit = digit.as_u64().ok_or("digit must be a non-negative integer")?;
                let site = site
                    .as_u64()
                    .and_then(|s| SiteId::try_from(s).ok())
                    .ok_or("site must be a client id")?;
                Ok(Level::new(digit, site))
            }
            _ => Err("level must be [digit, site]"),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Pid::from_levels(levels).map_err(|e| e.to_string())
}

fn parse_char_op(value: &Value) -> Result<(Pid, char), String> {
    let Some([pid, ch]) = value.as_array().map(Vec::as_slice) else {
        return Err("expected [pid, char]".to_string());
    };
    let pid = parse_pid(pid)?;
    let mut chars = ch.as_str().ok_or("char must be a string")?.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok((pid, c)),
        _ => Err("char must be exactly one character".to_string()),
    }
}

/// Check `value` against the message schema and convert it.
pub fn validate(value: &Value) -> Result<Message, ProtocolError> {
    let invalid = |violations: Vec<String>| ProtocolError::Validation {
        message: value.to_string(),
        violations,
    };

    let Some(items) = value.as_array() else {
        return Err(invalid(vec!["message must be an array".to_string()]));
    };
    let Some(tag) = items.first() else {
        return Err(invalid(vec!["message is empty".to_string()]));
    };
    let Some(msg_type) = tag.as_u64().and_then(MessageType::from_code) else {
        return Err(invalid(vec![format!("unknown message type {tag}")]));
    };

    let mut f = Fields {
        items,
        violations: Vec::new(),
    };
    if items.len() != msg_type.arity() {
        f.violations.push(format!(
            "{msg_type:?} expects {} fields, got {}",
            msg_type.arity() - 1,
            items.len() - 1
        ));
    }

    let message = match msg_type {
        MessageType::Info => {
            let session_share = f.bool(1, "session_share");
            let username = f.string(2, "username");
            let agent = f.int(3, "agent");
            match (session_share, username, agent) {
                (Some(session_share), Some(username), Some(agent)) => Some(Message::Info {
                    session_share,
                    username,
                    agent,
                }),
                _ => None,
            }
        }
        MessageType::Available => {
            let is_first = f.bool(1, "is_first");
            let client_id = f.client_id(2, "client_id");
            let session_share = f.bool(3, "session_share");
            match (is_first, client_id, session_share) {
                (Some(is_first), Some(client_id), Some(session_share)) => Some(Message::Available {
                    is_first,
                    client_id,
                    session_share,
                }),
                _ => None,
            }
        }
        MessageType::Connect => {
            let client_id = f.client_id(1, "client_id");
            let username = f.string(2, "username");
            match (client_id, username) {
                (Some(client_id), Some(username)) => Some(Message::Connect { client_id, username }),
                _ => None,
            }
        }
        MessageType::Disconnect => f
            .client_id(1, "client_id")
            .map(|client_id| Message::Disconnect { client_id }),
        MessageType::Request => Some(Message::Request),
        MessageType::Initial => {
            let buffer_name = f.string(1, "buffer_name");
            let buffer = f.buffer(2, "buffer");
            let pids = f.pids(3, "pids");
            let lines = f.lines(4, "lines");
            match (buffer_name, buffer, pids, lines) {
                (Some(buffer_name), Some(buffer), Some(pids), Some(lines)) => Some(Message::Initial {
                    buffer_name,
                    buffer,
                    pids,
                    lines,
                }),
                _ => None,
            }
        }
        MessageType::Text => {
            let op = f.op(1, "op");
            let buffer = f.buffer(2, "buffer");
            let sender_id = f.client_id(3, "sender_id");
            match (op, buffer, sender_id) {
                (Some(op), Some(buffer), Some(sender_id)) => Some(Message::Text {
                    op,
                    buffer,
                    sender_id,
                }),
                _ => None,
            }
        }
    };

    match message {
        Some(m) if f.violations.is_empty() => Ok(m),
        _ => Err(invalid(f.violations)),
    }
}
