use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when a trace or span identifier is not valid hex
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier {0:?} is longer than {1} hex digits")]
    TooLong(String, usize),
    #[error("identifier {0:?} is not hexadecimal")]
    NotHex(String),
}

fn parse_hex(s: &str, max_digits: usize) -> Result<u128, IdParseError> {
    if s.is_empty() {
        return Err(IdParseError::Empty);
    }
    if s.len() > max_digits {
        return Err(IdParseError::TooLong(s.to_string(), max_digits));
    }
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IdParseError::NotHex(s.to_string()));
    }
    u128::from_str_radix(s, 16).map_err(|_| IdParseError::NotHex(s.to_string()))
}

/// 128-bit trace identifier.
///
/// Renders as 16 hex digits when the high word is zero and 32 otherwise,
/// matching the way Jaeger prints trace IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u128);

impl TraceId {
    pub fn new(high: u64, low: u64) -> Self {
        Self(((high as u128) << 64) | low as u128)
    }

    pub fn high(&self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn low(&self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high() == 0 {
            write!(f, "{:016x}", self.low())
        } else {
            write!(f, "{:016x}{:016x}", self.high(), self.low())
        }
    }
}

impl FromStr for TraceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex(s, 32).map(TraceId)
    }
}

/// 64-bit span identifier, rendered as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex(s, 16).map(|v| SpanId(v as u64))
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(TraceId);
string_serde!(SpanId);

/// How a span relates to one of its declared parents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    ChildOf,
    FollowsFrom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default = "default_ref_type")]
    pub ref_type: RefType,
}

fn default_ref_type() -> RefType {
    RefType::ChildOf
}

/// A tag or log field. Values are JSON scalars as reported by the tracer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: serde_json::Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Value rendered without JSON quoting for strings
    pub fn value_text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: Vec<KeyValue>,
}

impl Log {
    /// `key: value` lines for every field of this log record
    pub fn render(&self) -> String {
        let mut value = String::new();
        for field in &self.fields {
            value.push_str(&field.key);
            value.push_str(": ");
            value.push_str(&field.value_text());
            value.push('\n');
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub service_name: String,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

/// A single span as delivered by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: String,
    #[serde(default)]
    pub references: Vec<SpanRef>,
    #[serde(default)]
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub duration_ns: u64,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
    #[serde(default)]
    pub logs: Vec<Log>,
    pub process: Process,
    #[serde(default)]
    pub process_id: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    Internal,
    Unspecified,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
            SpanKind::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse category of the work a span performed, derived from its tag namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Http,
    Db,
    Rpc,
    Messaging,
    Internal,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Http => "http",
            ActionKind::Db => "db",
            ActionKind::Rpc => "rpc",
            ActionKind::Messaging => "messaging",
            ActionKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Span {
    pub fn service_name(&self) -> &str {
        &self.process.service_name
    }

    pub fn find_tag(&self, key: &str) -> Option<&KeyValue> {
        self.tags.iter().find(|tag| tag.key == key)
    }

    pub fn span_kind(&self) -> SpanKind {
        match self.find_tag("span.kind").map(|t| t.value_text()).as_deref() {
            Some("client") => SpanKind::Client,
            Some("server") => SpanKind::Server,
            Some("producer") => SpanKind::Producer,
            Some("consumer") => SpanKind::Consumer,
            Some("internal") => SpanKind::Internal,
            _ => SpanKind::Unspecified,
        }
    }

    pub fn action_kind(&self) -> ActionKind {
        let has_prefix = |prefix: &str| self.tags.iter().any(|t| t.key.starts_with(prefix));
        if has_prefix("http.") {
            ActionKind::Http
        } else if has_prefix("db.") {
            ActionKind::Db
        } else if has_prefix("rpc.") {
            ActionKind::Rpc
        } else if has_prefix("messaging.") {
            ActionKind::Messaging
        } else {
            ActionKind::Internal
        }
    }

    /// Outcome of the span: an explicit status code when one was recorded,
    /// `error` when the span carries `error=true`, otherwise `ok`.
    pub fn action_status(&self) -> String {
        if let Some(code) = self
            .find_tag("http.status_code")
            .or_else(|| self.find_tag("rpc.grpc.status_code"))
        {
            return code.value_text();
        }
        let errored = self.find_tag("error").is_some_and(|t| match &t.value {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        });
        if errored {
            "error".to_string()
        } else {
            "ok".to_string()
        }
    }

    /// Canonical text rendering used as summarizer input
    pub fn render(&self) -> String {
        format!(
            "service name: {}\noperation name: {}\nspan id: {}\nduration: {} nanoseconds\nstart time: {}\nspan kind: {}\naction kind: {}\n",
            self.service_name(),
            self.operation_name,
            self.span_id,
            self.duration_ns,
            self.start_time.to_rfc3339(),
            self.span_kind(),
            self.action_kind(),
        )
    }

    /// All log records rendered back to back, separated by blank lines
    pub fn render_logs(&self) -> String {
        let mut raw = String::new();
        for log in &self.logs {
            raw.push_str(&log.render());
            raw.push('\n');
        }
        raw
    }

    pub fn render_tags(&self) -> String {
        self.tags
            .iter()
            .map(|t| format!("{}: {}", t.key, t.value_text()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
