//! Core event types for errwatch
//!
//! This module defines the data structures the host application hands to the
//! engine: exception and log events, their severity level, request metadata and
//! captured stack frames. It also owns the normalization applied to every event
//! before it is fingerprinted, so oversized or malformed payloads are trimmed
//! rather than rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Free-form key/value payload attached to events and error groups
pub type Context = Map<String, Value>;

/// Classification stored for log events
pub const LOG_CLASSIFICATION: &str = "Log";

const MAX_MESSAGE_LEN: usize = 4096;
const MAX_IDENT_LEN: usize = 255;
const MAX_URL_LEN: usize = 2048;
const MAX_METHOD_LEN: usize = 10;
const MAX_IP_LEN: usize = 45;
const MAX_STACK_FRAMES: usize = 50;
const EMPTY_MESSAGE: &str = "(empty message)";

/// Log level of an event, ordered from least to most urgent
///
/// Serialized as its lowercase name. Deserialization is lenient: case is
/// ignored, `warn` is accepted and unknown names become `Level::Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    /// Level name the engine does not recognise
    Other,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Other => "other",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        }
    }

    /// Parse a level name, mapping anything unknown to `Level::Other`
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(Level::Other)
    }
}

impl Serialize for Level {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Level::parse_lenient(&name))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "notice" => Ok(Level::Notice),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" => Ok(Level::Critical),
            "alert" => Ok(Level::Alert),
            "emergency" => Ok(Level::Emergency),
            other => Err(format!("unknown level: {}", other)),
        }
    }
}

/// Broad category of an exception, used by the severity scorer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    /// Language-level fatal or type errors
    Fatal,
    /// Runtime-category exceptions
    Runtime,
    /// Everything else, including log events
    #[default]
    #[serde(other)]
    Other,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::Fatal => "fatal",
            ExceptionKind::Runtime => "runtime",
            ExceptionKind::Other => "other",
        }
    }

    /// Best-effort classification from an exception class name
    ///
    /// Used when the event source does not say what kind of exception it
    /// reported. Only the last path segment of the class name is inspected.
    pub fn classify(class: &str) -> Self {
        let short = class
            .rsplit(|c| c == '\\' || c == '.' || c == ':' || c == '/')
            .next()
            .unwrap_or(class);

        match short {
            "Error" | "TypeError" | "ParseError" | "ArithmeticError" | "DivisionByZeroError"
            | "FatalError" | "ArgumentCountError" => ExceptionKind::Fatal,
            s if s.contains("Panic") => ExceptionKind::Fatal,
            s if s.starts_with("Runtime") || s.ends_with("RuntimeException") => {
                ExceptionKind::Runtime
            }
            _ => ExceptionKind::Other,
        }
    }
}

impl FromStr for ExceptionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fatal" => Ok(ExceptionKind::Fatal),
            "runtime" => Ok(ExceptionKind::Runtime),
            "other" => Ok(ExceptionKind::Other),
            other => Err(format!("unknown exception kind: {}", other)),
        }
    }
}

/// One frame of a captured stack trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
    #[serde(default)]
    pub class: Option<String>,
}

/// Request metadata captured alongside an occurrence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestMeta {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RequestMeta {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.method.is_none() && self.client_ip.is_none() && self.user_id.is_none()
    }

    /// Copy over every field that is present in `newer`
    pub fn overlay(&mut self, newer: &RequestMeta) {
        if newer.url.is_some() {
            self.url = newer.url.clone();
        }
        if newer.method.is_some() {
            self.method = newer.method.clone();
        }
        if newer.client_ip.is_some() {
            self.client_ip = newer.client_ip.clone();
        }
        if newer.user_id.is_some() {
            self.user_id = newer.user_id.clone();
        }
    }
}

/// Discriminates exception reports from log reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventKind {
    Exception {
        /// Exception class name
        class: String,
        /// Category used for severity scoring, inferred from `class` if absent
        #[serde(default)]
        kind: Option<ExceptionKind>,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        line: Option<u32>,
        #[serde(default)]
        stack_frames: Vec<StackFrame>,
    },
    Log,
}

/// An error or log event reported by the host application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// When the event happened
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    /// Exception or log discriminator
    #[serde(flatten)]
    pub kind: EventKind,
    /// Reported level
    pub level: Level,
    /// Exception or log message
    pub message: String,
    /// Deployment environment name, empty means "use the configured default"
    #[serde(default)]
    pub environment: String,
    /// Arbitrary structured context; a non-object payload is wrapped as `{"value": ...}`
    #[serde(default, deserialize_with = "deserialize_context")]
    pub context: Context,
    /// Request metadata, when the event happened while serving a request
    #[serde(default)]
    pub request: Option<RequestMeta>,
    /// Logger target of the emitter, used to drop the engine's own diagnostics
    #[serde(default)]
    pub origin: Option<String>,
}

impl Event {
    /// Create an exception event timestamped now
    pub fn exception(
        class: impl Into<String>,
        message: impl Into<String>,
        level: Level,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Exception {
                class: class.into(),
                kind: None,
                file: None,
                line: None,
                stack_frames: Vec::new(),
            },
            level,
            message: message.into(),
            environment: environment.into(),
            context: Context::new(),
            request: None,
            origin: None,
        }
    }

    /// Create a log event timestamped now
    pub fn log(level: Level, message: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::Log,
            level,
            message: message.into(),
            environment: environment.into(),
            context: Context::new(),
            request: None,
            origin: None,
        }
    }

    /// Set the source location of an exception event (no-op for logs)
    pub fn at(mut self, source_file: impl Into<String>, source_line: u32) -> Self {
        if let EventKind::Exception { file, line, .. } = &mut self.kind {
            *file = Some(source_file.into());
            *line = Some(source_line);
        }
        self
    }

    /// Set the exception kind explicitly (no-op for logs)
    pub fn with_kind(mut self, exception_kind: ExceptionKind) -> Self {
        if let EventKind::Exception { kind, .. } = &mut self.kind {
            *kind = Some(exception_kind);
        }
        self
    }

    pub fn with_stack_frames(mut self, frames: Vec<StackFrame>) -> Self {
        if let EventKind::Exception { stack_frames, .. } = &mut self.kind {
            *stack_frames = frames;
        }
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_request(mut self, request: RequestMeta) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Classification stored on the error group
    pub fn classification(&self) -> &str {
        match &self.kind {
            EventKind::Exception { class, .. } => class,
            EventKind::Log => LOG_CLASSIFICATION,
        }
    }

    /// Exception kind for severity scoring; logs are always `Other`
    pub fn exception_kind(&self) -> ExceptionKind {
        match &self.kind {
            EventKind::Exception { class, kind, .. } => {
                kind.unwrap_or_else(|| ExceptionKind::classify(class))
            }
            EventKind::Log => ExceptionKind::Other,
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self.kind, EventKind::Log)
    }

    /// Trim an event into storable shape
    ///
    /// Oversized strings are truncated on UTF-8 boundaries, empty fields get
    /// placeholders and the stack trace is capped. Nothing is ever rejected.
    pub fn normalize(mut self, default_environment: &str) -> Self {
        self.message = if self.message.trim().is_empty() {
            EMPTY_MESSAGE.to_string()
        } else {
            truncate_text(&self.message, MAX_MESSAGE_LEN)
        };

        let environment = self.environment.trim();
        self.environment = if environment.is_empty() {
            truncate_text(default_environment, MAX_IDENT_LEN)
        } else {
            truncate_text(environment, MAX_IDENT_LEN)
        };

        if let EventKind::Exception {
            class,
            file,
            stack_frames,
            ..
        } = &mut self.kind
        {
            if class.trim().is_empty() {
                *class = "UnknownException".to_string();
            }
            *class = truncate_text(class, MAX_IDENT_LEN);
            if let Some(f) = file.as_mut() {
                *f = truncate_text(f, MAX_IDENT_LEN);
            }
            stack_frames.truncate(MAX_STACK_FRAMES);
            for frame in stack_frames.iter_mut() {
                frame.file = truncate_text(&frame.file, MAX_IDENT_LEN);
                frame.function = truncate_text(&frame.function, MAX_IDENT_LEN);
            }
        }

        if let Some(request) = self.request.take() {
            let request = RequestMeta {
                url: request.url.map(|v| truncate_text(&v, MAX_URL_LEN)),
                method: request.method.map(|v| truncate_text(&v, MAX_METHOD_LEN)),
                client_ip: request.client_ip.map(|v| truncate_text(&v, MAX_IP_LEN)),
                user_id: request.user_id.map(|v| truncate_text(&v, MAX_IDENT_LEN)),
            };
            if !request.is_empty() {
                self.request = Some(request);
            }
        }

        self
    }
}

fn deserialize_context<'de, D>(deserializer: D) -> Result<Context, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(wrap_context(Value::deserialize(deserializer)?))
}

/// Coerce an arbitrary JSON value into an object map
pub fn wrap_context(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        Value::Null => Context::new(),
        other => {
            let mut map = Context::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Truncate text to a maximum byte length, appending "..." when shortened
///
/// Cuts on a UTF-8 character boundary so multi-byte characters never panic.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    if max_length < 3 {
        return ".".repeat(max_length);
    }

    let mut truncate_at = max_length - 3;
    while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }

    format!("{}...", &text[..truncate_at])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json_roundtrip_exception() {
        let event = Event::exception("NullPointer", "x undefined", Level::Error, "prod")
            .at("src/app.rs", 10)
            .with_context("user", json!("alice"));

        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, decoded);
        assert!(json.contains("\"type\":\"exception\""));
    }

    #[test]
    fn test_event_from_minimal_json() {
        let decoded: Event =
            serde_json::from_str(r#"{"type":"log","level":"warning","message":"disk low"}"#)
                .unwrap();
        assert!(decoded.is_log());
        assert_eq!(decoded.level, Level::Warning);
        assert!(decoded.environment.is_empty());
        assert!(decoded.context.is_empty());
    }

    #[test]
    fn test_non_object_context_is_wrapped() {
        let decoded: Event = serde_json::from_str(
            r#"{"type":"log","level":"error","message":"m","context":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(decoded.context.get("value"), Some(&json!([1, 2])));

        let decoded: Event =
            serde_json::from_str(r#"{"type":"log","level":"error","message":"m","context":null}"#)
                .unwrap();
        assert!(decoded.context.is_empty());
    }

    #[test]
    fn test_unknown_level_deserializes_as_other() {
        let decoded: Event =
            serde_json::from_str(r#"{"type":"log","level":"verbose","message":"m"}"#).unwrap();
        assert_eq!(decoded.level, Level::Other);
    }

    #[test]
    fn test_level_names_deserialize_leniently() {
        let decoded: Event =
            serde_json::from_str(r#"{"type":"log","level":"ERROR","message":"m"}"#).unwrap();
        assert_eq!(decoded.level, Level::Error);

        let levels: Vec<Level> = serde_json::from_str(r#"["warn", " Critical ", "other"]"#).unwrap();
        assert_eq!(levels, vec![Level::Warning, Level::Critical, Level::Other]);

        assert_eq!(serde_json::to_string(&Level::Emergency).unwrap(), r#""emergency""#);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Critical < Level::Emergency);
    }

    #[test]
    fn test_level_parse_lenient() {
        assert_eq!(Level::parse_lenient("WARN"), Level::Warning);
        assert_eq!(Level::parse_lenient("emergency"), Level::Emergency);
        assert_eq!(Level::parse_lenient("nope"), Level::Other);
    }

    #[test]
    fn test_exception_kind_classification() {
        assert_eq!(ExceptionKind::classify("TypeError"), ExceptionKind::Fatal);
        assert_eq!(ExceptionKind::classify("App\\Errors\\ParseError"), ExceptionKind::Fatal);
        assert_eq!(ExceptionKind::classify("std::panic"), ExceptionKind::Other);
        assert_eq!(ExceptionKind::classify("WorkerPanic"), ExceptionKind::Fatal);
        assert_eq!(ExceptionKind::classify("RuntimeException"), ExceptionKind::Runtime);
        assert_eq!(
            ExceptionKind::classify("Foo\\QueueRuntimeException"),
            ExceptionKind::Runtime
        );
        assert_eq!(ExceptionKind::classify("NullPointer"), ExceptionKind::Other);
    }

    #[test]
    fn test_explicit_kind_wins_over_classification() {
        let event = Event::exception("NullPointer", "m", Level::Error, "prod")
            .with_kind(ExceptionKind::Runtime);
        assert_eq!(event.exception_kind(), ExceptionKind::Runtime);
        assert_eq!(
            Event::log(Level::Error, "m", "prod").exception_kind(),
            ExceptionKind::Other
        );
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let event = Event::log(Level::Error, "   ", "").normalize("production");
        assert_eq!(event.message, EMPTY_MESSAGE);
        assert_eq!(event.environment, "production");
    }

    #[test]
    fn test_normalize_truncates_oversized_fields() {
        let event = Event::exception("C".repeat(600), "m".repeat(10_000), Level::Error, "prod")
            .at("f".repeat(400), 1)
            .with_stack_frames(
                (0..80)
                    .map(|i| StackFrame {
                        file: "a.rs".to_string(),
                        line: i,
                        function: "run".to_string(),
                        class: None,
                    })
                    .collect(),
            )
            .with_request(RequestMeta {
                method: Some("PROPFINDXXXXXXXX".to_string()),
                ..Default::default()
            })
            .normalize("production");

        assert!(event.message.len() <= MAX_MESSAGE_LEN);
        assert!(event.message.ends_with("..."));
        assert!(event.classification().len() <= MAX_IDENT_LEN);
        match &event.kind {
            EventKind::Exception {
                file, stack_frames, ..
            } => {
                assert!(file.as_ref().unwrap().len() <= MAX_IDENT_LEN);
                assert_eq!(stack_frames.len(), MAX_STACK_FRAMES);
            }
            EventKind::Log => panic!("expected exception"),
        }
        assert!(event.request.unwrap().method.unwrap().len() <= MAX_METHOD_LEN);
    }

    #[test]
    fn test_normalize_drops_empty_request() {
        let event = Event::log(Level::Error, "m", "prod")
            .with_request(RequestMeta::default())
            .normalize("production");
        assert!(event.request.is_none());
    }

    #[test]
    fn test_truncate_text_utf8_safety() {
        let test_cases = vec!["🚀🎉🌟", "世界你好", "Здравствуй мир", "café résumé naïve"];

        for test_str in test_cases {
            for max_len in [0, 2, 5, 10, 15, 20] {
                let result = truncate_text(test_str, max_len);
                assert!(result.len() <= max_len || test_str.len() <= max_len);
                if test_str.len() > max_len && max_len >= 3 {
                    assert!(result.ends_with("..."));
                }
            }
        }

        assert_eq!(truncate_text("short", 256), "short");
    }
}
