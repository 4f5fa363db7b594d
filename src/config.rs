use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Url};

use crate::{Callback, EventType, Handler, PolicyViolation, Result, WrapperError};

/// Closed set of configuration keys accepted by `configure`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ConfigField {
    Uri,
    Asynchronous,
    Verb,
    Data,
    RequestHeaders,
    RequestType,
    ResponseType,
    Handlers,
    Attempts,
    AttemptInterval,
    Timeout,
    PostTimeout,
}

impl ConfigField {
    pub const ALL: [ConfigField; 12] = [
        ConfigField::Uri,
        ConfigField::Asynchronous,
        ConfigField::Verb,
        ConfigField::Data,
        ConfigField::RequestHeaders,
        ConfigField::RequestType,
        ConfigField::ResponseType,
        ConfigField::Handlers,
        ConfigField::Attempts,
        ConfigField::AttemptInterval,
        ConfigField::Timeout,
        ConfigField::PostTimeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uri => "URI",
            Self::Asynchronous => "asynchronous",
            Self::Verb => "verb",
            Self::Data => "data",
            Self::RequestHeaders => "requestHeaders",
            Self::RequestType => "requestType",
            Self::ResponseType => "responseType",
            Self::Handlers => "handlers",
            Self::Attempts => "attempts",
            Self::AttemptInterval => "attemptInterval",
            Self::Timeout => "timeout",
            Self::PostTimeout => "postTimeout",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == name)
    }

    /// Every recognized key, in declaration order.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|field| field.as_str()).collect()
    }

    fn expected(self) -> &'static str {
        match self {
            Self::Uri => "the construction URI",
            Self::Asynchronous => "a boolean",
            Self::Verb => "a non-empty HTTP method token",
            Self::Data => "a string, bytes, JSON or null",
            Self::RequestHeaders => "a map of valid header names to valid header values",
            Self::RequestType => "a mime type string or null",
            Self::ResponseType => "a non-empty mime type string",
            Self::Handlers => "a map of event names to handlers",
            Self::Attempts => "a positive integer",
            Self::AttemptInterval | Self::Timeout => "an integer number of seconds",
            Self::PostTimeout => "a callback or null",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dynamically typed configuration value.
#[derive(Clone)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Headers(Vec<(String, String)>),
    /// Event name to handler pairs; names are validated on `configure`.
    Handlers(Vec<(String, Handler)>),
    Callback(Callback),
    /// JSON that has no more specific representation.
    Json(serde_json::Value),
}

impl ConfigValue {
    /// Builds a header table value.
    pub fn headers<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Headers(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    /// Builds a handler table value.
    pub fn handlers<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Handler)>,
        K: Into<String>,
    {
        Self::Handlers(
            pairs
                .into_iter()
                .map(|(name, handler)| (name.into(), handler))
                .collect(),
        )
    }

    fn from_json(field: &str, value: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Self::Null,
            Json::Bool(flag) => Self::Bool(*flag),
            Json::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .unwrap_or_else(|| Self::Json(value.clone())),
            Json::String(text) => Self::Text(text.clone()),
            Json::Object(map) if field == ConfigField::RequestHeaders.as_str() => {
                let pairs: Option<Vec<(String, String)>> = map
                    .iter()
                    .map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_owned())))
                    .collect();
                pairs
                    .map(Self::Headers)
                    .unwrap_or_else(|| Self::Json(value.clone()))
            }
            other => Self::Json(other.clone()),
        }
    }
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(flag) => f.debug_tuple("Bool").field(flag).finish(),
            Self::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Headers(pairs) => f.debug_tuple("Headers").field(pairs).finish(),
            Self::Handlers(pairs) => {
                let names: Vec<&str> = pairs.iter().map(|(name, _)| name.as_str()).collect();
                f.debug_tuple("Handlers").field(&names).finish()
            }
            Self::Callback(_) => f.write_str("Callback(..)"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
        }
    }
}

impl PartialEq for ConfigValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Headers(a), Self::Headers(b)) => a == b,
            (Self::Handlers(a), Self::Handlers(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, ha), (kb, hb))| ka == kb && Rc::ptr_eq(ha, hb))
            }
            (Self::Callback(a), Self::Callback(b)) => Rc::ptr_eq(a, b),
            (Self::Json(a), Self::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for ConfigValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Callback> for ConfigValue {
    fn from(value: Callback) -> Self {
        Self::Callback(value)
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<ConfigValue>> From<Option<T>> for ConfigValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Ordered set of configuration changes passed to `configure`.
///
/// Keys are kept as written so unrecognized ones can be reported by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialConfig {
    entries: Vec<(String, ConfigValue)>,
}

impl PartialConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw `key = value` entry.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn asynchronous(self, asynchronous: bool) -> Self {
        self.set(ConfigField::Asynchronous.as_str(), asynchronous)
    }

    pub fn verb(self, verb: impl Into<String>) -> Self {
        self.set(ConfigField::Verb.as_str(), verb.into())
    }

    /// Sets the request body. Accepts text, bytes, JSON or `None`.
    pub fn data(self, body: impl Into<ConfigValue>) -> Self {
        self.set(ConfigField::Data.as_str(), body)
    }

    pub fn request_headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.set(
            ConfigField::RequestHeaders.as_str(),
            ConfigValue::headers(headers),
        )
    }

    pub fn request_type(self, mime: impl Into<String>) -> Self {
        self.set(ConfigField::RequestType.as_str(), mime.into())
    }

    pub fn response_type(self, mime: impl Into<String>) -> Self {
        self.set(ConfigField::ResponseType.as_str(), mime.into())
    }

    /// Adds one handler; repeated calls merge into the handler table.
    pub fn handler(self, event: EventType, handler: Handler) -> Self {
        self.set(
            ConfigField::Handlers.as_str(),
            ConfigValue::handlers([(event.as_str(), handler)]),
        )
    }

    pub fn attempts(self, attempts: u32) -> Self {
        self.set(ConfigField::Attempts.as_str(), attempts)
    }

    /// Seconds between retries.
    pub fn attempt_interval(self, seconds: i64) -> Self {
        self.set(ConfigField::AttemptInterval.as_str(), seconds)
    }

    /// Per-attempt timeout in seconds; `0` disables it.
    pub fn timeout(self, seconds: i64) -> Self {
        self.set(ConfigField::Timeout.as_str(), seconds)
    }

    pub fn post_timeout(self, f: impl Fn() + 'static) -> Self {
        let callback: Callback = Rc::new(f);
        self.set(ConfigField::PostTimeout.as_str(), callback)
    }

    /// Loads entries from a JSON object, keeping its key order.
    ///
    /// Handlers and callbacks have no JSON form; such values are kept as
    /// [`ConfigValue::Json`] and rejected when applied.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| WrapperError::InvalidArgumentType {
                field: "configuration".to_owned(),
                expected: "a JSON object",
            })?;

        Ok(Self {
            entries: object
                .iter()
                .map(|(key, value)| (key.clone(), ConfigValue::from_json(key, value)))
                .collect(),
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Full configuration owned by one request wrapper.
///
/// Time fields are stored in milliseconds and reported in seconds.
#[derive(Clone)]
pub struct RequestConfiguration {
    target: Url,
    asynchronous: bool,
    verb: String,
    data: Option<Body>,
    request_headers: Vec<(String, String)>,
    request_type: Option<String>,
    response_type: String,
    handlers: BTreeMap<EventType, Handler>,
    attempts: u32,
    attempt_interval_ms: i64,
    timeout_ms: i64,
    post_timeout: Option<Callback>,
}

impl fmt::Debug for RequestConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfiguration")
            .field("target", &self.target.as_str())
            .field("asynchronous", &self.asynchronous)
            .field("verb", &self.verb)
            .field("data", &self.data)
            .field("request_headers", &self.request_headers)
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("attempts", &self.attempts)
            .field("attempt_interval_ms", &self.attempt_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("post_timeout", &self.post_timeout.is_some())
            .finish()
    }
}

impl RequestConfiguration {
    pub(crate) fn new(target: Url, load: Handler, error: Handler) -> Self {
        let mut handlers = BTreeMap::new();
        handlers.insert(EventType::Load, load);
        handlers.insert(EventType::Error, error);

        Self {
            target,
            asynchronous: true,
            verb: "get".to_owned(),
            data: None,
            request_headers: Vec::new(),
            request_type: None,
            response_type: "text/plain".to_owned(),
            handlers,
            attempts: 1,
            attempt_interval_ms: 3_000,
            timeout_ms: 0,
            post_timeout: None,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// The request body encoded for the wire.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.data.as_ref().map(Body::encode)
    }

    pub fn request_headers(&self) -> &[(String, String)] {
        &self.request_headers
    }

    pub fn request_type(&self) -> Option<&str> {
        self.request_type.as_deref()
    }

    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    pub fn handler(&self, event: EventType) -> Option<&Handler> {
        self.handlers.get(&event)
    }

    /// Registered handlers in event order.
    pub fn handlers(&self) -> impl Iterator<Item = (EventType, &Handler)> {
        self.handlers.iter().map(|(event, handler)| (*event, handler))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn attempt_interval_secs(&self) -> i64 {
        self.attempt_interval_ms / 1_000
    }

    pub fn timeout_secs(&self) -> i64 {
        self.timeout_ms / 1_000
    }

    pub fn attempt_interval(&self) -> Duration {
        millis(self.attempt_interval_ms)
    }

    /// Per-attempt timeout; zero when disabled.
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }

    pub fn post_timeout(&self) -> Option<&Callback> {
        self.post_timeout.as_ref()
    }

    /// Reads a field back in its caller-facing form.
    pub fn get(&self, field: ConfigField) -> ConfigValue {
        match field {
            ConfigField::Uri => ConfigValue::Text(self.target.to_string()),
            ConfigField::Asynchronous => ConfigValue::Bool(self.asynchronous),
            ConfigField::Verb => ConfigValue::Text(self.verb.clone()),
            ConfigField::Data => self.data.clone().map_or(ConfigValue::Null, Body::into_value),
            ConfigField::RequestHeaders => ConfigValue::Headers(self.request_headers.clone()),
            ConfigField::RequestType => self.request_type.clone().into(),
            ConfigField::ResponseType => ConfigValue::Text(self.response_type.clone()),
            ConfigField::Handlers => ConfigValue::Handlers(
                self.handlers
                    .iter()
                    .map(|(event, handler)| (event.as_str().to_owned(), handler.clone()))
                    .collect(),
            ),
            ConfigField::Attempts => ConfigValue::Int(self.attempts.into()),
            ConfigField::AttemptInterval => ConfigValue::Int(self.attempt_interval_secs()),
            ConfigField::Timeout => ConfigValue::Int(self.timeout_secs()),
            ConfigField::PostTimeout => self.post_timeout.clone().into(),
        }
    }

    /// Returns a copy with `partial` applied in order, or the first error.
    pub(crate) fn merged(&self, partial: &PartialConfig) -> Result<Self> {
        let mut next = self.clone();
        for (key, value) in partial.entries() {
            next.apply(key, value)?;
        }
        next.check_timing_policy()?;
        Ok(next)
    }

    fn apply(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        let field = ConfigField::from_name(key).ok_or_else(|| WrapperError::UnknownConfigField {
            field: key.to_owned(),
            accepted: ConfigField::names(),
        })?;
        let invalid = || WrapperError::InvalidArgumentType {
            field: field.as_str().to_owned(),
            expected: field.expected(),
        };

        match (field, value) {
            (ConfigField::Uri, ConfigValue::Text(uri)) => {
                let same = Url::parse(uri).is_ok_and(|url| url == self.target);
                if !same {
                    return Err(PolicyViolation::ImmutableTarget.into());
                }
            }
            (ConfigField::Asynchronous, ConfigValue::Bool(flag)) => self.asynchronous = *flag,
            (ConfigField::Verb, ConfigValue::Text(verb))
                if Method::from_bytes(verb.as_bytes()).is_ok() =>
            {
                self.verb = verb.clone();
            }
            (ConfigField::Data, ConfigValue::Null) => self.data = None,
            (ConfigField::Data, ConfigValue::Text(text)) => {
                self.data = Some(Body::Text(text.clone()));
            }
            (ConfigField::Data, ConfigValue::Bytes(bytes)) => {
                self.data = Some(Body::Bytes(bytes.clone()));
            }
            (ConfigField::Data, ConfigValue::Json(json)) => {
                self.data = Some(Body::Json(json.clone()));
            }
            (ConfigField::RequestHeaders, ConfigValue::Headers(pairs)) => {
                self.request_headers = normalize_headers(pairs).ok_or_else(invalid)?;
            }
            (ConfigField::RequestType, ConfigValue::Null) => self.request_type = None,
            (ConfigField::RequestType, ConfigValue::Text(mime)) => {
                self.request_type = Some(mime.clone());
            }
            (ConfigField::ResponseType, ConfigValue::Text(mime)) if !mime.trim().is_empty() => {
                self.response_type = mime.clone();
            }
            (ConfigField::Handlers, ConfigValue::Handlers(pairs)) => {
                for (name, handler) in pairs {
                    let event = EventType::from_name(name).ok_or_else(|| {
                        WrapperError::UnknownHandlerType {
                            event: name.clone(),
                            available: EventType::NAMES.to_vec(),
                        }
                    })?;
                    self.handlers.insert(event, handler.clone());
                }
            }
            (ConfigField::Attempts, ConfigValue::Int(attempts)) => {
                self.attempts = u32::try_from(*attempts)
                    .ok()
                    .filter(|attempts| *attempts >= 1)
                    .ok_or_else(invalid)?;
            }
            (ConfigField::AttemptInterval, ConfigValue::Int(seconds)) => {
                self.attempt_interval_ms = seconds.checked_mul(1_000).ok_or_else(invalid)?;
            }
            (ConfigField::Timeout, ConfigValue::Int(seconds)) => {
                self.timeout_ms = seconds.checked_mul(1_000).ok_or_else(invalid)?;
            }
            (ConfigField::PostTimeout, ConfigValue::Null) => self.post_timeout = None,
            (ConfigField::PostTimeout, ConfigValue::Callback(callback)) => {
                self.post_timeout = Some(callback.clone());
            }
            _ => return Err(invalid()),
        }
        Ok(())
    }

    fn check_timing_policy(&self) -> std::result::Result<(), PolicyViolation> {
        if self.timeout_ms == 0 {
            return Ok(());
        }
        if self.timeout_ms < 1_000 {
            return Err(PolicyViolation::TimeoutBelowMinimum);
        }
        if !self.asynchronous {
            return Err(PolicyViolation::TimeoutRequiresAsync);
        }
        if self.attempts > 1 && self.attempt_interval_ms < 1_000 {
            return Err(PolicyViolation::IntervalBelowMinimum);
        }
        Ok(())
    }
}

/// Request body kept in the form it was configured with.
#[derive(Clone, Debug, PartialEq)]
enum Body {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.clone().into_bytes(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }

    fn into_value(self) -> ConfigValue {
        match self {
            Self::Text(text) => ConfigValue::Text(text),
            Self::Bytes(bytes) => ConfigValue::Bytes(bytes),
            Self::Json(value) => ConfigValue::Json(value),
        }
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Validates header pairs and drops earlier duplicates of the same name.
fn normalize_headers(pairs: &[(String, String)]) -> Option<Vec<(String, String)>> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        HeaderName::from_bytes(name.as_bytes()).ok()?;
        HeaderValue::from_str(value).ok()?;
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        headers.push((name.clone(), value.clone()));
    }
    Some(headers)
}
