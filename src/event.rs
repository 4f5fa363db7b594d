use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;

/// Handler invoked for a transport event.
pub type Handler = Rc<dyn Fn(&Event)>;

/// Zero-argument callback, used for `postTimeout`.
pub type Callback = Rc<dyn Fn()>;

/// Wraps a closure into a [`Handler`].
pub fn handler(f: impl Fn(&Event) + 'static) -> Handler {
    Rc::new(f)
}

/// Wraps a closure into a [`Callback`].
pub fn callback(f: impl Fn() + 'static) -> Callback {
    Rc::new(f)
}

/// Closed set of transport events a handler can be registered for.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EventType {
    LoadStart,
    Progress,
    Abort,
    Error,
    Load,
    Timeout,
    LoadEnd,
    ReadyStateChange,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::LoadStart,
        EventType::Progress,
        EventType::Abort,
        EventType::Error,
        EventType::Load,
        EventType::Timeout,
        EventType::LoadEnd,
        EventType::ReadyStateChange,
    ];

    /// Every name accepted by [`EventType::from_name`], aliases included.
    pub const NAMES: [&'static str; 9] = [
        "loadstart",
        "progress",
        "abort",
        "onabort",
        "error",
        "load",
        "timeout",
        "loadend",
        "onreadystatechange",
    ];

    /// Canonical event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadStart => "loadstart",
            Self::Progress => "progress",
            Self::Abort => "abort",
            Self::Error => "error",
            Self::Load => "load",
            Self::Timeout => "timeout",
            Self::LoadEnd => "loadend",
            Self::ReadyStateChange => "onreadystatechange",
        }
    }

    /// Resolves an event name. `onabort` is accepted as an alias of `abort`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "loadstart" => Some(Self::LoadStart),
            "progress" => Some(Self::Progress),
            "abort" | "onabort" => Some(Self::Abort),
            "error" => Some(Self::Error),
            "load" => Some(Self::Load),
            "timeout" => Some(Self::Timeout),
            "loadend" => Some(Self::LoadEnd),
            "onreadystatechange" => Some(Self::ReadyStateChange),
            _ => None,
        }
    }

    /// Whether a synchronous transport can raise this event.
    ///
    /// Synchronous requests block until completion, so progress and timeout
    /// notifications never reach a listener.
    pub fn fires_synchronously(self) -> bool {
        !matches!(self, Self::LoadStart | Self::Progress | Self::Timeout)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of a transport handle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadyState {
    #[default]
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// Byte counters attached to progress-style events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Decoded response body.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// Size of the body in bytes, as received.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Json(value) => value.to_string().len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completed HTTP exchange as seen by handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the body as text when it was decoded as text.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserializes the body into `T`, whatever kind it was decoded as.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.body {
            ResponseBody::Json(value) => serde_json::from_value(value.clone()),
            ResponseBody::Text(text) => serde_json::from_str(text),
            ResponseBody::Bytes(bytes) => serde_json::from_slice(bytes),
        }
    }
}

/// Notification raised by a transport handle.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventType,
    pub ready_state: ReadyState,
    pub progress: Progress,
    pub response: Option<Rc<Response>>,
    /// Failure description for `error` events.
    pub error: Option<String>,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            ready_state: ReadyState::Unsent,
            progress: Progress::default(),
            response: None,
            error: None,
        }
    }

    pub fn with_ready_state(mut self, ready_state: ReadyState) -> Self {
        self.ready_state = ready_state;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_response(mut self, response: Rc<Response>) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Supplies the handlers installed for `load` and `error` when a wrapper is
/// constructed.
///
/// Any `Fn(EventType) -> Option<Handler>` closure is a provider.
pub trait DefaultHandlers {
    /// Returns the default handler for `event`, if the provider has one.
    fn resolve(&self, event: EventType) -> Option<Handler>;
}

impl<F> DefaultHandlers for F
where
    F: Fn(EventType) -> Option<Handler>,
{
    fn resolve(&self, event: EventType) -> Option<Handler> {
        self(event)
    }
}

/// Default handlers that report outcomes through `tracing`.
///
/// Enabled with the `tracing` feature.
#[cfg(feature = "tracing")]
#[derive(Clone, Copy, Debug, Default)]
pub struct LogHandlers;

#[cfg(feature = "tracing")]
impl DefaultHandlers for LogHandlers {
    fn resolve(&self, event: EventType) -> Option<Handler> {
        match event {
            EventType::Load | EventType::Error => Some(Rc::new(log_outcome)),
            _ => None,
        }
    }
}

#[cfg(feature = "tracing")]
fn log_outcome(event: &Event) {
    match (event.kind, event.response.as_deref()) {
        (EventType::Error, _) => {
            tracing::warn!(error = ?event.error, "there was an error on the request");
        }
        (EventType::Load, Some(response)) if response.status == 200 => {
            tracing::info!(bytes = response.body.len(), "request loaded");
        }
        (EventType::Load, Some(response)) => {
            tracing::warn!(
                status = response.status,
                status_text = %response.status_text,
                "request returned a non-200 status; possible error"
            );
        }
        _ => {}
    }
}
