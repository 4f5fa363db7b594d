use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reqwest::Url;

use crate::{EventType, Handler};

/// How a transport should decode the response body.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResponseKind {
    #[default]
    Text,
    Json,
    Bytes,
}

impl ResponseKind {
    /// Derives the decoding from a mime type such as `application/json`.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "application/json" || essence.ends_with("+json") {
            Self::Json
        } else if essence.starts_with("text/")
            || essence.ends_with("+xml")
            || essence == "application/xml"
            || essence == "application/javascript"
        {
            Self::Text
        } else {
            Self::Bytes
        }
    }
}

/// Low-level exchange driven by a request wrapper.
///
/// A handle carries exactly one exchange: it is opened, configured, sent once
/// and then discarded. Outcomes are reported only through the listeners
/// registered with [`Transport::add_event_listener`], in the order they occur.
pub trait Transport {
    /// Forces the mime type used to interpret the response.
    fn override_mime_type(&mut self, mime: &str);

    fn add_event_listener(&mut self, event: EventType, handler: Handler);

    fn open(&mut self, method: &str, url: &Url, asynchronous: bool);

    /// Only called for asynchronous exchanges.
    fn set_response_kind(&mut self, kind: ResponseKind);

    /// Only called for asynchronous exchanges; zero disables the timeout.
    fn set_timeout(&mut self, timeout: Duration);

    fn set_request_header(&mut self, name: &str, value: &str);

    /// Starts the exchange. Synchronous handles return after completion.
    fn send(&mut self, body: Option<&[u8]>);

    /// Cancels the exchange, raising `abort` instead of its outcome.
    fn abort(&mut self);
}

/// Creates a fresh transport handle for every initialization.
///
/// Any `Fn() -> T` closure is a factory.
pub trait TransportFactory {
    type Transport: Transport;

    fn create(&self) -> Self::Transport;
}

impl<F, T> TransportFactory for F
where
    F: Fn() -> T,
    T: Transport,
{
    type Transport = T;

    fn create(&self) -> T {
        self()
    }
}

/// Dispatches an event to every listener registered for its kind.
///
/// Helper for [`Transport`] implementations that keep their listeners in a
/// `RefCell`.
///
/// The matching handlers are collected before any runs, so a handler may
/// register further listeners while the event is being delivered.
pub fn dispatch(listeners: &RefCell<Vec<(EventType, Handler)>>, event: &crate::Event) {
    let matching: Vec<Handler> = listeners
        .borrow()
        .iter()
        .filter(|(kind, _)| *kind == event.kind)
        .map(|(_, handler)| Rc::clone(handler))
        .collect();
    for handler in matching {
        handler(event);
    }
}
