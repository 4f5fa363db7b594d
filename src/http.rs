#[cfg(not(target_arch = "wasm32"))]
use std::cell::OnceCell;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use reqwest::{Method, StatusCode, Url};

use crate::transport::dispatch;
use crate::{
    Event, EventType, Handler, Progress, ReadyState, Response, ResponseBody, ResponseKind,
    Transport, TransportFactory,
};

#[cfg(not(target_arch = "wasm32"))]
use tokio::task::spawn_local;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen_futures::spawn_local;

/// Blocking client shared by every handle of one factory, built on first use.
#[cfg(not(target_arch = "wasm32"))]
type SharedBlockingClient = Rc<OnceCell<reqwest::blocking::Client>>;

/// Creates [`ReqwestTransport`] handles sharing one connection pool.
///
/// Asynchronous exchanges use the async client. Synchronous exchanges use a
/// separate `reqwest::blocking` client; unless one is supplied with
/// [`with_blocking_client`](Self::with_blocking_client), a default one is
/// built by the first synchronous send and reused afterwards.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportFactory {
    client: reqwest::Client,
    #[cfg(not(target_arch = "wasm32"))]
    blocking: SharedBlockingClient,
}

impl ReqwestTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured async client (proxies, TLS roots, default headers).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }

    /// Uses a preconfigured client for synchronous exchanges.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn with_blocking_client(mut self, client: reqwest::blocking::Client) -> Self {
        self.blocking = Rc::new(OnceCell::from(client));
        self
    }
}

impl TransportFactory for ReqwestTransportFactory {
    type Transport = ReqwestTransport;

    fn create(&self) -> ReqwestTransport {
        let transport = ReqwestTransport::new(self.client.clone());
        #[cfg(not(target_arch = "wasm32"))]
        let transport = transport.sharing_blocking_client(Rc::clone(&self.blocking));
        transport
    }
}

struct Opened {
    method: Option<Method>,
    url: Url,
    asynchronous: bool,
}

/// [`Transport`] backed by `reqwest`.
///
/// Asynchronous exchanges are spawned on the current local task set
/// (`tokio::task::spawn_local` natively, the browser event loop on WASM), so
/// handlers run on the same thread as the wrapper. Synchronous exchanges use
/// `reqwest::blocking` and must not be sent from inside an async runtime;
/// they are not available on `wasm32` targets.
pub struct ReqwestTransport {
    client: reqwest::Client,
    #[cfg(not(target_arch = "wasm32"))]
    blocking: SharedBlockingClient,
    listeners: Rc<RefCell<Vec<(EventType, Handler)>>>,
    opened: Option<Opened>,
    headers: Vec<(String, String)>,
    timeout: Duration,
    response_kind: Option<ResponseKind>,
    mime_override: Option<String>,
    ready_state: Rc<Cell<ReadyState>>,
    cancelled: Rc<Cell<bool>>,
    sent: bool,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            #[cfg(not(target_arch = "wasm32"))]
            blocking: Rc::default(),
            listeners: Rc::default(),
            opened: None,
            headers: Vec::new(),
            timeout: Duration::ZERO,
            response_kind: None,
            mime_override: None,
            ready_state: Rc::default(),
            cancelled: Rc::default(),
            sent: false,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state.get()
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn sharing_blocking_client(mut self, blocking: SharedBlockingClient) -> Self {
        self.blocking = blocking;
        self
    }

    fn exchange(&self) -> Exchange {
        let kind = self.response_kind.unwrap_or_else(|| {
            self.mime_override
                .as_deref()
                .map(ResponseKind::from_mime)
                .unwrap_or_default()
        });
        Exchange {
            listeners: Rc::clone(&self.listeners),
            ready_state: Rc::clone(&self.ready_state),
            cancelled: Rc::clone(&self.cancelled),
            kind,
        }
    }

    fn send_async(&self, method: Method, url: Url, body: Option<&[u8]>, exchange: Exchange) {
        let mut request = self.client.request(method, url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }
        if !self.timeout.is_zero() {
            request = request.timeout(self.timeout);
        }

        spawn_local(async move {
            exchange.emit(Event::new(EventType::LoadStart));
            let outcome = exchange.fetch(request).await;
            exchange.complete(outcome);
        });
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn send_blocking(&self, method: Method, url: Url, body: Option<&[u8]>, exchange: Exchange) {
        let client = self.blocking.get_or_init(reqwest::blocking::Client::new);
        let mut request = client.request(method, url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let outcome = request
            .send()
            .and_then(|response| {
                let status = response.status();
                let headers = header_pairs(response.headers());
                exchange.set_ready_state(ReadyState::HeadersReceived);
                response.bytes().map(|bytes| Received {
                    status,
                    headers,
                    bytes: bytes.to_vec(),
                })
            })
            .map_err(Failure::from);
        exchange.complete(outcome);
    }

    #[cfg(target_arch = "wasm32")]
    fn send_blocking(&self, _method: Method, _url: Url, _body: Option<&[u8]>, exchange: Exchange) {
        exchange.complete(Err(Failure::Network(
            "synchronous requests are not supported on wasm32".to_owned(),
        )));
    }
}

impl Transport for ReqwestTransport {
    fn override_mime_type(&mut self, mime: &str) {
        self.mime_override = Some(mime.to_owned());
    }

    fn add_event_listener(&mut self, event: EventType, handler: Handler) {
        self.listeners.borrow_mut().push((event, handler));
    }

    fn open(&mut self, method: &str, url: &Url, asynchronous: bool) {
        self.opened = Some(Opened {
            method: normalize_method(method),
            url: url.clone(),
            asynchronous,
        });
        self.sent = false;
        self.exchange().set_ready_state(ReadyState::Opened);
    }

    fn set_response_kind(&mut self, kind: ResponseKind) {
        self.response_kind = Some(kind);
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_request_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    fn send(&mut self, body: Option<&[u8]>) {
        let exchange = self.exchange();
        let Some(opened) = self.opened.take() else {
            exchange.complete(Err(Failure::Network("send called before open".to_owned())));
            return;
        };
        let Some(method) = opened.method else {
            exchange.complete(Err(Failure::Network("invalid request method".to_owned())));
            return;
        };
        self.sent = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(%method, url = %opened.url, asynchronous = opened.asynchronous, "dispatching request");

        if opened.asynchronous {
            self.send_async(method, opened.url, body, exchange);
        } else {
            self.send_blocking(method, opened.url, body, exchange);
        }
    }

    fn abort(&mut self) {
        let finished = matches!(self.ready_state.get(), ReadyState::Unsent | ReadyState::Done);
        if !self.sent || finished {
            return;
        }
        let exchange = self.exchange();
        self.cancelled.set(true);
        exchange.ready_state.set(ReadyState::Done);
        exchange.dispatch(Event::new(EventType::Abort));
        exchange.dispatch(Event::new(EventType::LoadEnd));
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        self.cancelled.set(true);
    }
}

struct Received {
    status: StatusCode,
    headers: Vec<(String, String)>,
    bytes: Vec<u8>,
}

enum Failure {
    Timeout,
    Network(String),
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Event emitter for one in-flight exchange.
struct Exchange {
    listeners: Rc<RefCell<Vec<(EventType, Handler)>>>,
    ready_state: Rc<Cell<ReadyState>>,
    cancelled: Rc<Cell<bool>>,
    kind: ResponseKind,
}

impl Exchange {
    fn dispatch(&self, event: Event) {
        let event = event.with_ready_state(self.ready_state.get());
        dispatch(&self.listeners, &event);
    }

    /// Dispatches unless the handle was aborted or dropped.
    fn emit(&self, event: Event) {
        if !self.cancelled.get() {
            self.dispatch(event);
        }
    }

    fn set_ready_state(&self, state: ReadyState) {
        self.ready_state.set(state);
        self.emit(Event::new(EventType::ReadyStateChange));
    }

    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<Received, Failure> {
        let response = request.send().await?;
        let status = response.status();
        let headers = header_pairs(response.headers());
        if self.cancelled.get() {
            return Err(Failure::Network("aborted".to_owned()));
        }
        self.set_ready_state(ReadyState::HeadersReceived);
        let bytes = response.bytes().await?;
        Ok(Received {
            status,
            headers,
            bytes: bytes.to_vec(),
        })
    }

    fn complete(&self, outcome: Result<Received, Failure>) {
        if self.cancelled.get() {
            return;
        }
        match outcome {
            Ok(received) => {
                let loaded = received.bytes.len() as u64;
                let progress = Progress {
                    loaded,
                    total: Some(loaded),
                };
                self.set_ready_state(ReadyState::Loading);
                self.emit(Event::new(EventType::Progress).with_progress(progress));
                self.set_ready_state(ReadyState::Done);

                let response = Rc::new(Response {
                    status: received.status.as_u16(),
                    status_text: received
                        .status
                        .canonical_reason()
                        .unwrap_or_default()
                        .to_owned(),
                    headers: received.headers,
                    body: decode_body(self.kind, received.bytes),
                });
                self.emit(
                    Event::new(EventType::Load)
                        .with_progress(progress)
                        .with_response(Rc::clone(&response)),
                );
                self.emit(
                    Event::new(EventType::LoadEnd)
                        .with_progress(progress)
                        .with_response(response),
                );
            }
            Err(Failure::Timeout) => {
                self.set_ready_state(ReadyState::Done);
                self.emit(Event::new(EventType::Timeout));
                self.emit(Event::new(EventType::LoadEnd));
            }
            Err(Failure::Network(message)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %message, "request failed");

                self.set_ready_state(ReadyState::Done);
                self.emit(Event::new(EventType::Error).with_error(message));
                self.emit(Event::new(EventType::LoadEnd));
            }
        }
    }
}

/// Upper-cases the standard verbs the way an XHR `open` does; other tokens
/// are kept as written.
fn normalize_method(method: &str) -> Option<Method> {
    const STANDARD: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

    let upper = method.to_ascii_uppercase();
    if STANDARD.contains(&upper.as_str()) {
        Method::from_bytes(upper.as_bytes()).ok()
    } else {
        Method::from_bytes(method.as_bytes()).ok()
    }
}

fn header_pairs(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn decode_body(kind: ResponseKind, bytes: Vec<u8>) -> ResponseBody {
    match kind {
        ResponseKind::Bytes => ResponseBody::Bytes(bytes),
        ResponseKind::Json => serde_json::from_slice(&bytes)
            .map(ResponseBody::Json)
            .unwrap_or_else(|_| ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())),
        ResponseKind::Text => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}
