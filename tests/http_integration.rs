use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use request_wrapper::{
    handler, Event, EventType, Handler, PartialConfig, ReqwestTransportFactory, RequestState,
    RequestWrapper, Response, ResponseBody, Scheduler, TokioScheduler, TransportFactory,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::{task::LocalSet, time::Instant};

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

async fn greeting_handler(State(state): State<MockState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    (
        StatusCode::OK,
        [("x-request-tester", "1")],
        Json(json!({"greeting": "hello", "attempt": state.hits.load(Ordering::SeqCst)})),
    )
}

async fn echo_handler(
    State(state): State<MockState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    Json(json!({"contentType": content_type, "body": body}))
}

async fn client_header_handler(headers: HeaderMap) -> String {
    headers
        .get("x-client")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("missing")
        .to_owned()
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn router(delay: Duration) -> (Router, Arc<AtomicUsize>) {
    let state = MockState {
        hits: Arc::new(AtomicUsize::new(0)),
        delay,
    };
    let app = Router::new()
        .route("/greeting", get(greeting_handler))
        .route("/echo", post(echo_handler))
        .route("/client", get(client_header_handler))
        .with_state(state.clone());
    (app, state.hits)
}

async fn spawn_server(delay: Duration) -> TestServer {
    let (app, hits) = router(delay);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits,
        task,
    }
}

/// Captures the response of the last `load` and the message of the last
/// `error` event.
#[derive(Clone, Default)]
struct Outcome {
    response: Rc<RefCell<Option<Rc<Response>>>>,
    error: Rc<RefCell<Option<String>>>,
}

impl Outcome {
    fn defaults(&self) -> impl Fn(EventType) -> Option<Handler> + 'static {
        let outcome = self.clone();
        move |event| match event {
            EventType::Load => {
                let slot = Rc::clone(&outcome.response);
                Some(handler(move |event: &Event| {
                    *slot.borrow_mut() = event.response.clone();
                }))
            }
            EventType::Error => {
                let slot = Rc::clone(&outcome.error);
                Some(handler(move |event: &Event| {
                    *slot.borrow_mut() = Some(event.error.clone().unwrap_or_default());
                }))
            }
            _ => None,
        }
    }

    fn response(&self) -> Option<Rc<Response>> {
        self.response.borrow().clone()
    }

    fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }
}

async fn settle<F, S>(wrapper: &RequestWrapper<F, S>, limit: Duration) -> RequestState
where
    F: TransportFactory,
    S: Scheduler,
{
    let deadline = Instant::now() + limit;
    while !wrapper.state().is_terminal() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wrapper.state()
}

#[derive(Debug, Deserialize)]
struct Greeting {
    greeting: String,
}

#[tokio::test]
async fn load_delivers_a_decoded_json_response() {
    let server = spawn_server(Duration::ZERO).await;
    let outcome = Outcome::default();

    LocalSet::new()
        .run_until(async {
            let wrapper = RequestWrapper::new(
                &server.url("/greeting"),
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
                outcome.defaults(),
            )
            .expect("wrapper must build");
            wrapper
                .configure(PartialConfig::new().response_type("application/json"))
                .expect("valid configuration");
            wrapper.init().expect("init");
            wrapper.send().expect("send");

            assert_eq!(
                settle(&wrapper, Duration::from_secs(5)).await,
                RequestState::Completed
            );
        })
        .await;

    let response = outcome.response().expect("load delivers the response");
    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert_eq!(response.header("X-Request-Tester"), Some("1"));
    assert!(matches!(response.body, ResponseBody::Json(_)));
    let greeting: Greeting = response.json().expect("json body");
    assert_eq!(greeting.greeting, "hello");
    assert_eq!(server.hits(), 1);
    assert!(outcome.error().is_none());
}

#[tokio::test]
async fn post_sends_data_with_the_request_type() {
    let server = spawn_server(Duration::ZERO).await;
    let outcome = Outcome::default();
    let events = Rc::new(RefCell::new(Vec::new()));

    LocalSet::new()
        .run_until(async {
            let recorder = {
                let events = Rc::clone(&events);
                move || {
                    let events = Rc::clone(&events);
                    handler(move |event: &Event| events.borrow_mut().push(event.kind))
                }
            };
            let wrapper = RequestWrapper::builder(
                &server.url("/echo"),
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
            )
            .default_handlers(outcome.defaults())
            .build()
            .expect("wrapper must build");
            wrapper
                .configure(
                    PartialConfig::new()
                        .verb("post")
                        .data("name=kit")
                        .request_type("application/x-www-form-urlencoded")
                        .handler(EventType::LoadStart, recorder())
                        .handler(EventType::Progress, recorder())
                        .handler(EventType::LoadEnd, recorder()),
                )
                .expect("valid configuration");
            wrapper.init().expect("init");
            wrapper.send().expect("send");

            assert_eq!(
                settle(&wrapper, Duration::from_secs(5)).await,
                RequestState::Completed
            );
        })
        .await;

    let response = outcome.response().expect("load delivers the response");
    let echoed: JsonValue = response.json().expect("json body");
    assert_eq!(
        echoed,
        json!({"contentType": "application/x-www-form-urlencoded", "body": "name=kit"})
    );
    assert_eq!(
        events.borrow().as_slice(),
        &[EventType::LoadStart, EventType::Progress, EventType::LoadEnd]
    );
}

#[tokio::test]
async fn timeouts_are_retried_until_the_budget_is_spent() {
    let server = spawn_server(Duration::from_secs(3)).await;
    let outcome = Outcome::default();
    let post_timeouts = Rc::new(RefCell::new(0));

    LocalSet::new()
        .run_until(async {
            let wrapper = RequestWrapper::new(
                &server.url("/greeting"),
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
                outcome.defaults(),
            )
            .expect("wrapper must build");
            let counter = Rc::clone(&post_timeouts);
            wrapper
                .configure(
                    PartialConfig::new()
                        .attempts(3)
                        .attempt_interval(1)
                        .timeout(1)
                        .post_timeout(move || *counter.borrow_mut() += 1),
                )
                .expect("valid retry policy");
            wrapper.init().expect("init");
            wrapper.send().expect("send");

            assert_eq!(
                settle(&wrapper, Duration::from_secs(15)).await,
                RequestState::Exhausted
            );
            assert_eq!(wrapper.current_attempt(), 3);
        })
        .await;

    assert_eq!(server.hits(), 3);
    assert_eq!(*post_timeouts.borrow(), 1);
    assert!(outcome.response().is_none());
}

#[tokio::test]
async fn connection_failures_fire_error_without_retry() {
    let address = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("must bind probe listener");
        listener.local_addr().expect("must have local addr")
    };
    let outcome = Outcome::default();

    LocalSet::new()
        .run_until(async {
            let wrapper = RequestWrapper::new(
                &format!("http://{address}/closed"),
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
                outcome.defaults(),
            )
            .expect("wrapper must build");
            wrapper
                .configure(PartialConfig::new().attempts(3).attempt_interval(1).timeout(1))
                .expect("valid retry policy");
            wrapper.init().expect("init");
            wrapper.send().expect("send");

            assert_eq!(
                settle(&wrapper, Duration::from_secs(5)).await,
                RequestState::Failed
            );
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            assert_eq!(wrapper.current_attempt(), 1);
            assert_eq!(wrapper.state(), RequestState::Failed);
        })
        .await;

    assert!(outcome.error().is_some());
    assert!(outcome.response().is_none());
}

/// Serves the mock routes from a runtime on its own thread, so the test
/// thread stays free for blocking requests.
fn spawn_blocking_server() -> std::net::SocketAddr {
    let (address_tx, address_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("server runtime");
        runtime.block_on(async move {
            let (app, _) = router(Duration::ZERO);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("must bind test listener");
            address_tx
                .send(listener.local_addr().expect("must have local addr"))
                .expect("test thread is waiting");
            axum::serve(listener, app)
                .await
                .expect("mock server must run");
        });
    });
    address_rx.recv().expect("server address")
}

#[test]
fn synchronous_requests_complete_inside_send() {
    let address = spawn_blocking_server();

    let outcome = Outcome::default();
    let scheduler = Rc::new(request_wrapper::ManualScheduler::new());
    let wrapper = RequestWrapper::new(
        &format!("http://{address}/greeting"),
        ReqwestTransportFactory::new(),
        scheduler,
        outcome.defaults(),
    )
    .expect("wrapper must build");
    wrapper
        .configure(PartialConfig::new().asynchronous(false))
        .expect("valid configuration");
    wrapper.init().expect("init");
    wrapper.send().expect("send");

    assert_eq!(wrapper.state(), RequestState::Completed);
    let response = outcome.response().expect("load delivers the response");
    assert_eq!(response.status, 200);
    assert!(response.text().is_some_and(|text| text.contains("hello")));
}

#[test]
fn synchronous_requests_use_the_configured_blocking_client() {
    let address = spawn_blocking_server();
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        "x-client",
        reqwest::header::HeaderValue::from_static("configured"),
    );
    let client = reqwest::blocking::Client::builder()
        .default_headers(headers)
        .build()
        .expect("blocking client must build");

    let outcome = Outcome::default();
    let wrapper = RequestWrapper::new(
        &format!("http://{address}/client"),
        ReqwestTransportFactory::new().with_blocking_client(client),
        Rc::new(request_wrapper::ManualScheduler::new()),
        outcome.defaults(),
    )
    .expect("wrapper must build");
    wrapper
        .configure(PartialConfig::new().asynchronous(false))
        .expect("valid configuration");

    for _ in 0..2 {
        wrapper.init().expect("init");
        wrapper.send().expect("send");

        assert_eq!(wrapper.state(), RequestState::Completed);
        let response = outcome.response().expect("load delivers the response");
        assert_eq!(response.text(), Some("configured"));
    }
}
