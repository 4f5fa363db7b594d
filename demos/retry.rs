use std::time::Duration;

use request_wrapper::{
    handler, Event, EventType, PartialConfig, ReqwestTransportFactory, RequestState,
    RequestWrapper, TokioScheduler,
};
use tokio::task::LocalSet;

/// Requests a slow endpoint with a short timeout and lets the wrapper retry.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url =
        std::env::var("REQUEST_URL").unwrap_or_else(|_| "https://httpbin.org/delay/5".into());

    LocalSet::new()
        .run_until(async move {
            let defaults = |event: EventType| match event {
                EventType::Load => Some(handler(|event: &Event| {
                    let status = event.response.as_ref().map(|response| response.status);
                    println!("loaded: {status:?}");
                })),
                EventType::Error => Some(handler(|event: &Event| {
                    eprintln!("request failed: {:?}", event.error);
                })),
                _ => None,
            };

            let request = RequestWrapper::builder(
                url,
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
            )
            .default_handlers(defaults)
            .bypass_cache(true)
            .build()?;
            request.configure(
                PartialConfig::new()
                    .attempts(3)
                    .attempt_interval(2)
                    .timeout(2)
                    .handler(
                        EventType::Timeout,
                        handler(|_| println!("attempt timed out")),
                    )
                    .post_timeout(|| println!("first timeout, retrying")),
            )?;
            println!("requesting {}", request.target());
            request.init()?;
            request.send()?;

            let mut reported = 0;
            while !request.state().is_terminal() {
                if request.current_attempt() != reported {
                    reported = request.current_attempt();
                    println!("attempt {reported}");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if request.state() == RequestState::Exhausted {
                println!("gave up after {} attempts", request.current_attempt());
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
}
