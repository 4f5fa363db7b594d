use std::time::Duration;

use request_wrapper::{
    handler, Event, EventType, PartialConfig, ReqwestTransportFactory, RequestWrapper,
    TokioScheduler,
};
use tokio::task::LocalSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::var("REQUEST_URL").unwrap_or_else(|_| "https://httpbin.org/json".into());

    LocalSet::new()
        .run_until(async move {
            let defaults = |event: EventType| match event {
                EventType::Load => Some(handler(|event: &Event| {
                    if let Some(response) = &event.response {
                        println!("{} {}", response.status, response.status_text);
                        println!("{:#?}", response.body);
                    }
                })),
                EventType::Error => Some(handler(|event: &Event| {
                    eprintln!("request failed: {}", event.error.as_deref().unwrap_or("unknown"));
                })),
                _ => None,
            };

            let request = RequestWrapper::new(
                url,
                ReqwestTransportFactory::new(),
                TokioScheduler::new(),
                defaults,
            )?;
            request.configure(
                PartialConfig::new()
                    .response_type("application/json")
                    .request_headers([("Accept", "application/json")])
                    .handler(
                        EventType::Progress,
                        handler(|event: &Event| println!("received {} bytes", event.progress.loaded)),
                    ),
            )?;
            request.init()?;
            request.send()?;

            while !request.state().is_terminal() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
}
