//! `request-wrapper` turns a low-level asynchronous HTTP transport into a
//! reusable request object with declarative configuration, pluggable event
//! handlers and retry on timeout.
//!
//! The lifecycle is driven through:
//! - [`RequestWrapper::configure`]
//! - [`RequestWrapper::init`]
//! - [`RequestWrapper::send`]
//! - [`RequestWrapper::end`]
//!
//! Transports and timers are capabilities supplied by the host
//! ([`Transport`], [`Scheduler`]). [`ReqwestTransportFactory`] and
//! [`TokioScheduler`] provide native implementations that run on a tokio
//! `LocalSet`.

mod config;
mod error;
mod event;
mod http;
pub mod scheduler;
pub mod target;
mod transport;
mod wrapper;

pub use config::{ConfigField, ConfigValue, PartialConfig, RequestConfiguration};
pub use error::{PolicyViolation, WrapperError};
#[cfg(feature = "tracing")]
pub use event::LogHandlers;
pub use event::{
    callback, handler, Callback, DefaultHandlers, Event, EventType, Handler, Progress,
    ReadyState, Response, ResponseBody,
};
pub use http::{ReqwestTransport, ReqwestTransportFactory};
#[cfg(not(target_arch = "wasm32"))]
pub use scheduler::TokioScheduler;
pub use scheduler::{ManualScheduler, Scheduler, TimerId};
pub use transport::{dispatch, ResponseKind, Transport, TransportFactory};
pub use wrapper::{RequestState, RequestWrapper, RequestWrapperBuilder};

pub type Result<T> = std::result::Result<T, WrapperError>;
