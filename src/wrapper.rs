use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use reqwest::Url;

use crate::{
    target, DefaultHandlers, Event, EventType, Handler, PartialConfig, RequestConfiguration,
    ResponseKind, Result, Scheduler, TimerId, Transport, TransportFactory, WrapperError,
};

/// Events the wrapper listens to on every handle to drive its state machine.
const LIFECYCLE_EVENTS: [EventType; 4] = [
    EventType::Load,
    EventType::Error,
    EventType::Abort,
    EventType::Timeout,
];

/// Position of a wrapper in the request lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// Nothing in flight.
    Idle,
    /// An attempt has been sent and has not finished.
    Sent,
    /// The transport raised `load`.
    Completed,
    /// The transport raised `error` or `abort`. Never retried.
    Failed,
    /// The current attempt timed out; observable from `postTimeout`.
    TimedOut,
    /// A retry timer is pending.
    WaitingToRetry,
    /// Every attempt timed out; no further attempts will be made.
    Exhausted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Exhausted)
    }
}

struct State<T> {
    config: RequestConfiguration,
    transport: Option<T>,
    /// The current handle is opened and has not been sent yet.
    handle_ready: bool,
    /// Bumped by every `init`; events from older handles are ignored.
    generation: u64,
    /// Zero-based index of the current attempt.
    attempt: u32,
    phase: RequestState,
    timer: Option<TimerId>,
    post_timeout_fired: bool,
}

impl<T> State<T> {
    /// Whether the attempt after the current one would exceed the budget.
    fn budget_exhausted(&self) -> bool {
        self.attempt.saturating_add(1) >= self.config.attempts()
    }
}

struct Core<F: TransportFactory, S> {
    factory: F,
    scheduler: S,
    state: RefCell<State<F::Transport>>,
}

/// Reusable HTTP request with declarative configuration, event handlers and
/// retry on timeout.
///
/// The wrapper owns one configuration and at most one transport handle.
/// Every [`init`](Self::init) replaces the handle with a fresh one from the
/// factory. When an asynchronous attempt times out, a recurring timer is
/// started on the scheduler; each tick issues the next attempt until the
/// configured number of attempts is used up.
///
/// Everything runs on one thread: handlers and timer ticks are invoked by
/// the host's transport and scheduler and never overlap.
pub struct RequestWrapper<F: TransportFactory, S: Scheduler> {
    core: Rc<Core<F, S>>,
    bypass_cache: bool,
}

impl<F: TransportFactory, S: Scheduler> fmt::Debug for RequestWrapper<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("RequestWrapper")
            .field("config", &state.config)
            .field("state", &state.phase)
            .field("attempt", &state.attempt)
            .field("bypass_cache", &self.bypass_cache)
            .finish()
    }
}

impl<F, S> RequestWrapper<F, S>
where
    F: TransportFactory + 'static,
    S: Scheduler + 'static,
{
    /// Starts building a wrapper for `destination`.
    pub fn builder(
        destination: impl Into<String>,
        factory: F,
        scheduler: S,
    ) -> RequestWrapperBuilder<F, S> {
        RequestWrapperBuilder {
            destination: destination.into(),
            execute_immediately: false,
            bypass_cache: false,
            factory,
            scheduler,
            defaults: None,
        }
    }

    /// Creates a lazily executed wrapper with the given default handlers.
    pub fn new(
        destination: impl Into<String>,
        factory: F,
        scheduler: S,
        defaults: impl DefaultHandlers + 'static,
    ) -> Result<Self> {
        Self::builder(destination, factory, scheduler)
            .default_handlers(defaults)
            .build()
    }

    /// Merges `partial` into the configuration.
    ///
    /// Entries are applied in order and the first invalid one is reported.
    /// On error the configuration is left unchanged. A handle that is
    /// already initialized keeps the settings it was created with.
    pub fn configure(&self, partial: PartialConfig) -> Result<()> {
        let mut state = self.core.state.borrow_mut();
        let merged = state.config.merged(&partial)?;
        state.config = merged;

        #[cfg(feature = "tracing")]
        tracing::debug!(fields = partial.len(), "request configured");

        Ok(())
    }

    /// Replaces the transport handle with a fresh, opened one.
    ///
    /// No network activity starts until [`send`](Self::send). Currently
    /// infallible; the `Result` matches the other lifecycle calls.
    pub fn init(&self) -> Result<()> {
        self.core.init();
        Ok(())
    }

    /// Sends the configured body on the handle prepared by `init`.
    ///
    /// Each call starts a new logical request: the attempt counter is reset
    /// and a pending retry timer is cancelled. Fails with
    /// [`WrapperError::PreconditionViolation`] unless `init` was called since
    /// the last send.
    pub fn send(&self) -> Result<()> {
        let timer = {
            let mut state = self.core.state.borrow_mut();
            if !state.handle_ready {
                return Err(not_initialized());
            }
            state.attempt = 0;
            state.post_timeout_fired = false;
            state.timer.take()
        };
        if let Some(timer) = timer {
            self.core.scheduler.clear_interval(timer);
        }
        self.core.send_attempt()
    }

    /// Uses up the attempt budget so the next retry check stops.
    ///
    /// A pending timer is not cancelled here; its next tick observes the
    /// exhausted budget and clears itself.
    pub fn end(&self) {
        let mut state = self.core.state.borrow_mut();
        state.attempt = state.config.attempts().saturating_sub(1);

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt = state.attempt, "request ended by caller");
    }
}

impl<F: TransportFactory, S: Scheduler> RequestWrapper<F, S> {
    pub fn state(&self) -> RequestState {
        self.core.state.borrow().phase
    }

    /// One-based number of the current attempt.
    pub fn current_attempt(&self) -> u32 {
        self.core.state.borrow().attempt.saturating_add(1)
    }

    /// Snapshot of the current configuration.
    pub fn configuration(&self) -> RequestConfiguration {
        self.core.state.borrow().config.clone()
    }

    pub fn target(&self) -> Url {
        self.core.state.borrow().config.target().clone()
    }

    /// Whether the target carries a cache-busting parameter.
    pub fn bypasses_cache(&self) -> bool {
        self.bypass_cache
    }
}

impl<F: TransportFactory, S: Scheduler> Drop for RequestWrapper<F, S> {
    fn drop(&mut self) {
        let timer = self
            .core
            .state
            .try_borrow_mut()
            .ok()
            .and_then(|mut state| state.timer.take());
        if let Some(timer) = timer {
            self.core.scheduler.clear_interval(timer);
        }
    }
}

impl<F, S> Core<F, S>
where
    F: TransportFactory + 'static,
    S: Scheduler + 'static,
{
    fn init(self: &Rc<Self>) {
        let (config, generation, previous) = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.handle_ready = false;
            let in_flight = state.phase == RequestState::Sent;
            if in_flight {
                state.phase = RequestState::Idle;
            }
            let previous = state.transport.take().map(|transport| (transport, in_flight));
            (state.config.clone(), state.generation, previous)
        };

        if let Some((mut previous, true)) = previous {
            previous.abort();
        }

        let asynchronous = config.is_asynchronous();
        let mut transport = self.factory.create();
        transport.override_mime_type(config.response_type());
        for (event, handler) in config.handlers() {
            if asynchronous || event.fires_synchronously() {
                transport.add_event_listener(event, Rc::clone(handler));
            }
        }
        for event in LIFECYCLE_EVENTS {
            if asynchronous || event.fires_synchronously() {
                transport.add_event_listener(event, self.lifecycle_listener(event, generation));
            }
        }

        transport.open(config.verb(), config.target(), asynchronous);
        if asynchronous {
            transport.set_response_kind(ResponseKind::from_mime(config.response_type()));
            transport.set_timeout(config.timeout());
        }
        if let Some(mime) = config.request_type() {
            let explicit = config
                .request_headers()
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
            if !explicit {
                transport.set_request_header("Content-Type", mime);
            }
        }
        for (name, value) in config.request_headers() {
            transport.set_request_header(name, value);
        }

        let mut state = self.state.borrow_mut();
        state.transport = Some(transport);
        state.handle_ready = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %config.target(),
            verb = config.verb(),
            asynchronous,
            generation,
            "transport initialized"
        );
    }

    fn send_attempt(&self) -> Result<()> {
        let (mut transport, body, generation) = {
            let mut state = self.state.borrow_mut();
            if !state.handle_ready {
                return Err(not_initialized());
            }
            let transport = state.transport.take().ok_or_else(not_initialized)?;
            state.handle_ready = false;
            state.phase = RequestState::Sent;

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt = state.attempt + 1, "sending request");

            (
                transport,
                state.config.data(),
                state.generation,
            )
        };

        // The borrow is released: synchronous transports complete inside
        // `send` and their events re-enter the state machine.
        transport.send(body.as_deref());

        let mut state = self.state.borrow_mut();
        if state.generation == generation && state.transport.is_none() {
            state.transport = Some(transport);
        }
        Ok(())
    }

    fn lifecycle_listener(self: &Rc<Self>, event: EventType, generation: u64) -> Handler {
        let core = Rc::downgrade(self);
        Rc::new(move |_: &Event| {
            if let Some(core) = core.upgrade() {
                core.on_lifecycle_event(event, generation);
            }
        })
    }

    fn on_lifecycle_event(self: &Rc<Self>, event: EventType, generation: u64) {
        if self.state.borrow().generation != generation {
            return;
        }
        match event {
            EventType::Timeout => self.on_timeout(),
            EventType::Load => self.finish(RequestState::Completed),
            EventType::Error | EventType::Abort => self.finish(RequestState::Failed),
            _ => {}
        }
    }

    fn finish(&self, outcome: RequestState) {
        let timer = {
            let mut state = self.state.borrow_mut();
            state.phase = outcome;
            state.timer.take()
        };
        if let Some(timer) = timer {
            self.scheduler.clear_interval(timer);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(state = ?outcome, "request finished");
    }

    fn on_timeout(self: &Rc<Self>) {
        let callback = {
            let mut state = self.state.borrow_mut();
            state.phase = RequestState::TimedOut;

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt = state.attempt + 1, "request timed out");

            if state.post_timeout_fired {
                None
            } else {
                state.post_timeout_fired = true;
                state.config.post_timeout().cloned()
            }
        };
        if let Some(callback) = callback {
            callback();
        }

        let mut state = self.state.borrow_mut();
        if state.phase != RequestState::TimedOut {
            return;
        }
        // Same check the next tick would make; stopping here keeps the timer
        // from outliving the last attempt.
        if state.budget_exhausted() {
            state.phase = RequestState::Exhausted;
            let timer = state.timer.take();
            drop(state);
            self.exhausted(timer);
            return;
        }
        state.phase = RequestState::WaitingToRetry;
        // The recurring timer outlives individual attempts.
        if state.timer.is_none() {
            let interval = state.config.attempt_interval();
            drop(state);
            self.start_retry_timer(interval);
        }
    }

    fn start_retry_timer(self: &Rc<Self>, interval: std::time::Duration) {
        debug_assert!(
            self.state.borrow().timer.is_none(),
            "at most one retry timer may be pending"
        );
        let core = Rc::downgrade(self);
        let timer = self.scheduler.set_interval(
            interval,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.on_tick();
                }
            }),
        );
        self.state.borrow_mut().timer = Some(timer);

        #[cfg(feature = "tracing")]
        tracing::debug!(interval_ms = interval.as_millis() as u64, "retry timer started");
    }

    fn on_tick(self: &Rc<Self>) {
        let mut state = self.state.borrow_mut();
        // Ticks while an attempt is still in flight are skipped.
        if state.phase != RequestState::WaitingToRetry {
            return;
        }
        if state.budget_exhausted() {
            state.phase = RequestState::Exhausted;
            let timer = state.timer.take();
            drop(state);
            self.exhausted(timer);
            return;
        }
        state.attempt += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt = state.attempt + 1, "retrying request");

        drop(state);

        self.init();
        if let Err(_err) = self.send_attempt() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "retry could not be sent");
        }
    }

    fn exhausted(&self, timer: Option<TimerId>) {
        if let Some(timer) = timer {
            self.scheduler.clear_interval(timer);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("attempt budget exhausted");
    }
}

fn not_initialized() -> WrapperError {
    WrapperError::PreconditionViolation("send requires init on a fresh transport handle")
}

/// Builder for [`RequestWrapper`].
pub struct RequestWrapperBuilder<F, S> {
    destination: String,
    execute_immediately: bool,
    bypass_cache: bool,
    factory: F,
    scheduler: S,
    defaults: Option<Box<dyn DefaultHandlers>>,
}

impl<F, S> RequestWrapperBuilder<F, S>
where
    F: TransportFactory + 'static,
    S: Scheduler + 'static,
{
    /// Runs `init` and `send` before `build` returns.
    pub fn execute_immediately(mut self, execute: bool) -> Self {
        self.execute_immediately = execute;
        self
    }

    /// Appends a unique query parameter to the target.
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    /// Provider for the `load` and `error` handlers installed by default.
    pub fn default_handlers(mut self, defaults: impl DefaultHandlers + 'static) -> Self {
        self.defaults = Some(Box::new(defaults));
        self
    }

    /// Validates the destination, resolves default handlers and creates the
    /// wrapper.
    pub fn build(self) -> Result<RequestWrapper<F, S>> {
        let mut url = target::parse(&self.destination)?;
        let defaults = self
            .defaults
            .ok_or(WrapperError::MissingDefaultHandler(EventType::Load))?;
        let load = defaults
            .resolve(EventType::Load)
            .ok_or(WrapperError::MissingDefaultHandler(EventType::Load))?;
        let error = defaults
            .resolve(EventType::Error)
            .ok_or(WrapperError::MissingDefaultHandler(EventType::Error))?;

        if self.bypass_cache {
            target::bust_cache(&mut url);
        }

        let wrapper = RequestWrapper {
            core: Rc::new(Core {
                factory: self.factory,
                scheduler: self.scheduler,
                state: RefCell::new(State {
                    config: RequestConfiguration::new(url, load, error),
                    transport: None,
                    handle_ready: false,
                    generation: 0,
                    attempt: 0,
                    phase: RequestState::Idle,
                    timer: None,
                    post_timeout_fired: false,
                }),
            }),
            bypass_cache: self.bypass_cache,
        };

        if self.execute_immediately {
            wrapper.init()?;
            wrapper.send()?;
        }
        Ok(wrapper)
    }
}
