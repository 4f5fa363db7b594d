//! Host timer capability used for retry intervals.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Identifies an interval created by a [`Scheduler`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerId(u64);

/// Recurring timers provided by the host event loop.
pub trait Scheduler {
    /// Calls `tick` every `period` until the interval is cleared.
    fn set_interval(&self, period: Duration, tick: Box<dyn FnMut()>) -> TimerId;

    /// Stops an interval. Unknown or already cleared ids are ignored.
    fn clear_interval(&self, id: TimerId);
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn set_interval(&self, period: Duration, tick: Box<dyn FnMut()>) -> TimerId {
        (**self).set_interval(period, tick)
    }

    fn clear_interval(&self, id: TimerId) {
        (**self).clear_interval(id)
    }
}

struct ManualTimer {
    id: TimerId,
    period: Duration,
    due: Duration,
    /// `None` while the tick is running.
    tick: Option<Box<dyn FnMut()>>,
}

/// Scheduler driven explicitly by its owner.
///
/// Time only moves when [`ManualScheduler::advance`] is called, which makes
/// retry behaviour reproducible in tests and usable from custom event loops.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    timers: RefCell<Vec<ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Number of intervals that have not been cleared.
    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Moves time forward, firing every tick that falls due on the way in
    /// chronological order.
    pub fn advance(&self, by: Duration) {
        let deadline = self.now.get() + by;
        while let Some((id, due)) = self.next_due(deadline) {
            self.now.set(due);
            let tick = {
                let mut timers = self.timers.borrow_mut();
                timers.iter_mut().find(|timer| timer.id == id).and_then(|timer| {
                    timer.due += timer.period;
                    timer.tick.take()
                })
            };
            let Some(mut tick) = tick else { continue };
            tick();
            // The tick may have cleared its own interval.
            if let Some(timer) = self
                .timers
                .borrow_mut()
                .iter_mut()
                .find(|timer| timer.id == id)
            {
                timer.tick = Some(tick);
            }
        }
        self.now.set(deadline);
    }

    fn next_due(&self, deadline: Duration) -> Option<(TimerId, Duration)> {
        self.timers
            .borrow()
            .iter()
            .filter(|timer| timer.tick.is_some() && timer.due <= deadline)
            .min_by_key(|timer| (timer.due, timer.id))
            .map(|timer| (timer.id, timer.due))
    }
}

impl Scheduler for ManualScheduler {
    fn set_interval(&self, period: Duration, tick: Box<dyn FnMut()>) -> TimerId {
        let id = TimerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let period = period.max(Duration::from_millis(1));
        self.timers.borrow_mut().push(ManualTimer {
            id,
            period,
            due: self.now.get() + period,
            tick: Some(tick),
        });
        id
    }

    fn clear_interval(&self, id: TimerId) {
        self.timers.borrow_mut().retain(|timer| timer.id != id);
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::native::TokioScheduler;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::task::JoinHandle;
    use tokio::time::{interval_at, Instant, MissedTickBehavior};

    use super::{Scheduler, TimerId};

    /// Scheduler backed by tokio timers on the current `LocalSet`.
    ///
    /// Intervals are spawned with `tokio::task::spawn_local`, so they must be
    /// created from inside a `LocalSet`.
    #[derive(Default)]
    pub struct TokioScheduler {
        next_id: Cell<u64>,
        tasks: RefCell<HashMap<TimerId, JoinHandle<()>>>,
    }

    impl TokioScheduler {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Scheduler for TokioScheduler {
        fn set_interval(&self, period: Duration, mut tick: Box<dyn FnMut()>) -> TimerId {
            let id = TimerId(self.next_id.get());
            self.next_id.set(id.0 + 1);
            let period = period.max(Duration::from_millis(1));

            let task = tokio::task::spawn_local(async move {
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    tick();
                }
            });
            self.tasks.borrow_mut().insert(id, task);
            id
        }

        fn clear_interval(&self, id: TimerId) {
            if let Some(task) = self.tasks.borrow_mut().remove(&id) {
                task.abort();
            }
        }
    }

    impl Drop for TokioScheduler {
        fn drop(&mut self) {
            for (_, task) in self.tasks.borrow_mut().drain() {
                task.abort();
            }
        }
    }
}
