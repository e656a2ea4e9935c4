use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::event::EventHandlers;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Identifies a timer and its ancestors in [`TimerEvent`]s.
#[derive(Debug)]
pub struct TimerInfo {
    pub description: String,
    pub parent: Option<Arc<TimerInfo>>,
}

impl TimerInfo {
    /// Number of ancestors, used to indent nested timings.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent.as_ref();
        }
        depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Start,
    Lap,
    Finished,
}

#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub state: TimerState,
    pub timer: Arc<TimerInfo>,
    /// Time since the previous lap, or since the start.
    pub duration: Duration,
    /// Time since the start.
    pub elapsed: Duration,
    pub description: String,
}

/// Times a section of the build; dispatches `Start` when created, `Lap` on each
/// [`TimerEventDispatcher::lap`] and `Finished` when dropped.
pub struct TimerEventDispatcher {
    event_handlers: EventHandlers,
    clock: Arc<dyn Clock>,
    info: Arc<TimerInfo>,
    start_time: Instant,
    lap_start_time: Instant,
}

impl TimerEventDispatcher {
    pub fn new(event_handlers: &EventHandlers, description: impl Into<String>) -> TimerEventDispatcher {
        TimerEventDispatcher::with_clock(event_handlers, description, Arc::new(SystemClock))
    }

    pub fn with_clock(event_handlers: &EventHandlers, description: impl Into<String>, clock: Arc<dyn Clock>) -> TimerEventDispatcher {
        TimerEventDispatcher::start(event_handlers.clone(), description.into(), clock, None)
    }

    fn start(event_handlers: EventHandlers, description: String, clock: Arc<dyn Clock>, parent: Option<Arc<TimerInfo>>) -> TimerEventDispatcher {
        let now = clock.now();
        let dispatcher = TimerEventDispatcher {
            event_handlers,
            clock,
            info: Arc::new(TimerInfo { description, parent }),
            start_time: now,
            lap_start_time: now,
        };
        dispatcher.dispatch(TimerState::Start, Duration::ZERO, Duration::ZERO, &dispatcher.info.description);
        dispatcher
    }

    pub fn sub_timer(&self, description: impl Into<String>) -> TimerEventDispatcher {
        TimerEventDispatcher::start(self.event_handlers.clone(), description.into(), self.clock.clone(), Some(self.info.clone()))
    }

    pub fn lap(&mut self) {
        let description = self.info.description.clone();
        self.lap_with_description(&description);
    }

    pub fn lap_with_description(&mut self, description: &str) {
        let (duration, elapsed) = self.take_lap();
        self.dispatch(TimerState::Lap, duration, elapsed, description);
    }

    pub fn timer(&self) -> &Arc<TimerInfo> {
        &self.info
    }

    fn take_lap(&mut self) -> (Duration, Duration) {
        let now = self.clock.now();
        let duration = now.saturating_duration_since(self.lap_start_time);
        self.lap_start_time = now;
        (duration, now.saturating_duration_since(self.start_time))
    }

    fn dispatch(&self, state: TimerState, duration: Duration, elapsed: Duration, description: &str) {
        self.event_handlers.dispatch(TimerEvent {
            state,
            timer: self.info.clone(),
            duration,
            elapsed,
            description: description.to_string(),
        });
    }
}

impl Drop for TimerEventDispatcher {
    fn drop(&mut self) {
        let (duration, elapsed) = self.take_lap();
        let description = self.info.description.clone();
        self.dispatch(TimerState::Finished, duration, elapsed, &description);
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
