use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::event::progress::ProgressEvent;
use crate::event::timer::TimerEvent;

pub mod progress;
pub mod timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Log,
    Progress,
    Timer,
}

#[derive(Debug, Clone)]
pub enum FibEvent {
    Log(LogEvent),
    Progress(ProgressEvent),
    Timer(TimerEvent),
}

impl FibEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            FibEvent::Log(_) => EventType::Log,
            FibEvent::Progress(_) => EventType::Progress,
            FibEvent::Timer(_) => EventType::Timer,
        }
    }
}

/// A concrete event payload that handlers can subscribe to by type.
pub trait FibEventType: Sized + 'static {
    const EVENT_TYPE: EventType;

    fn from_event(event: &FibEvent) -> Option<&Self>;

    fn into_event(self) -> FibEvent;
}

impl FibEventType for LogEvent {
    const EVENT_TYPE: EventType = EventType::Log;

    fn from_event(event: &FibEvent) -> Option<&Self> {
        match event {
            FibEvent::Log(log_event) => Some(log_event),
            _ => None,
        }
    }

    fn into_event(self) -> FibEvent {
        FibEvent::Log(self)
    }
}

impl FibEventType for ProgressEvent {
    const EVENT_TYPE: EventType = EventType::Progress;

    fn from_event(event: &FibEvent) -> Option<&Self> {
        match event {
            FibEvent::Progress(progress_event) => Some(progress_event),
            _ => None,
        }
    }

    fn into_event(self) -> FibEvent {
        FibEvent::Progress(self)
    }
}

impl FibEventType for TimerEvent {
    const EVENT_TYPE: EventType = EventType::Timer;

    fn from_event(event: &FibEvent) -> Option<&Self> {
        match event {
            FibEvent::Timer(timer_event) => Some(timer_event),
            _ => None,
        }
    }

    fn into_event(self) -> FibEvent {
        FibEvent::Timer(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Lifecycle,
    Progress,
    Warn,
    Info,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> LogEvent {
        LogEvent {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Error, message)
    }

    pub fn lifecycle(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Lifecycle, message)
    }

    pub fn progress(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Progress, message)
    }

    pub fn warn(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Info, message)
    }

    pub fn debug(message: impl Into<String>) -> LogEvent {
        LogEvent::new(LogLevel::Debug, message)
    }
}

type Handler = Arc<dyn Fn(&FibEvent) + Send + Sync>;

/// Dispatches events to the handlers registered for their type, plus every
/// handler registered for any event, strictly in registration order.
///
/// The table is immutable once built and cheap to clone, so it can be shared
/// by all workers of a build.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<Vec<(Option<EventType>, Handler)>>,
}

impl EventHandlers {
    pub fn builder() -> EventHandlersBuilder {
        EventHandlersBuilder::default()
    }

    pub fn none() -> EventHandlers {
        EventHandlers::default()
    }

    pub fn dispatch(&self, event: impl FibEventType) {
        self.dispatch_event(&event.into_event());
    }

    pub fn dispatch_event(&self, event: &FibEvent) {
        let event_type = event.event_type();
        for (handled_type, handler) in self.handlers.iter() {
            if handled_type.map_or(true, |handled_type| handled_type == event_type) {
                handler(event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Debug for EventHandlers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let types = self.handlers.iter().map(|(event_type, _)| *event_type).collect::<Vec<Option<EventType>>>();
        f.debug_struct("EventHandlers").field("handlers", &types).finish()
    }
}

#[derive(Default)]
pub struct EventHandlersBuilder {
    handlers: Vec<(Option<EventType>, Handler)>,
}

impl EventHandlersBuilder {
    /// Registers a handler for one event type.
    pub fn add<E, F>(mut self, handler: F) -> EventHandlersBuilder
    where
        E: FibEventType,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |event: &FibEvent| {
            if let Some(event) = E::from_event(event) {
                handler(event)
            }
        });
        self.handlers.push((Some(E::EVENT_TYPE), handler));
        self
    }

    /// Registers a handler invoked for every event.
    pub fn add_any<F>(mut self, handler: F) -> EventHandlersBuilder
    where
        F: Fn(&FibEvent) + Send + Sync + 'static,
    {
        self.handlers.push((None, Arc::new(handler)));
        self
    }

    pub fn build(self) -> EventHandlers {
        EventHandlers {
            handlers: Arc::new(self.handlers),
        }
    }
}
