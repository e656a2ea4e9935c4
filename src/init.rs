use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use env_logger::Env;
use log::{debug, error, info, warn};

use crate::event::progress::{ProgressEventHandler, ProgressUpdate};
use crate::event::timer::{TimerEvent, TimerState};
use crate::event::{EventHandlers, LogEvent, LogLevel};

/// App initialization.
pub fn init() -> Result<()> {
    log_init();

    Ok(())
}

fn log_init() {
    let env = Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format(|fmt, record| {
            writeln!(
                fmt,
                "[{} {}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                &record.args()
            )
        })
        .init();
}

/// Handlers that turn build events into log lines.
pub fn event_handlers() -> EventHandlers {
    let progress_handler = Arc::new(ProgressEventHandler::new(log_progress));
    progress_handler
        .register(EventHandlers::builder())
        .add::<LogEvent, _>(log_event)
        .add::<TimerEvent, _>(log_timer)
        .build()
}

fn log_event(event: &LogEvent) {
    match event.level {
        LogLevel::Error => error!("{}", event.message),
        LogLevel::Lifecycle => info!("{}", event.message.bold()),
        LogLevel::Progress | LogLevel::Info => info!("{}", event.message),
        LogLevel::Warn => warn!("{}", event.message),
        LogLevel::Debug => debug!("{}", event.message),
    }
}

fn log_timer(event: &TimerEvent) {
    if event.state == TimerState::Start {
        return;
    }
    debug!(
        "{}{} : {:.3} ms",
        "\t".repeat(event.timer.depth()),
        event.description,
        event.duration.as_secs_f64() * 1000.0
    );
}

fn log_progress(update: ProgressUpdate) {
    debug!(
        "{:.1}% complete, running: {}",
        update.progress * 100.0,
        update.unfinished_leaf_tasks.join(", ")
    );
}
