//! Lifetime Event Logging
//!
//! Structured logging of the infrequent events of the runtime: thread
//! registration, merge queue drains, promotions and callback failures.
//! Per-object retain/release traffic is never logged here.
//!
//! Events are kept in a bounded in-memory history and forwarded to the
//! `log` facade under the `brc` target, rendered either human readable or
//! as JSON.
//!
//! Log Levels:
//! - ERROR: Weak callback failures
//! - INFO: Thread lifecycle, promotions
//! - DEBUG: Merge queue drains, ownerless merges

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for lifetime events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Lifetime event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifetimeEvent {
    /// Thread joined the registry
    ThreadRegistered { thread: u64, bucket: usize },

    /// Thread left the registry
    ThreadUnregistered {
        thread: u64,
        drained: usize,
        merged: usize,
        handed_off: usize,
        deallocated: usize,
    },

    /// Owner merged its pending queue at a safe point
    MergeQueueDrained {
        thread: u64,
        merged: usize,
        deallocated: usize,
    },

    /// Object became immortal after approaching counter overflow
    ObjectPromoted {
        thread: u64,
        address: usize,
        refcount: usize,
    },

    /// A release found the object's owner already unregistered
    OwnerGone {
        thread: u64,
        owner: u64,
        address: usize,
    },

    /// A weak reference callback panicked during teardown
    CallbackPanicked { address: usize, message: String },
}

/// Event logger configuration
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Forward events to the `log` facade
    pub forward: bool,

    /// Render forwarded events as JSON
    pub json: bool,

    /// Prefix rendered events with a wall-clock timestamp
    pub timestamps: bool,

    /// Events kept in memory; oldest dropped first
    pub history: usize,
}

impl Default for EventLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            forward: true,
            json: false,
            timestamps: true,
            history: 1024,
        }
    }
}

/// Event logger owned by a runtime
pub struct EventLogger {
    config: EventLoggerConfig,
    events: Mutex<VecDeque<(Instant, LifetimeEvent)>>,
    enabled: AtomicBool,
}

impl EventLogger {
    pub fn new(config: EventLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a lifetime event
    pub fn log(&self, event: LifetimeEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        if self.config.forward {
            log::log!(target: "brc", level.into(), "{}", self.render(&event));
        }

        if self.config.history == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.config.history {
            events.pop_front();
        }
        events.push_back((Instant::now(), event));
    }

    fn event_level(event: &LifetimeEvent) -> LogLevel {
        match event {
            LifetimeEvent::CallbackPanicked { .. } => LogLevel::Error,
            LifetimeEvent::ThreadRegistered { .. }
            | LifetimeEvent::ThreadUnregistered { .. }
            | LifetimeEvent::ObjectPromoted { .. } => LogLevel::Info,
            LifetimeEvent::MergeQueueDrained { .. } | LifetimeEvent::OwnerGone { .. } => {
                LogLevel::Debug
            },
        }
    }

    /// Render an event as configured
    pub fn render(&self, event: &LifetimeEvent) -> String {
        let body = if self.config.json {
            Self::render_json(event)
        } else {
            Self::render_human(event)
        };
        if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), body)
        } else {
            body
        }
    }

    fn render_human(event: &LifetimeEvent) -> String {
        match event {
            LifetimeEvent::ThreadRegistered { thread, bucket } => {
                format!("[BRC] Thread {} registered (bucket {})", thread, bucket)
            },
            LifetimeEvent::ThreadUnregistered {
                thread,
                drained,
                merged,
                handed_off,
                deallocated,
            } => format!(
                "[BRC] Thread {} unregistered ({} drained, {} merged, {} handed off, {} deallocated)",
                thread, drained, merged, handed_off, deallocated
            ),
            LifetimeEvent::MergeQueueDrained {
                thread,
                merged,
                deallocated,
            } => format!(
                "[BRC] Thread {} drained merge queue ({} merged, {} deallocated)",
                thread, merged, deallocated
            ),
            LifetimeEvent::ObjectPromoted {
                thread,
                address,
                refcount,
            } => format!(
                "[BRC] Object {:#x} promoted to immortal by thread {} at refcount {}",
                address, thread, refcount
            ),
            LifetimeEvent::OwnerGone {
                thread,
                owner,
                address,
            } => format!(
                "[BRC] Thread {} merged object {:#x} for exited owner {}",
                thread, address, owner
            ),
            LifetimeEvent::CallbackPanicked { address, message } => format!(
                "[BRC] Weak callback for object {:#x} panicked: {}",
                address, message
            ),
        }
    }

    fn render_json(event: &LifetimeEvent) -> String {
        serde_json::to_string(event).unwrap_or_else(|err| format!("{{\"error\":\"{}\"}}", err))
    }

    /// Get all retained events, oldest first
    pub fn get_events(&self) -> Vec<(Instant, LifetimeEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new(EventLoggerConfig::default())
    }
}
