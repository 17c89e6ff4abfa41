//! Datalog sinks.
//!
//! The executor writes judged results through a [`Datalog`]: one sink for the synchronous
//! per-site path and another for deferred background judging.

use tracing::info;

use crate::limits::LimitSpec;
use crate::sites::Site;

/// Which scheduling domain produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Functional {
        schedule: Schedule,
        generation: u64,
        site: Site,
        suite: String,
        limits: LimitSpec,
        value: bool,
        passed: bool,
    },
    Parametric {
        schedule: Schedule,
        generation: u64,
        site: Site,
        pin: String,
        suite: String,
        limits: LimitSpec,
        value: f64,
        passed: bool,
    },
}

impl LogEntry {
    pub fn site(&self) -> Site {
        match self {
            LogEntry::Functional { site, .. } | LogEntry::Parametric { site, .. } => *site,
        }
    }

    pub fn passed(&self) -> bool {
        match self {
            LogEntry::Functional { passed, .. } | LogEntry::Parametric { passed, .. } => *passed,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            LogEntry::Functional { generation, .. } | LogEntry::Parametric { generation, .. } => {
                *generation
            }
        }
    }
}

pub trait Datalog {
    fn log(&mut self, entry: LogEntry);
}

/// Keeps every entry in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatalog {
    pub entries: Vec<LogEntry>,
}

impl MemoryDatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, site: Site) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |entry| entry.site() == site)
    }
}

impl Datalog for MemoryDatalog {
    fn log(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

/// Emits every entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDatalog;

impl Datalog for TracingDatalog {
    fn log(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Functional { schedule, generation, site, suite, value, passed, .. } => {
                info!(?schedule, generation, site, %suite, value, passed, "functional test");
            }
            LogEntry::Parametric { schedule, generation, site, pin, suite, limits, value, passed } => {
                info!(?schedule, generation, site, %pin, %suite, %limits, value, passed, "parametric test");
            }
        }
    }
}

impl<D: Datalog + ?Sized> Datalog for &mut D {
    fn log(&mut self, entry: LogEntry) {
        (**self).log(entry);
    }
}
