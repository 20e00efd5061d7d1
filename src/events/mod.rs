//! The append-only event log shared by all connection handlers: one line
//! per call, serialized by an internal lock.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct EventLog {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventLog {
    /// Open (or create) the log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<EventLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventLog::from_writer(file))
    }

    pub fn from_writer(out: impl Write + Send + 'static) -> EventLog {
        EventLog {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    /// Append one line. Write failures are swallowed: logging must never
    /// take a connection handler down with it.
    pub fn append(&self, line: &str) {
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}
