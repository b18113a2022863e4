use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Info,
  Warn,
  Error,
}

impl Level {
  fn as_str(self) -> &'static str {
    match self {
      Level::Info => "INFO",
      Level::Warn => "WARN",
      Level::Error => "ERROR",
    }
  }
}

enum Sink {
  File(Mutex<std::fs::File>),
  Memory(Mutex<Vec<String>>),
}

/// Append-only line log. Write failures are dropped so logging never fails a request.
pub struct Logger {
  sink: Sink,
}

impl Logger {
  pub fn new(path: &Path) -> anyhow::Result<Self> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self {
      sink: Sink::File(Mutex::new(file)),
    })
  }

  pub fn memory() -> Self {
    Self {
      sink: Sink::Memory(Mutex::new(Vec::new())),
    }
  }

  pub fn log(&self, level: Level, message: &str) {
    let ts = Utc::now().to_rfc3339();
    let line = format!("[{ts}] {}: {message}", level.as_str());
    match &self.sink {
      Sink::File(file) => {
        if let Ok(mut file) = file.lock() {
          let _ = writeln!(file, "{line}");
        }
      }
      Sink::Memory(lines) => {
        if let Ok(mut lines) = lines.lock() {
          lines.push(line);
        }
      }
    }
  }

  pub fn info(&self, message: &str) {
    self.log(Level::Info, message);
  }

  pub fn warn(&self, message: &str) {
    self.log(Level::Warn, message);
  }

  pub fn error(&self, message: &str) {
    self.log(Level::Error, message);
  }

  /// Captured lines; empty for file-backed loggers.
  pub fn lines(&self) -> Vec<String> {
    match &self.sink {
      Sink::File(_) => Vec::new(),
      Sink::Memory(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
    }
  }
}
