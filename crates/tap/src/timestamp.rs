//! Timestamp provider for log and echo lines.

use std::fmt;
use std::sync::Arc;

/// Formats the current time for a log line.
///
/// The default renders local wall-clock time as `HH:MM:SS`. Any
/// `Fn() -> String` can replace it, which keeps test output deterministic.
#[derive(Clone)]
pub struct Timestamp(Arc<dyn Fn() -> String + Send + Sync>);

impl Timestamp {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Local time formatted as `HH:MM:SS`.
    pub fn clock() -> Self {
        Self::new(|| chrono::Local::now().format("%H:%M:%S").to_string())
    }

    pub fn now(&self) -> String {
        (self.0)()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::clock()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Timestamp(..)")
    }
}
