//! Event log and console echo.
//!
//! Every line has the form `<tag>:<timestamp> <text>`. The tag is the
//! process id for acceptor events and `<pid>.<connection>` for events
//! from a relay task, so lines from concurrent connections can be told
//! apart in one file.
//!
//! The log file is shared by all connections. Each line is written with a
//! single `write_all` under the sink's mutex and flushed right away, so
//! lines from different tasks never interleave mid-line. The write is
//! synchronous: a slow disk holds up the calling tokio worker, and every
//! task queued behind it, until the line is flushed.
//!
//! Echo lines go to a [`Console`], stdout unless replaced.

use crate::config::Verbosity;
use crate::timestamp::Timestamp;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// An open, append-mode log file.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

fn format_line(tag: &str, timestamp: &Timestamp, text: &str) -> String {
    format!("{}:{} {}\n", tag, timestamp.now(), text)
}

fn write_to_sink(sink: &LogSink, line: &str) {
    if let Err(e) = sink.append(line) {
        warn!(path = %sink.path().display(), error = %e, "Failed to write log line");
    }
}

/// Writer that receives echo lines.
#[derive(Clone)]
pub struct Console(Arc<Mutex<dyn Write + Send>>);

impl Console {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    fn write_line(&self, line: &str) {
        let mut out = self.0.lock();
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Console")
    }
}

/// Tap-wide logging state.
///
/// Verbosity and the log file can change while the tap is serving. A
/// connection takes a [`ConnectionLog`] snapshot when it is accepted and
/// keeps those settings for its whole life.
#[derive(Debug)]
pub struct EventLog {
    verbosity: AtomicU8,
    sink: RwLock<Option<Arc<LogSink>>>,
    timestamp: RwLock<Timestamp>,
    console: RwLock<Console>,
    pid: u32,
}

impl EventLog {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity: AtomicU8::new(verbosity.level()),
            sink: RwLock::new(None),
            timestamp: RwLock::new(Timestamp::default()),
            console: RwLock::new(Console::default()),
            pid: std::process::id(),
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.verbosity.load(Ordering::Relaxed))
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.verbosity.store(verbosity.level(), Ordering::Relaxed);
    }

    pub fn set_timestamp(&self, timestamp: Timestamp) {
        *self.timestamp.write() = timestamp;
    }

    /// Send echo lines to `console` instead of stdout.
    pub fn set_console(&self, console: Console) {
        *self.console.write() = console;
    }

    /// Point the log at `path`, or disable it with an empty string.
    ///
    /// Opening failures are reported on the echo channel and leave logging
    /// disabled. Returns whether a log file is active afterwards.
    pub fn set_log_file(&self, path: &str) -> bool {
        // Drop the previous handle first so switching files never holds two.
        let previous = self.sink.write().take();
        drop(previous);

        if path.is_empty() {
            debug!("Log file disabled");
            return false;
        }

        match LogSink::open(path) {
            Ok(sink) => {
                debug!(path = %path, "Log file opened");
                *self.sink.write() = Some(Arc::new(sink));
                true
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Cannot open log file");
                self.echo(&format!("cannot open log file {}: {}", path, e));
                false
            }
        }
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.sink.read().as_ref().map(|s| s.path().to_path_buf())
    }

    pub fn is_logging(&self) -> bool {
        self.sink.read().is_some()
    }

    fn tag(&self) -> String {
        self.pid.to_string()
    }

    /// Append a line to the log file, if one is set.
    pub fn log(&self, text: &str) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            let line = format_line(&self.tag(), &self.timestamp.read(), text);
            write_to_sink(&sink, &line);
        }
    }

    /// Print a line on the console unless the tap is silent.
    pub fn echo(&self, text: &str) {
        if self.verbosity() > Verbosity::Silent {
            let line = format_line(&self.tag(), &self.timestamp.read(), text);
            self.console.read().write_line(&line);
        }
    }

    /// Log and echo.
    pub fn event(&self, text: &str) {
        self.log(text);
        self.echo(text);
    }

    /// Snapshot the current settings for connection `conn_id`.
    pub fn connection(&self, conn_id: u64) -> ConnectionLog {
        ConnectionLog {
            tag: format!("{}.{}", self.pid, conn_id),
            verbosity: self.verbosity(),
            sink: self.sink.read().clone(),
            timestamp: self.timestamp.read().clone(),
            console: self.console.read().clone(),
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(Verbosity::default())
    }
}

/// Logging handle owned by one relay task.
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    tag: String,
    verbosity: Verbosity,
    sink: Option<Arc<LogSink>>,
    timestamp: Timestamp,
    console: Console,
}

impl ConnectionLog {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn is_debug(&self) -> bool {
        self.verbosity >= Verbosity::Debug
    }

    pub fn log(&self, text: &str) {
        if let Some(sink) = &self.sink {
            write_to_sink(sink, &format_line(&self.tag, &self.timestamp, text));
        }
    }

    pub fn echo(&self, text: &str) {
        if self.verbosity > Verbosity::Silent {
            self.console
                .write_line(&format_line(&self.tag, &self.timestamp, text));
        }
    }

    pub fn event(&self, text: &str) {
        self.log(text);
        self.echo(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_clock() -> Timestamp {
        Timestamp::new(|| "12:00:00".to_string())
    }

    /// Console writer whose output the test can inspect.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    #[test]
    fn test_echo_respects_verbosity() {
        let captured = Captured::default();
        let log = EventLog::new(Verbosity::Silent);
        log.set_timestamp(fixed_clock());
        log.set_console(Console::new(captured.clone()));

        log.echo("quiet");
        log.connection(3).echo("quiet too");
        assert_eq!(captured.text(), "");

        log.set_verbosity(Verbosity::Normal);
        log.echo("loud");
        assert_eq!(
            captured.text(),
            format!("{}:12:00:00 loud\n", std::process::id())
        );
    }

    #[test]
    fn test_connection_echo_uses_tap_console() {
        let captured = Captured::default();
        let log = EventLog::new(Verbosity::Normal);
        log.set_timestamp(fixed_clock());
        log.set_console(Console::new(captured.clone()));

        log.connection(5).event("connect #5 from 127.0.0.1:4000");
        assert_eq!(
            captured.text(),
            format!("{}.5:12:00:00 connect #5 from 127.0.0.1:4000\n", std::process::id())
        );
    }

    #[test]
    fn test_log_without_sink_is_noop() {
        let log = EventLog::new(Verbosity::Silent);
        assert!(!log.is_logging());
        log.log("nothing happens");
    }

    #[test]
    fn test_log_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.log");

        let log = EventLog::new(Verbosity::Silent);
        log.set_timestamp(fixed_clock());
        assert!(log.set_log_file(path.to_str().unwrap()));
        log.log("hello");

        let conn = log.connection(7);
        conn.log("from connection");

        let content = std::fs::read_to_string(&path).unwrap();
        let pid = std::process::id();
        assert_eq!(
            content,
            format!(
                "{pid}:12:00:00 hello\n{pid}.7:12:00:00 from connection\n",
                pid = pid
            )
        );
    }

    #[test]
    fn test_disable_releases_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.log");

        let log = EventLog::new(Verbosity::Silent);
        log.set_log_file(path.to_str().unwrap());
        assert_eq!(log.log_path().as_deref(), Some(path.as_path()));

        assert!(!log.set_log_file(""));
        assert!(!log.is_logging());
        assert_eq!(log.log_path(), None);
        log.log("dropped");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.log");
        let path_str = path.to_str().unwrap();

        let log = EventLog::new(Verbosity::Silent);
        log.set_timestamp(fixed_clock());
        log.set_log_file(path_str);
        log.log("first");
        log.set_log_file("");
        log.set_log_file(path_str);
        log.log("second");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }

    #[test]
    fn test_unopenable_file_disables_logging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("tap.log");

        let log = EventLog::new(Verbosity::Silent);
        assert!(!log.set_log_file(path.to_str().unwrap()));
        assert!(!log.is_logging());
    }

    #[test]
    fn test_connection_snapshot_keeps_settings() {
        let log = EventLog::new(Verbosity::Debug);
        let conn = log.connection(1);
        log.set_verbosity(Verbosity::Silent);

        assert!(conn.is_debug());
        assert_eq!(log.connection(2).verbosity(), Verbosity::Silent);
        assert_eq!(conn.tag(), format!("{}.1", std::process::id()));
    }
}
