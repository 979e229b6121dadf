//! Run log sink, decoupled from the supervisor's hot paths.
//!
//! # Architecture
//!
//! ```text
//! log::info!/warn!/error!
//!     |
//! [RunLog] (stderr mirror, synchronous)
//!     | (crossbeam unbounded channel)
//!     v
//! [sink thread] -> run log file (append)
//!              -> syslog(3) when requested
//! ```
//!
//! The stderr mirror is written synchronously in `log()` so worker
//! processes, which inherit the facade but not the sink thread, still get
//! their lines out. Only the supervisor's sink thread drains the channel to
//! disk; a forked child enqueueing lines merely grows its private copy of
//! the queue until it _exits.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// A formatted log line with metadata.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub level: Level,
    pub timestamp: String,
}

enum LogMessage {
    Line(LogLine),
    /// Flush marker carrying a completion channel
    Flush(std::sync::mpsc::Sender<()>),
}

/// Logger implementation: stderr mirror plus background file/syslog sink.
pub struct RunLog {
    tx: Sender<LogMessage>,
    max_level: LevelFilter,
}

impl RunLog {
    /// Create the sink and spawn its background thread.
    ///
    /// `log_file` appends formatted lines; `syslog` forwards them to
    /// syslog(3) at a mapped priority.
    pub fn new(
        log_file: Option<PathBuf>,
        syslog: bool,
        max_level: LevelFilter,
    ) -> Result<RunLog, String> {
        let (tx, rx) = unbounded::<LogMessage>();

        let mut file = match &log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| format!("failed to create log dir: {}", e))?;
                    }
                }
                Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| format!("failed to open log file: {}", e))?,
                )
            }
            None => None,
        };

        // Plain OS thread with blocking recv: reliable from any caller,
        // independent of what the supervisor is doing.
        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        if let Some(f) = file.as_mut() {
                            let _ = writeln!(
                                f,
                                "[{}] [{}] {}",
                                line.timestamp, line.level, line.message
                            );
                        }
                        if syslog {
                            forward_to_syslog(&line);
                        }
                    }
                    LogMessage::Flush(done) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush();
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(RunLog { tx, max_level })
    }

    /// Install this sink as the global logger.
    pub fn install(self) -> Result<(), String> {
        let max_level = self.max_level;
        log::set_boxed_logger(Box::new(self))
            .map(|()| log::set_max_level(max_level))
            .map_err(|e| format!("failed to set logger: {}", e))
    }

    /// Block until every queued line reached the sink.
    pub fn wait_for_empty(&self) {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.tx.send(LogMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv_timeout(std::time::Duration::from_secs(5));
        }
    }
}

fn forward_to_syslog(line: &LogLine) {
    let priority = match line.level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    };
    if let Ok(msg) = CString::new(line.message.clone()) {
        // "%s" keeps any formatting characters in the message inert
        unsafe { libc::syslog(priority, b"%s\0".as_ptr() as *const libc::c_char, msg.as_ptr()) };
    }
}

impl Log for RunLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = LogLine {
            message: record.args().to_string(),
            level: record.level(),
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        };
        eprintln!("[{}] [{}] {}", line.timestamp, line.level, line.message);
        let _ = self.tx.send(LogMessage::Line(line));
    }

    fn flush(&self) {
        self.wait_for_empty();
    }
}
