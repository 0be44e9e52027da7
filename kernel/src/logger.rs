//! Log sink for the memory core.
//!
//! Records are buffered until a sink is attached (early boot has nowhere to
//! write them), then the buffer is replayed into the sink and later records
//! stream straight through.

use conquer_once::spin::OnceCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

const BUFFER_SIZE: usize = 8192;

/// Destination for formatted log lines.
pub type LogSink = fn(&str);

static SINK: OnceCell<LogSink> = OnceCell::uninit();

/// Buffer for storing log messages before a sink is attached
struct LogBuffer {
    buffer: [u8; BUFFER_SIZE],
    position: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            position: 0,
        }
    }

    fn contents(&self) -> &str {
        core::str::from_utf8(&self.buffer[..self.position]).unwrap_or("<invalid UTF-8>")
    }

    fn clear(&mut self) {
        self.position = 0;
    }

    /// Append one record and its newline, or nothing if it does not fit
    fn push_line(&mut self, line: &str) -> bool {
        let bytes = line.as_bytes();
        let end = self.position + bytes.len() + 1;
        if end > BUFFER_SIZE {
            return false;
        }
        self.buffer[self.position..end - 1].copy_from_slice(bytes);
        self.buffer[end - 1] = b'\n';
        self.position = end;
        true
    }
}

/// Formats one record into a stack buffer before handing it on.
struct LineBuffer {
    bytes: [u8; 256],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; 256],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("<invalid UTF-8>")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let mut take = s.len().min(room);
        // Truncate on a character boundary
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub struct MemoryLogger {
    buffer: Mutex<LogBuffer>,
    count_trace: AtomicBool,
    suppressed: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryLogger {
    const fn new() -> Self {
        Self {
            buffer: Mutex::new(LogBuffer::new()),
            count_trace: AtomicBool::new(false),
            suppressed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of TRACE records that were counted instead of emitted
    pub fn suppressed_trace_records(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Records lost because the early buffer was full
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn format(record: &Record) -> LineBuffer {
        let mut line = LineBuffer::new();
        let _ = write!(line, "[{:>5}] {}: {}", record.level(), record.target(), record.args());
        line
    }
}

impl Log for MemoryLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.level() == Level::Trace && self.count_trace.load(Ordering::Relaxed) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let line = Self::format(record);
        match SINK.get() {
            Some(sink) => sink(line.as_str()),
            None => {
                // try_lock: a record emitted while the buffer is held (a
                // bugcheck inside a logging path) is dropped, not deadlocked on.
                let stored = self
                    .buffer
                    .try_lock()
                    .is_some_and(|mut buffer| buffer.push_line(line.as_str()));
                if !stored {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn flush(&self) {}
}

pub static MEMORY_LOGGER: MemoryLogger = MemoryLogger::new();

/// Install the logger at `level`. Records are buffered until
/// [`attach_sink`] is called.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&MEMORY_LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Count TRACE records instead of emitting them. Only has an effect while
/// the max level lets TRACE records through.
pub fn set_trace_counting(enabled: bool) {
    MEMORY_LOGGER.count_trace.store(enabled, Ordering::Relaxed);
}

/// Attach the output sink and replay everything buffered so far.
///
/// Only the first sink sticks; later calls are ignored.
pub fn attach_sink(sink: LogSink) {
    if SINK.try_init_once(|| sink).is_err() {
        return;
    }
    let mut buffer = MEMORY_LOGGER.buffer.lock();
    for line in buffer.contents().lines() {
        sink(line);
    }
    buffer.clear();
}
