use std::time::{Duration, Instant};
use tracing::info;

/// Counters for the serial poll loop, logged periodically so a quiet or
/// misbehaving device shows up in the logs without tracing every cycle.
pub struct SessionMetrics {
    /// Poll cycles started
    cycles: u64,
    /// Lines parsed into a sensor sample
    samples: u64,
    /// Lines dropped because they did not parse
    parse_errors: u64,
    /// Serial I/O errors observed
    io_errors: u64,
    last_log: Instant,
    log_interval: Duration,
}

impl SessionMetrics {
    pub fn new(log_interval: Duration) -> Self {
        Self {
            cycles: 0,
            samples: 0,
            parse_errors: 0,
            io_errors: 0,
            last_log: Instant::now(),
            log_interval,
        }
    }

    pub fn record_cycle(&mut self) {
        self.cycles += 1;
    }

    pub fn record_sample(&mut self) {
        self.samples += 1;
    }

    pub fn record_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    pub fn record_io_error(&mut self) {
        self.io_errors += 1;
    }

    /// Log and reset the counters once the logging interval has elapsed.
    /// Returns true if a log line was written.
    pub fn maybe_log(&mut self) -> bool {
        if self.last_log.elapsed() < self.log_interval {
            return false;
        }
        self.log();
        self.cycles = 0;
        self.samples = 0;
        self.parse_errors = 0;
        self.io_errors = 0;
        self.last_log = Instant::now();
        true
    }

    /// Write the current counters to the info log
    pub fn log(&self) {
        info!(
            "[Poll] cycles: {}, samples: {}, parse errors: {}, I/O errors: {}",
            self.cycles, self.samples, self.parse_errors, self.io_errors
        );
    }
}
