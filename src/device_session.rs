use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::actuators::ActuatorCommand;
use crate::sensor_sample::SensorSample;
use crate::serial_link::{ConnectError, SerialLink};
use crate::session_metrics::SessionMetrics;

/// Line sent to request a fresh sensor reading
const READ_REQUEST: &[u8] = b"R";

/// Wait after opening the port while the microcontroller resets
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Wait between the read request and checking for the response
const RESPONSE_DELAY: Duration = Duration::from_millis(500);
/// Pause between poll cycles
const CYCLE_INTERVAL: Duration = Duration::from_secs(2);
/// How long disconnect() waits for the poll thread before closing the
/// port out from under it
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How often the poll loop logs its counters
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Connection lifecycle of the device session.
///
/// Faulted means the poll loop died on an I/O error; the session keeps
/// its last sample but refuses commands until the next connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Faulted = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Faulted,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// State shared between the session handle, the poll thread, and any
/// number of HTTP request threads.
struct SessionShared {
    /// The serial link; one mutex serializes every write on the wire,
    /// whether it comes from the poll loop or a command sender.
    link: Mutex<Option<SerialLink>>,
    /// Most recent snapshot; replaced wholesale on each parsed line so
    /// readers never see a torn sample.
    sample: RwLock<SensorSample>,
    state: AtomicU8,
    stop: AtomicBool,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            link: Mutex::new(None),
            sample: RwLock::new(SensorSample::default()),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            stop: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn with_link<T>(&self, f: impl FnOnce(&mut SerialLink) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.link.lock().unwrap();
        match guard.as_mut() {
            Some(link) => f(link),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial link is closed",
            )),
        }
    }
}

/// Owner of the serial connection lifecycle.
///
/// Holds at most one open link and at most one background poll thread at
/// a time. All methods take `&self`; the session is shared across HTTP
/// handlers behind an `Arc`.
pub struct DeviceSession {
    shared: Arc<SessionShared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect/disconnect so concurrent requests can never
    /// race two poll threads into existence.
    lifecycle: Mutex<()>,
    baud_rate: u32,
}

impl DeviceSession {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            shared: Arc::new(SessionShared::new()),
            poll_thread: Mutex::new(None),
            lifecycle: Mutex::new(()),
            baud_rate,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the serial device and start the poll loop.
    ///
    /// If a previous session is still up (or faulted), it is fully torn
    /// down first so no second poll thread can ever run. Blocks for the
    /// settle delay (the controller resets when the port opens) before
    /// returning success.
    pub fn connect(&self, port: &str) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().unwrap();
        if self.shared.state() != ConnectionState::Disconnected {
            self.teardown();
        }
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {} at {} baud", port, self.baud_rate);

        let link = match SerialLink::open(port, self.baud_rate) {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        thread::sleep(SETTLE_DELAY);

        *self.shared.link.lock().unwrap() = Some(link);
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connected);

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || poll_loop(shared));
        *self.poll_thread.lock().unwrap() = Some(handle);

        info!("Device session connected on {}", port);
        Ok(())
    }

    /// Stop the poll loop and close the serial link.
    ///
    /// Returns false if the session was already disconnected. Close
    /// errors are logged and swallowed; the session always ends up in
    /// the Disconnected state. If the poll thread does not exit within
    /// the join timeout the port is closed anyway — the thread then hits
    /// an I/O error on its next access and finishes on its own.
    pub fn disconnect(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap();
        if self.shared.state() == ConnectionState::Disconnected {
            return false;
        }
        self.teardown();
        true
    }

    /// Stop the poll thread, close the link, and settle in the
    /// Disconnected state. Caller must hold the lifecycle lock.
    fn teardown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("Poll thread exited with a panic");
                }
            } else {
                warn!(
                    "Poll thread did not stop within {:?}, closing port anyway",
                    JOIN_TIMEOUT
                );
            }
        }

        if let Some(mut link) = self.shared.link.lock().unwrap().take() {
            link.close();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Device session disconnected");
    }

    /// The most recently parsed sample, or the zeroed default if nothing
    /// has been received yet. Never blocks on the poll thread.
    pub fn read_current_sample(&self) -> SensorSample {
        self.shared.sample.read().unwrap().clone()
    }

    /// Translate and write an actuator command to the device.
    ///
    /// Returns false instead of failing loudly when the session is not
    /// connected or the write does not go through.
    pub fn send_command(&self, command: ActuatorCommand) -> bool {
        if self.shared.state() != ConnectionState::Connected {
            debug!("Ignoring {:?}: session not connected", command);
            return false;
        }
        let result = self
            .shared
            .with_link(|link| link.write_line(&[command.device_code()]));
        match result {
            Ok(()) => {
                debug!("Sent {:?} to device", command);
                true
            }
            Err(e) => {
                warn!("Failed to send {:?}: {}", command, e);
                false
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Background poll loop: request a reading, give the device time to
/// answer, parse whatever came back, sleep, repeat. Runs until stopped
/// or until the first serial I/O error.
fn poll_loop(shared: Arc<SessionShared>) {
    debug!("Poll loop started");
    let mut metrics = SessionMetrics::new(METRICS_INTERVAL);

    while shared.state() == ConnectionState::Connected && !shared.stop_requested() {
        metrics.record_cycle();
        if let Err(e) = poll_cycle(&shared, &mut metrics) {
            if shared.stop_requested() {
                // disconnect() closed the port under us; this error is
                // the expected termination signal.
                debug!("Poll loop stopping: {}", e);
            } else {
                metrics.record_io_error();
                warn!("Serial I/O error, faulting session: {}", e);
                shared.set_state(ConnectionState::Faulted);
            }
            break;
        }
        metrics.maybe_log();
        sleep_unless_stopped(&shared, CYCLE_INTERVAL);
    }
    metrics.log();
    debug!("Poll loop exited");
}

fn poll_cycle(shared: &SessionShared, metrics: &mut SessionMetrics) -> io::Result<()> {
    shared.with_link(|link| link.write_line(READ_REQUEST))?;
    sleep_unless_stopped(shared, RESPONSE_DELAY);
    if shared.stop_requested() {
        return Ok(());
    }
    if let Some(line) = shared.with_link(|link| link.read_available_line())? {
        handle_line(shared, &line, metrics);
    }
    Ok(())
}

/// Parse one line from the device and publish the new snapshot. A line
/// that does not parse is logged and dropped; the current sample stays
/// exactly as it was.
fn handle_line(shared: &SessionShared, line: &str, metrics: &mut SessionMetrics) {
    match SensorSample::from_line(line) {
        Ok(sample) => {
            debug!(
                "Sensor reading: temperature={:.1} soil_moisture={:.0} humidity={:.1}",
                sample.temperature, sample.soil_moisture, sample.humidity
            );
            *shared.sample.write().unwrap() = sample;
            metrics.record_sample();
        }
        Err(e) => {
            metrics.record_parse_error();
            warn!("Dropping unparseable sensor line {:?}: {}", line, e);
        }
    }
}

/// Sleep in short slices so a disconnect does not have to wait out a
/// full cycle interval.
fn sleep_unless_stopped(shared: &SessionShared, total: Duration) {
    let deadline = Instant::now() + total;
    while !shared.stop_requested() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metrics() -> SessionMetrics {
        SessionMetrics::new(Duration::from_secs(60))
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let session = DeviceSession::new(9600);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_sample_before_first_reading_is_default() {
        let session = DeviceSession::new(9600);
        let sample = session.read_current_sample();
        assert_eq!(sample, SensorSample::default());
        assert!(sample.last_update.is_none());
    }

    #[test]
    fn test_send_command_when_disconnected_returns_false() {
        let session = DeviceSession::new(9600);
        assert!(!session.send_command(ActuatorCommand::PumpOn));
    }

    #[test]
    fn test_disconnect_when_already_disconnected_returns_false() {
        let session = DeviceSession::new(9600);
        assert!(!session.disconnect());
        assert!(!session.disconnect());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_to_missing_device_fails_cleanly() {
        let session = DeviceSession::new(9600);
        let result = session.connect("/dev/greenhouse-test-no-such-port");
        assert!(result.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.send_command(ActuatorCommand::HeaterOn));
    }

    #[test]
    fn test_handle_line_publishes_sample() {
        let shared = SessionShared::new();
        let mut metrics = test_metrics();
        handle_line(&shared, "22.5,410", &mut metrics);

        let sample = shared.sample.read().unwrap().clone();
        assert_eq!(sample.temperature, 22.5);
        assert_eq!(sample.soil_moisture, 410.0);
        assert_eq!(sample.humidity, 43.3);
        assert!(sample.last_update.is_some());
    }

    #[test]
    fn test_handle_line_keeps_sample_on_parse_failure() {
        let shared = SessionShared::new();
        let mut metrics = test_metrics();
        handle_line(&shared, "22.5,410", &mut metrics);
        let before = shared.sample.read().unwrap().clone();

        handle_line(&shared, "notanumber", &mut metrics);
        let after = shared.sample.read().unwrap().clone();
        assert_eq!(before, after);
    }

    #[test]
    fn test_handle_line_replaces_previous_sample() {
        let shared = SessionShared::new();
        let mut metrics = test_metrics();
        handle_line(&shared, "22.5,410", &mut metrics);
        handle_line(&shared, "25.0,400", &mut metrics);

        let sample = shared.sample.read().unwrap().clone();
        assert_eq!(sample.temperature, 25.0);
        assert_eq!(sample.humidity, 45.0);
    }

    #[test]
    fn test_sleep_unless_stopped_exits_early() {
        let shared = SessionShared::new();
        shared.stop.store(true, Ordering::SeqCst);

        let start = Instant::now();
        sleep_unless_stopped(&shared, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_sleep_unless_stopped_runs_full_duration() {
        let shared = SessionShared::new();
        let start = Instant::now();
        sleep_unless_stopped(&shared, Duration::from_millis(120));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_poll_cycle_without_link_is_io_error() {
        let shared = SessionShared::new();
        let mut metrics = test_metrics();
        let err = poll_cycle(&shared, &mut metrics).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_concurrent_reads_during_publishes() {
        let shared = Arc::new(SessionShared::new());

        let writer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut metrics = test_metrics();
                for i in 0..200 {
                    let line = format!("{}.0,{}", 20 + (i % 10), 400 + (i % 50));
                    handle_line(&shared, &line, &mut metrics);
                }
            })
        };

        // Readers must always observe a coherent sample whose humidity
        // matches its own temperature and soil moisture.
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let sample = shared.sample.read().unwrap().clone();
                        let expected = crate::sensor_sample::derived_humidity(
                            sample.soil_moisture,
                            sample.temperature,
                        );
                        assert_eq!(sample.humidity, expected);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
