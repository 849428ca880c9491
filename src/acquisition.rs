use chrono::Local;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture_driver::{CaptureDriver, CaptureError};
use crate::error::ErrorKind;
use crate::lock;
use crate::sample_record::SampleRecord;
use crate::stream_buffer::StreamBuffer;

/// Points returned by a stream query when the caller does not choose.
pub const DEFAULT_STREAM_POINTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Running,
    Stopping,
}

impl AcquisitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Running => "running",
            AcquisitionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Acquisition duration must be greater than zero (got {duration_ms} ms)")]
    InvalidDuration { duration_ms: u32 },

    #[error("Invalid acquisition filename '{name}': {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    #[error("Acquisition is already {state}; stop it before starting a new session")]
    AlreadyActive { state: AcquisitionState },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Sample index space exhausted after {samples} samples")]
    IndexOverflow { samples: u64 },

    #[error("Acquisition worker panicked")]
    WorkerPanicked,
}

impl AcquisitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquisitionError::InvalidDuration { .. } | AcquisitionError::InvalidFilename { .. } => {
                ErrorKind::InvalidConfig
            }
            AcquisitionError::AlreadyActive { .. } => ErrorKind::InvalidState,
            AcquisitionError::Io { .. } => ErrorKind::IoFailure,
            AcquisitionError::Capture(_)
            | AcquisitionError::IndexOverflow { .. }
            | AcquisitionError::WorkerPanicked => ErrorKind::CaptureFailure,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        AcquisitionError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Directory that receives the `.bin` record files.
    pub output_dir: PathBuf,
    /// Records kept for stream queries.
    pub stream_capacity: usize,
    /// Prefix of the timestamped name used when no filename is configured.
    pub file_prefix: String,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            stream_capacity: StreamBuffer::DEFAULT_CAPACITY,
            file_prefix: "acquisition".to_string(),
        }
    }
}

/// Pending configuration, read once when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub duration_ms: u32,
    /// Base name without extension.
    pub filename: Option<String>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            duration_ms: AcquisitionConfig::DEFAULT_DURATION_MS,
            filename: None,
        }
    }
}

impl AcquisitionConfig {
    pub const DEFAULT_DURATION_MS: u32 = 1000;
}

#[derive(Debug, Clone)]
pub struct AcquisitionStatus {
    pub state: AcquisitionState,
    /// File of the current or most recent session.
    pub file: Option<PathBuf>,
    pub samples_written: u64,
    /// Pending duration for the next session.
    pub duration_ms: u32,
    /// Failure of the most recent session, if it ended with one.
    pub last_error: Option<AcquisitionError>,
}

/// State and decimated samples observed together.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub state: AcquisitionState,
    pub records: Vec<SampleRecord>,
}

struct Session {
    state: AcquisitionState,
    pending: AcquisitionConfig,
    file: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
    last_error: Option<AcquisitionError>,
}

struct Shared {
    session: Mutex<Session>,
    /// Signalled when a session returns to `Idle`.
    idle: Condvar,
    stream: StreamBuffer,
    samples_written: AtomicU64,
}

impl Shared {
    fn wait_idle(&self) -> MutexGuard<'_, Session> {
        let mut session = lock(&self.session);
        while session.state != AcquisitionState::Idle {
            session = self
                .idle
                .wait(session)
                .unwrap_or_else(PoisonError::into_inner);
        }
        session
    }

    fn enter_stopping(&self) {
        let mut session = lock(&self.session);
        if session.state == AcquisitionState::Running {
            session.state = AcquisitionState::Stopping;
        }
    }
}

/// Owns the acquisition lifecycle: configuration, the producer thread, the
/// record file and the stream buffer.
///
/// Every method takes `&self`, so the controller can be shared behind an
/// `Arc` between request handlers.
pub struct AcquisitionController<D: CaptureDriver> {
    settings: AcquisitionSettings,
    buffer_period: Duration,
    driver: Arc<Mutex<D>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: CaptureDriver> AcquisitionController<D> {
    pub const FILE_EXTENSION: &'static str = "bin";

    pub fn new(driver: D, settings: AcquisitionSettings) -> Self {
        let buffer_period = driver.buffer_period();
        let stream = StreamBuffer::with_capacity(settings.stream_capacity);
        Self {
            settings,
            buffer_period,
            driver: Arc::new(Mutex::new(driver)),
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: AcquisitionState::Idle,
                    pending: AcquisitionConfig::default(),
                    file: None,
                    cancel: Arc::new(AtomicBool::new(false)),
                    last_error: None,
                }),
                idle: Condvar::new(),
                stream,
                samples_written: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Set the duration of the next session. Rounded up to whole buffer
    /// periods when the session starts.
    pub fn set_duration(&self, duration_ms: u32) -> Result<(), AcquisitionError> {
        if duration_ms == 0 {
            return Err(AcquisitionError::InvalidDuration { duration_ms });
        }
        log::info!("Setting acquisition duration to {} ms", duration_ms);
        lock(&self.shared.session).pending.duration_ms = duration_ms;
        Ok(())
    }

    /// Set the base filename of the next session, dropping any extension.
    /// Returns the stored base name.
    pub fn set_filename(&self, name: &str) -> Result<String, AcquisitionError> {
        let base = sanitize_filename(name)?;
        log::info!("Setting acquisition filename to {}", base);
        lock(&self.shared.session).pending.filename = Some(base.clone());
        Ok(base)
    }

    pub fn config(&self) -> AcquisitionConfig {
        lock(&self.shared.session).pending.clone()
    }

    /// Duration the next session will actually run for.
    pub fn rounded_duration(&self) -> Duration {
        let buffers = buffers_for(self.config().duration_ms, self.buffer_period);
        self.buffer_period
            .saturating_mul(u32::try_from(buffers).unwrap_or(u32::MAX))
    }

    /// Start a session in the background and return the path being written.
    ///
    /// Rejected with `AlreadyActive` unless the controller is idle.
    pub fn start(&self) -> Result<PathBuf, AcquisitionError> {
        let mut worker = lock(&self.worker);
        let mut session = lock(&self.shared.session);

        if session.state != AcquisitionState::Idle {
            log::warn!("Start requested while acquisition is {}", session.state);
            return Err(AcquisitionError::AlreadyActive {
                state: session.state,
            });
        }

        // A finished producer has already published Idle; reap it.
        if let Some(finished) = worker.take() {
            join_worker(finished);
        }

        let base = session
            .pending
            .filename
            .clone()
            .unwrap_or_else(|| default_filename(&self.settings.file_prefix));
        let path = self
            .settings
            .output_dir
            .join(format!("{}.{}", base, Self::FILE_EXTENSION));
        let buffers = buffers_for(session.pending.duration_ms, self.buffer_period);

        self.shared.stream.reset();
        self.shared.samples_written.store(0, Ordering::Release);
        session.last_error = None;
        session.file = Some(path.clone());

        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                let err = AcquisitionError::io(&path, e);
                log::error!("Cannot create acquisition file: {}", err);
                session.last_error = Some(err.clone());
                return Err(err);
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let producer = {
            let shared = Arc::clone(&self.shared);
            let driver = Arc::clone(&self.driver);
            let cancel = Arc::clone(&cancel);
            let path = path.clone();
            thread::Builder::new()
                .name("acquisition".to_string())
                .spawn(move || run_producer(&shared, &driver, file, &path, buffers, &cancel))
        };
        let handle = match producer {
            Ok(handle) => handle,
            Err(e) => {
                let err = AcquisitionError::io(&path, e);
                log::error!("Cannot spawn acquisition worker: {}", err);
                session.last_error = Some(err.clone());
                return Err(err);
            }
        };

        session.state = AcquisitionState::Running;
        session.cancel = cancel;
        *worker = Some(handle);
        log::info!(
            "Acquisition started: {} buffer(s) of {:?} into {}",
            buffers,
            self.buffer_period,
            path.display()
        );
        Ok(path)
    }

    /// Ask the producer to finish at the next buffer boundary and wait until
    /// the file is closed. No effect when idle.
    pub fn stop(&self) {
        let handle = {
            let mut worker = lock(&self.worker);
            let mut session = lock(&self.shared.session);
            if session.state == AcquisitionState::Running {
                log::info!("Stopping acquisition");
                session.state = AcquisitionState::Stopping;
                session.cancel.store(true, Ordering::Release);
            }
            worker.take()
        };
        if let Some(handle) = handle {
            join_worker(handle);
        }
        self.shared.wait_idle();
    }

    /// Block until the current session ends and report how it ended.
    ///
    /// Returns only once the controller is `Idle`, also when another caller
    /// is already joining the producer.
    pub fn wait(&self) -> Result<(), AcquisitionError> {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            join_worker(handle);
        }
        self.shared.wait_idle().last_error.clone().map_or(Ok(()), Err)
    }

    pub fn state(&self) -> AcquisitionState {
        lock(&self.shared.session).state
    }

    pub fn status(&self) -> AcquisitionStatus {
        let session = lock(&self.shared.session);
        AcquisitionStatus {
            state: session.state,
            file: session.file.clone(),
            samples_written: self.shared.samples_written.load(Ordering::Acquire),
            duration_ms: session.pending.duration_ms,
            last_error: session.last_error.clone(),
        }
    }

    pub fn downsample(&self, max_points: usize) -> Vec<SampleRecord> {
        self.shared.stream.downsample(max_points)
    }

    /// Decimated samples together with the state they belong to.
    pub fn stream_snapshot(&self, max_points: usize) -> StreamSnapshot {
        let session = lock(&self.shared.session);
        StreamSnapshot {
            state: session.state,
            records: self.shared.stream.downsample(max_points),
        }
    }

    pub fn stream(&self) -> &StreamBuffer {
        &self.shared.stream
    }
}

impl<D: CaptureDriver> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("Acquisition worker panicked");
    }
}

/// Publishes the session outcome and returns the controller to `Idle` when
/// the producer exits, including by panic.
struct SessionGuard<'a> {
    shared: &'a Shared,
    outcome: Option<Result<u64, AcquisitionError>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut session = lock(&self.shared.session);
        match self.outcome.take() {
            Some(Ok(samples)) => {
                log::info!("Acquisition finished: {} samples written", samples);
            }
            Some(Err(err)) => {
                log::error!("Acquisition aborted: {}", err);
                session.last_error = Some(err);
            }
            None => {
                log::error!("Acquisition worker exited without an outcome");
                session.last_error = Some(AcquisitionError::WorkerPanicked);
            }
        }
        session.state = AcquisitionState::Idle;
        self.shared.idle.notify_all();
    }
}

fn run_producer<D: CaptureDriver>(
    shared: &Shared,
    driver: &Mutex<D>,
    file: File,
    path: &Path,
    buffers: u64,
    cancel: &AtomicBool,
) {
    let mut guard = SessionGuard {
        shared,
        outcome: None,
    };
    let span = tracing::debug_span!("acquisition_session", file = %path.display(), buffers);
    let _entered = span.enter();

    let mut driver = lock(driver);
    let outcome = match driver.begin() {
        Ok(()) => {
            let result = capture_buffers(shared, &mut *driver, file, path, buffers, cancel);
            driver.end();
            result
        }
        Err(e) => {
            shared.stream.set_status(e.status);
            Err(e.into())
        }
    };
    drop(driver);
    guard.outcome = Some(outcome);
}

const INDEX_SPACE: u64 = 1 << 32;

fn capture_buffers<D: CaptureDriver>(
    shared: &Shared,
    driver: &mut D,
    file: File,
    path: &Path,
    buffers: u64,
    cancel: &AtomicBool,
) -> Result<u64, AcquisitionError> {
    let mut writer = BufWriter::new(file);
    let mut samples = Vec::with_capacity(driver.samples_per_buffer());
    let mut block = Vec::with_capacity(driver.samples_per_buffer());
    let mut written: u64 = 0;

    for _ in 0..buffers {
        if cancel.load(Ordering::Acquire) {
            log::debug!("Stop observed after {} samples", written);
            break;
        }

        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("capture_buffer"), 0));

        if let Err(e) = driver.read_buffer(&mut samples) {
            shared.stream.set_status(e.status);
            return Err(e.into());
        }

        let room = INDEX_SPACE - written;
        let usable = samples.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        block.clear();
        block.extend(
            samples[..usable]
                .iter()
                .enumerate()
                .map(|(offset, &value)| SampleRecord::new((written + offset as u64) as u32, value)),
        );

        for record in &block {
            record
                .write_to(&mut writer)
                .map_err(|e| AcquisitionError::io(path, e))?;
        }
        shared.stream.push_all(&block);
        written += block.len() as u64;
        shared.samples_written.store(written, Ordering::Release);

        if usable < samples.len() {
            return Err(AcquisitionError::IndexOverflow { samples: written });
        }
    }

    shared.enter_stopping();
    let file = writer
        .into_inner()
        .map_err(|e| AcquisitionError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| AcquisitionError::io(path, e))?;
    Ok(written)
}

/// Number of hardware buffers needed to cover `duration_ms`, rounded up.
pub fn buffers_for(duration_ms: u32, buffer_period: Duration) -> u64 {
    let period_us = buffer_period.as_micros().max(1);
    let duration_us = u128::from(duration_ms) * 1000;
    u64::try_from(duration_us.div_ceil(period_us)).unwrap_or(u64::MAX)
}

/// Normalise a caller-supplied filename to the base name the controller
/// stores: whitespace trimmed and one trailing `.<ext>` removed.
pub fn sanitize_filename(name: &str) -> Result<String, AcquisitionError> {
    let invalid = |reason| AcquisitionError::InvalidFilename {
        name: name.to_string(),
        reason,
    };

    let trimmed = name.trim();
    let base = trimmed.rsplit_once('.').map_or(trimmed, |(stem, _)| stem);

    if base.is_empty() {
        return Err(invalid("base name is empty"));
    }
    if base.contains(&['/', '\\', '\0'][..]) {
        return Err(invalid("path separators are not allowed"));
    }
    if base.chars().all(|c| c == '.') {
        return Err(invalid("base name is only dots"));
    }
    Ok(base.to_string())
}

fn default_filename(prefix: &str) -> String {
    format!("{}_{}", prefix, Local::now().format("%Y%m%d_%H%M%S_%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_driver::SimulatedCapture;
    use crate::sample_record::{read_record_file, verify_integrity};
    use std::time::Instant;

    fn controller(
        dir: &Path,
        driver: SimulatedCapture,
    ) -> AcquisitionController<SimulatedCapture> {
        AcquisitionController::new(
            driver,
            AcquisitionSettings {
                output_dir: dir.to_path_buf(),
                ..AcquisitionSettings::default()
            },
        )
    }

    fn fast_driver() -> SimulatedCapture {
        SimulatedCapture::with_buffer(100, Duration::from_millis(1)).paced(false)
    }

    #[test]
    fn test_set_duration_rejects_zero() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver());
        let err = acq.set_duration(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(acq.config().duration_ms, AcquisitionConfig::DEFAULT_DURATION_MS);

        acq.set_duration(250).unwrap();
        assert_eq!(acq.config().duration_ms, 250);
    }

    #[test]
    fn test_filename_extension_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver());
        assert_eq!(acq.set_filename("trace.bin").unwrap(), "trace");
        let first = acq.config().filename;
        assert_eq!(acq.set_filename("trace").unwrap(), "trace");
        assert_eq!(acq.config().filename, first);
    }

    #[test]
    fn test_sanitize_filename_cases() {
        assert_eq!(sanitize_filename("  run_01.dat ").unwrap(), "run_01");
        assert_eq!(sanitize_filename("a.b.c").unwrap(), "a.b");
        for bad in ["", "   ", ".bin", "..", "dir/trace", "..\\x.bin"] {
            let err = sanitize_filename(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "{bad:?}");
        }
    }

    #[test]
    fn test_buffers_round_up() {
        let period = Duration::from_micros(65_536);
        assert_eq!(buffers_for(1, period), 1);
        assert_eq!(buffers_for(65, period), 1);
        assert_eq!(buffers_for(66, period), 2);
        assert_eq!(buffers_for(1000, period), 16);
        assert_eq!(buffers_for(5, Duration::ZERO), 5000);
    }

    #[test]
    fn test_full_session_writes_contiguous_file() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver());
        acq.set_duration(5).unwrap();
        acq.set_filename("session.bin").unwrap();

        let path = acq.start().unwrap();
        assert_eq!(path, dir.path().join("session.bin"));
        acq.wait().unwrap();

        let status = acq.status();
        assert_eq!(status.state, AcquisitionState::Idle);
        assert_eq!(status.samples_written, 500);
        assert!(status.last_error.is_none());

        let records = read_record_file(&path).unwrap();
        assert_eq!(records.len(), 500);
        verify_integrity(&records).unwrap();

        let points = acq.downsample(10);
        assert_eq!(points.len(), 10);
        assert_eq!(points.last().map(|r| r.index), Some(499));
    }

    #[test]
    fn test_default_filename_is_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver());
        acq.set_duration(1).unwrap();
        let path = acq.start().unwrap();
        acq.wait().unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("acquisition_"), "{name}");
        assert!(name.ends_with(".bin"), "{name}");
        assert!(path.exists());
    }

    #[test]
    fn test_second_start_is_rejected_without_second_producer() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedCapture::with_buffer(50, Duration::from_millis(5));
        let acq = controller(dir.path(), driver);
        acq.set_duration(10_000).unwrap();
        acq.set_filename("busy").unwrap();

        let path = acq.start().unwrap();
        let err = acq.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(matches!(
            err,
            AcquisitionError::AlreadyActive {
                state: AcquisitionState::Running
            }
        ));

        thread::sleep(Duration::from_millis(30));
        acq.stop();
        assert_eq!(acq.state(), AcquisitionState::Idle);

        let records = read_record_file(&path).unwrap();
        verify_integrity(&records).unwrap();
        assert_eq!(records.len() % 50, 0);
        assert_eq!(records.len() as u64, acq.status().samples_written);
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedCapture::with_buffer(10, Duration::from_millis(10));
        let acq = controller(dir.path(), driver);
        acq.stop();
        assert_eq!(acq.state(), AcquisitionState::Idle);

        acq.set_duration(60_000).unwrap();
        acq.start().unwrap();
        thread::sleep(Duration::from_millis(40));

        let begin = Instant::now();
        acq.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(acq.state(), AcquisitionState::Idle);
        assert!(acq.status().samples_written < 60_000 / 10 * 10);

        acq.stop();
        assert!(acq.wait().is_ok());
    }

    #[test]
    fn test_wait_blocks_until_idle_while_another_caller_joins() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedCapture::with_buffer(10, Duration::from_millis(5));
        let acq = controller(dir.path(), driver);
        acq.set_duration(60_000).unwrap();
        acq.start().unwrap();

        // Another caller already owns the join handle
        let handle = lock(&acq.worker).take().unwrap();
        let cancel = Arc::clone(&lock(&acq.shared.session).cancel);
        acq.shared.enter_stopping();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.store(true, Ordering::Release);
        });

        assert!(acq.wait().is_ok());
        assert_eq!(acq.state(), AcquisitionState::Idle);

        canceller.join().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_new_session_never_shows_previous_tail() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedCapture::with_buffer(100, Duration::from_millis(50)).paced(false);
        let acq = controller(dir.path(), driver);
        acq.set_duration(200).unwrap();
        acq.set_filename("first").unwrap();
        acq.start().unwrap();
        acq.wait().unwrap();
        assert_eq!(acq.downsample(5).last().map(|r| r.index), Some(399));

        // Replace the driver pacing by reconfiguring through the shared handle.
        *lock(&acq.driver) = SimulatedCapture::with_buffer(100, Duration::from_millis(50));
        acq.set_filename("second").unwrap();
        acq.start().unwrap();
        let snapshot = acq.stream_snapshot(DEFAULT_STREAM_POINTS);
        assert_eq!(snapshot.state, AcquisitionState::Running);
        assert!(snapshot.records.is_empty());
        acq.stop();
    }

    #[test]
    fn test_capture_failure_aborts_session() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver().fail_after(2));
        acq.set_duration(50).unwrap();
        let path = acq.start().unwrap();

        let err = acq.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CaptureFailure);

        let status = acq.status();
        assert_eq!(status.state, AcquisitionState::Idle);
        assert_eq!(status.samples_written, 200);
        assert_eq!(
            status.last_error.map(|e| e.kind()),
            Some(ErrorKind::CaptureFailure)
        );
        assert!(acq.downsample(10).is_empty());

        let records = read_record_file(&path).unwrap();
        assert_eq!(records.len(), 200);
        verify_integrity(&records).unwrap();
    }

    #[test]
    fn test_unwritable_directory_is_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(&dir.path().join("missing"), fast_driver());
        let err = acq.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);

        let status = acq.status();
        assert_eq!(status.state, AcquisitionState::Idle);
        assert_eq!(status.last_error.map(|e| e.kind()), Some(ErrorKind::IoFailure));
    }

    #[test]
    fn test_restart_after_failure_clears_error() {
        let dir = tempfile::tempdir().unwrap();
        let acq = controller(dir.path(), fast_driver().fail_after(0));
        acq.set_duration(3).unwrap();
        acq.start().unwrap();
        assert!(acq.wait().is_err());

        *lock(&acq.driver) = fast_driver();
        acq.set_filename("retry").unwrap();
        acq.start().unwrap();
        acq.wait().unwrap();
        assert!(acq.status().last_error.is_none());
        assert_eq!(acq.downsample(1).first().map(|r| r.index), Some(299));
    }
}
