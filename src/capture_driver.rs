use std::thread;
use std::time::Duration;

/// Failure reported by the sampling hardware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Capture driver reported status {status}: {detail}")]
pub struct CaptureError {
    pub status: i32,
    pub detail: String,
}

impl CaptureError {
    pub fn new(status: i32, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

/// Seam to the acquisition hardware.
///
/// The driver delivers samples one hardware buffer at a time. The buffer
/// length and period are fixed by the hardware and define the granularity at
/// which sessions are sized and stopped.
pub trait CaptureDriver: Send + 'static {
    /// Samples delivered by one `read_buffer` call.
    fn samples_per_buffer(&self) -> usize;

    /// Wall-clock time covered by one buffer.
    fn buffer_period(&self) -> Duration;

    /// Arm the hardware for a new session.
    fn begin(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Replace the contents of `samples` with the next buffer, blocking until
    /// the hardware has filled it.
    fn read_buffer(&mut self, samples: &mut Vec<u16>) -> Result<(), CaptureError>;

    /// Disarm after a session, whether it completed or failed.
    fn end(&mut self) {}
}

/// Software stand-in for the ADC: a 12-bit triangle wave delivered in
/// hardware-sized buffers.
#[derive(Debug, Clone)]
pub struct SimulatedCapture {
    samples_per_buffer: usize,
    buffer_period: Duration,
    paced: bool,
    fail_after: Option<u64>,
    buffers_read: u64,
    phase: u64,
    armed: bool,
}

impl Default for SimulatedCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCapture {
    pub const SAMPLES_PER_BUFFER: usize = 65_536;
    pub const BUFFER_PERIOD: Duration = Duration::from_micros(65_536);
    pub const FULL_SCALE: u16 = 4095;
    const HALF_WAVE: u64 = 1000;

    /// Real-time paced simulator with the hardware's buffer geometry.
    pub fn new() -> Self {
        Self::with_buffer(Self::SAMPLES_PER_BUFFER, Self::BUFFER_PERIOD)
    }

    pub fn with_buffer(samples_per_buffer: usize, buffer_period: Duration) -> Self {
        Self {
            samples_per_buffer,
            buffer_period,
            paced: true,
            fail_after: None,
            buffers_read: 0,
            phase: 0,
            armed: false,
        }
    }

    /// Sleep one buffer period per read, like the real DMA wait.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Fail every read after `buffers` successful ones in a session.
    pub fn fail_after(mut self, buffers: u64) -> Self {
        self.fail_after = Some(buffers);
        self
    }

    pub fn buffers_read(&self) -> u64 {
        self.buffers_read
    }

    fn sample_at(phase: u64) -> u16 {
        let position = phase % (2 * Self::HALF_WAVE);
        let ramp = if position < Self::HALF_WAVE {
            position
        } else {
            2 * Self::HALF_WAVE - 1 - position
        };
        (ramp * u64::from(Self::FULL_SCALE) / (Self::HALF_WAVE - 1)) as u16
    }
}

impl CaptureDriver for SimulatedCapture {
    fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer
    }

    fn buffer_period(&self) -> Duration {
        self.buffer_period
    }

    fn begin(&mut self) -> Result<(), CaptureError> {
        log::debug!(
            "Arming simulated capture: {} samples per {:?} buffer",
            self.samples_per_buffer,
            self.buffer_period
        );
        self.armed = true;
        self.phase = 0;
        self.buffers_read = 0;
        Ok(())
    }

    fn read_buffer(&mut self, samples: &mut Vec<u16>) -> Result<(), CaptureError> {
        if !self.armed {
            return Err(CaptureError::new(-1, "capture not armed"));
        }
        if self.fail_after.is_some_and(|limit| self.buffers_read >= limit) {
            return Err(CaptureError::new(-7, "simulated buffer overrun"));
        }
        if self.paced {
            thread::sleep(self.buffer_period);
        }

        samples.clear();
        samples.extend((0..self.samples_per_buffer as u64).map(|i| Self::sample_at(self.phase + i)));
        self.phase += self.samples_per_buffer as u64;
        self.buffers_read += 1;
        Ok(())
    }

    fn end(&mut self) {
        log::debug!("Disarming simulated capture after {} buffers", self.buffers_read);
        self.armed = false;
    }
}
