//! # pidaq-rs
//!
//! Acquisition control and high-voltage bias control for a single-board
//! detector front-end.
//!
//! The crate sits between a request layer (HTTP routes, a CLI, a test
//! harness) and two pieces of hardware: an ADC that delivers samples in fixed
//! size buffers, and a bias supply that is driven over a command link.
//!
//! ## Features
//!
//! - **Background acquisition**: timed sessions on a supervised thread, written
//!   to a packed little-endian record file with contiguous sample indices
//! - **Live streaming**: decimated views of the running session for plotting
//! - **Bias control**: serialized commands with hard per-request timeouts
//! - **Device discovery**: finds USB serial bias supplies via `serialport`
//! - **Offline inspection**: record file statistics and CSV export with `polars`
//! - **Uniform errors**: every module error classifies into [`ErrorKind`]
//!
//! ## Examples
//!
//! ### Timed acquisition
//!
//! ```rust,no_run
//! use pidaq_rs::{AcquisitionController, AcquisitionSettings, SimulatedCapture};
//!
//! let acq = AcquisitionController::new(SimulatedCapture::new(), AcquisitionSettings::default());
//! acq.set_duration(500)?;
//! acq.set_filename("run_042.bin")?;
//!
//! let path = acq.start()?;
//! // Poll the stream while the session runs
//! let points = acq.downsample(pidaq_rs::DEFAULT_STREAM_POINTS);
//! println!("{} points so far", points.len());
//!
//! acq.wait()?;
//! println!("Wrote {}", path.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Bias supply
//!
//! ```rust,no_run
//! use pidaq_rs::{BiasConnector, BiasController, BiasSettings, Polarity, SerialLinkSettings};
//! use std::time::Duration;
//!
//! let link = BiasConnector::connect(None, None, SerialLinkSettings::default())?;
//! let bias = BiasController::new(link, BiasSettings::default());
//! bias.start_io()?;
//!
//! bias.set_polarity(Polarity::Negative)?;
//! bias.set_voltage(54_000)?;
//! bias.hv_on()?;
//!
//! let voltage = bias.get_voltage(Duration::from_millis(100))?;
//! println!("Applied {:.3} V", voltage.volts());
//!
//! bias.hv_off()?;
//! bias.stop_io();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Checking a record file
//!
//! ```rust,no_run
//! use pidaq_rs::inspect::analyze_file;
//! use std::path::Path;
//!
//! let analysis = analyze_file(Path::new("run_042.bin"))?;
//! println!(
//!     "{} samples, mean {:.2}, std dev {:.2}: {}",
//!     analysis.samples, analysis.mean, analysis.std_dev, analysis.integrity
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod acquisition;
pub mod bias;
pub mod bias_connector;
pub mod bias_link;
pub mod capture_driver;
pub mod error;
pub mod inspect;
pub mod sample_record;
pub mod serial_bias_link;
pub mod stream_buffer;

// Re-export the main types for convenience
pub use error::ErrorKind;

pub use sample_record::{
    read_record_file, read_records, verify_integrity, RecordError, RecordReader, SampleRecord,
};

pub use stream_buffer::StreamBuffer;

pub use capture_driver::{CaptureDriver, CaptureError, SimulatedCapture};

pub use acquisition::{
    AcquisitionConfig, AcquisitionController, AcquisitionError, AcquisitionSettings,
    AcquisitionState, AcquisitionStatus, StreamSnapshot, DEFAULT_STREAM_POINTS,
};

pub use bias_link::{BiasCommand, BiasLink, BiasReply, Polarity, ResultCode, SimulatedBiasLink};

pub use bias::{
    BiasController, BiasError, BiasSettings, BiasState, BiasStatus, BiasVoltage,
    DEFAULT_QUERY_TIMEOUT,
};

pub use serial_bias_link::{SerialBiasLink, SerialLinkError, SerialLinkSettings};

pub use bias_connector::{BiasConnector, BiasConnectorError, BiasDevice};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
