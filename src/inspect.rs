use polars::prelude::*;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::ErrorKind;
use crate::sample_record::{read_record_file, verify_integrity, RecordError, SampleRecord};
use crate::stream_buffer::decimate_indices;

const INDEX_COLUMN_NAME: &str = "index";
const VALUE_COLUMN_NAME: &str = "value";

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File {} contains no samples", .path.display())]
    EmptyFile { path: PathBuf },
}

impl InspectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectError::Record(e) => e.kind(),
            InspectError::Polars(_) | InspectError::Io(_) | InspectError::EmptyFile { .. } => {
                ErrorKind::IoFailure
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    Mismatched {
        position: usize,
        expected: u64,
        found: u32,
    },
}

impl Integrity {
    pub fn is_ok(&self) -> bool {
        matches!(self, Integrity::Ok)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Integrity::Ok => f.write_str("OK"),
            Integrity::Mismatched { .. } => f.write_str("MISMATCHED INDICES"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileAnalysis {
    pub samples: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub integrity: Integrity,
}

pub fn analyze_file(path: &Path) -> Result<FileAnalysis, InspectError> {
    let records = read_record_file(path)?;
    if records.is_empty() {
        return Err(InspectError::EmptyFile {
            path: path.to_path_buf(),
        });
    }
    analyze_records(&records)
}

pub fn analyze_records(records: &[SampleRecord]) -> Result<FileAnalysis, InspectError> {
    let stats = records_to_dataframe(records)?
        .lazy()
        .select([
            col(VALUE_COLUMN_NAME)
                .cast(DataType::Float64)
                .mean()
                .alias("mean"),
            col(VALUE_COLUMN_NAME)
                .cast(DataType::Float64)
                .std(0)
                .alias("std_dev"),
        ])
        .collect()?;

    let mean = stats.column("mean")?.f64()?.get(0).unwrap_or(f64::NAN);
    let std_dev = stats.column("std_dev")?.f64()?.get(0).unwrap_or(f64::NAN);

    let integrity = match verify_integrity(records) {
        Ok(()) => Integrity::Ok,
        Err(RecordError::IntegrityViolation {
            position,
            expected,
            found,
        }) => Integrity::Mismatched {
            position,
            expected,
            found,
        },
        Err(e) => return Err(e.into()),
    };

    Ok(FileAnalysis {
        samples: records.len(),
        mean,
        std_dev,
        integrity,
    })
}

/// `index` and `value` columns, one row per record.
pub fn records_to_dataframe(records: &[SampleRecord]) -> Result<DataFrame, PolarsError> {
    let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
    let values: Vec<u32> = records.iter().map(|r| u32::from(r.value)).collect();
    df!(
        INDEX_COLUMN_NAME => indices,
        VALUE_COLUMN_NAME => values
    )
}

pub fn write_csv<W: Write>(records: &[SampleRecord], writer: W) -> Result<(), InspectError> {
    let mut df = records_to_dataframe(records)?;
    CsvWriter::new(writer).include_header(true).finish(&mut df)?;
    Ok(())
}

/// Decimate a record file the same way live stream queries are decimated.
pub fn downsample_file(path: &Path, max_points: usize) -> Result<Vec<SampleRecord>, InspectError> {
    let records = read_record_file(path)?;
    Ok(decimate_indices(records.len(), max_points)
        .map(|i| records[i])
        .collect())
}
