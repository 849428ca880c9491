use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::error::ErrorKind;

/// One acquired sample as it is stored on disk and served to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleRecord {
    pub index: u32,
    pub value: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Corrupt record at byte offset {offset}: {remaining} trailing byte(s), a record needs 6")]
    CorruptRecord { offset: u64, remaining: usize },

    #[error("Integrity violation at record {position}: expected index {expected}, found {found}")]
    IntegrityViolation {
        position: usize,
        expected: u64,
        found: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::CorruptRecord { .. } | RecordError::IntegrityViolation { .. } => {
                ErrorKind::IntegrityViolation
            }
            RecordError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

impl SampleRecord {
    /// Encoded size: u32 index followed by u16 value, no padding.
    pub const SIZE: usize = 6;

    pub fn new(index: u32, value: u16) -> Self {
        Self { index, value }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.index);
        LittleEndian::write_u16(&mut bytes[4..6], self.value);
        bytes
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.index)?;
        writer.write_u16::<LittleEndian>(self.value)
    }

    /// Decode the record at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < Self::SIZE {
            return Err(RecordError::CorruptRecord {
                offset: 0,
                remaining: bytes.len(),
            });
        }
        Ok(Self {
            index: LittleEndian::read_u32(&bytes[0..4]),
            value: LittleEndian::read_u16(&bytes[4..6]),
        })
    }
}

/// Streaming decoder over a flat record file.
///
/// Yields records until a clean end of input. A trailing fragment shorter than
/// a record yields one `CorruptRecord` error and then ends.
pub struct RecordReader<R> {
    reader: R,
    offset: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, RecordError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<SampleRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut chunk = [0u8; SampleRecord::SIZE];
        let filled = match self.read_chunk(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        match filled {
            0 => {
                self.done = true;
                None
            }
            SampleRecord::SIZE => {
                self.offset += SampleRecord::SIZE as u64;
                Some(SampleRecord::decode(&chunk))
            }
            remaining => {
                self.done = true;
                Some(Err(RecordError::CorruptRecord {
                    offset: self.offset,
                    remaining,
                }))
            }
        }
    }
}

pub fn read_records<R: Read>(reader: R) -> Result<Vec<SampleRecord>, RecordError> {
    RecordReader::new(reader).collect()
}

pub fn read_record_file(path: &Path) -> Result<Vec<SampleRecord>, RecordError> {
    RecordReader::open(path)?.collect()
}

/// Check that `records` carry exactly the indices `0..N-1`, in order.
///
/// Reports the first gap, duplicate or out-of-order index.
pub fn verify_integrity(records: &[SampleRecord]) -> Result<(), RecordError> {
    for (position, record) in records.iter().enumerate() {
        if u32::try_from(position).ok() != Some(record.index) {
            return Err(RecordError::IntegrityViolation {
                position,
                expected: position as u64,
                found: record.index,
            });
        }
    }
    Ok(())
}
