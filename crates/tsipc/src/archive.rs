//! Timeslice file archives.
//!
//! An archive is a versioned descriptor header followed by a stream of
//! bincode-encoded [`StorableTimeslice`] records. Writing and re-reading a
//! timeslice is byte-exact and idempotent.

use crate::timeslice::StorableTimeslice;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// File I/O failure.
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or decoding failure.
    #[error("archive codec failed: {0}")]
    Codec(#[from] bincode::Error),
    /// The file does not start with a compatible archive descriptor.
    #[error("not a timeslice archive (magic {magic:#x}, version {version})")]
    Incompatible {
        /// Magic number found.
        magic: u64,
        /// Format version found.
        version: u32,
    },
}

const ARCHIVE_MAGIC: u64 = 0x7473_6172_6368_6976; // "tsarchiv"
const ARCHIVE_VERSION: u32 = 1;

/// The archive file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    magic: u64,
    version: u32,
}

impl ArchiveDescriptor {
    fn current() -> Self {
        Self {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
        }
    }
}

/// Writes timeslices to an archive file.
pub struct TimesliceOutputArchive {
    writer: BufWriter<File>,
}

impl TimesliceOutputArchive {
    /// Creates a new archive file, truncating an existing one.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, &ArchiveDescriptor::current())?;
        Ok(Self { writer })
    }

    /// Appends one timeslice to the archive.
    pub fn write(&mut self, timeslice: &StorableTimeslice) -> Result<(), ArchiveError> {
        bincode::serialize_into(&mut self.writer, timeslice)?;
        Ok(())
    }

    /// Flushes buffered output to the file.
    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads timeslices back from an archive file.
pub struct TimesliceInputArchive {
    reader: BufReader<File>,
}

impl TimesliceInputArchive {
    /// Opens an archive file and validates its descriptor.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let mut reader = BufReader::new(File::open(path)?);
        let descriptor: ArchiveDescriptor = bincode::deserialize_from(&mut reader)?;
        if descriptor.magic != ARCHIVE_MAGIC || descriptor.version != ARCHIVE_VERSION {
            return Err(ArchiveError::Incompatible {
                magic: descriptor.magic,
                version: descriptor.version,
            });
        }
        Ok(Self { reader })
    }

    /// Reads the next timeslice, or `None` at end of archive.
    pub fn read(&mut self) -> Result<Option<StorableTimeslice>, ArchiveError> {
        match bincode::deserialize_from(&mut self.reader) {
            Ok(ts) => Ok(Some(ts)),
            Err(err) => match *err {
                bincode::ErrorKind::Io(ref io)
                    if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Ok(None)
                }
                _ => Err(ArchiveError::Codec(err)),
            },
        }
    }
}
