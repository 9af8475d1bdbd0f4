//! Block-framed snapshot files
//!
//! A snapshot is a sequence of fixed-size blocks. Each block holds records
//! of the form `[row_id:i32 LE][size:u64 LE][size bytes]`. When the next
//! record does not fit in what is left of the current block, the writer
//! terminates the block with `END_OF_BLOCK` (if 4 bytes remain), pads it with
//! zeros and starts the record in a fresh block. A record larger than a block
//! starts at a block boundary and runs on contiguously. The final block is
//! always terminated and written out in full.
//!
//! # Design
//!
//! The reader never needs an index: it walks blocks front to back and a block
//! boundary reached with no further bytes ends the stream.

use crate::error::{Result, SnapshotError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sspps_core::{Clock, RowId, TableId};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of one snapshot block
pub const SNAPSHOT_BLOCK_SIZE: usize = 64 * 1024;

/// Row id that terminates the records of a block
pub const END_OF_BLOCK: RowId = -1;

const ROW_ID_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = ROW_ID_SIZE + 8;

/// `<dir>/server_table.server-<id>.table-<id>.clock-<clock>.dat`
pub fn snapshot_file_name(
    dir: impl AsRef<Path>,
    server_id: i32,
    table_id: TableId,
    clock: Clock,
) -> PathBuf {
    dir.as_ref().join(format!(
        "server_table.server-{}.table-{}.clock-{}.dat",
        server_id, table_id, clock
    ))
}

/// Summary of a finished snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Rows written
    pub rows: usize,
    /// File size in bytes
    pub bytes: u64,
}

/// Streams rows into a snapshot file
#[derive(Debug)]
pub struct SnapshotWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    block_size: usize,
    offset: usize,
    rows: usize,
    bytes: u64,
}

impl SnapshotWriter {
    /// Create (or truncate) the file at `path`
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_block_size(path, SNAPSHOT_BLOCK_SIZE)
    }

    /// Writer with a custom block size
    ///
    /// # Panics
    ///
    /// If `block_size` cannot hold a record header.
    pub fn with_block_size(path: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        if block_size < RECORD_HEADER_SIZE {
            panic!(
                "snapshot block of {} bytes cannot hold a {}-byte record header",
                block_size, RECORD_HEADER_SIZE
            );
        }
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SnapshotError::io(&path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            block_size,
            offset: 0,
            rows: 0,
            bytes: 0,
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one serialized row
    pub fn write_row(&mut self, row_id: RowId, data: &[u8]) -> Result<()> {
        if row_id == END_OF_BLOCK {
            return Err(SnapshotError::ReservedRowId(row_id));
        }
        let record_len = RECORD_HEADER_SIZE + data.len();
        if self.offset > 0 && self.offset + record_len > self.block_size {
            self.close_block().map_err(|e| SnapshotError::io(&self.path, e))?;
        }
        self.write_record(row_id, data)
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    fn write_record(&mut self, row_id: RowId, data: &[u8]) -> io::Result<()> {
        self.writer.write_i32::<LittleEndian>(row_id)?;
        self.writer.write_u64::<LittleEndian>(data.len() as u64)?;
        self.writer.write_all(data)?;
        self.advance(RECORD_HEADER_SIZE + data.len());
        Ok(())
    }

    fn advance(&mut self, n: usize) {
        self.bytes += n as u64;
        self.offset = (self.offset + n) % self.block_size;
    }

    /// Terminate and pad the current block
    fn close_block(&mut self) -> io::Result<()> {
        let mut remaining = self.block_size - self.offset;
        if remaining >= ROW_ID_SIZE {
            self.writer.write_i32::<LittleEndian>(END_OF_BLOCK)?;
            remaining -= ROW_ID_SIZE;
        }
        io::copy(&mut io::repeat(0).take(remaining as u64), &mut self.writer)?;
        self.bytes += (self.block_size - self.offset) as u64;
        self.offset = 0;
        Ok(())
    }

    /// Write the final block and sync the file to disk
    pub fn finish(mut self) -> Result<SnapshotStats> {
        let path = self.path.clone();
        let io_err = |e| SnapshotError::io(&path, e);
        self.close_block().map_err(io_err)?;
        self.writer.flush().map_err(io_err)?;
        self.writer.get_ref().sync_all().map_err(io_err)?;
        debug!(path = %path.display(), rows = self.rows, bytes = self.bytes, "snapshot written");
        Ok(SnapshotStats {
            rows: self.rows,
            bytes: self.bytes,
        })
    }
}

/// Iterates the rows of a snapshot file
#[derive(Debug)]
pub struct SnapshotReader {
    path: PathBuf,
    reader: BufReader<File>,
    block_size: usize,
    offset: usize,
    done: bool,
}

impl SnapshotReader {
    /// Open the snapshot at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_block_size(path, SNAPSHOT_BLOCK_SIZE)
    }

    /// Reader for files written with a custom block size
    pub fn with_block_size(path: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| SnapshotError::io(&path, e))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            block_size,
            offset: 0,
            done: false,
        })
    }

    /// Next `(row_id, bytes)` record, `None` at end of file
    pub fn next_row(&mut self) -> Result<Option<(RowId, Vec<u8>)>> {
        while !self.done {
            if self.block_size - self.offset < RECORD_HEADER_SIZE && self.offset > 0 {
                self.skip_to_block_end()?;
                continue;
            }
            let row_id = match self.reader.read_i32::<LittleEndian>() {
                Ok(id) => id,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && self.offset == 0 => {
                    self.done = true;
                    break;
                }
                Err(e) => return Err(SnapshotError::io(&self.path, e)),
            };
            self.advance(ROW_ID_SIZE);
            if row_id == END_OF_BLOCK {
                self.skip_to_block_end()?;
                continue;
            }

            let size = self
                .reader
                .read_u64::<LittleEndian>()
                .map_err(|e| self.truncated_or_io(row_id, e))?;
            // the length comes from the file; the buffer grows only with
            // bytes actually read
            let initial = usize::try_from(size).unwrap_or(usize::MAX).min(self.block_size);
            let mut data = Vec::with_capacity(initial);
            let read = (&mut self.reader).take(size).read_to_end(&mut data);
            let read = read.map_err(|e| self.truncated_or_io(row_id, e))?;
            if (read as u64) < size {
                return Err(SnapshotError::Truncated {
                    path: self.path.clone(),
                    row_id,
                });
            }
            self.advance(8 + data.len());
            return Ok(Some((row_id, data)));
        }
        Ok(None)
    }

    fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n) % self.block_size;
    }

    fn skip_to_block_end(&mut self) -> Result<()> {
        if self.offset == 0 {
            return Ok(());
        }
        let pad = (self.block_size - self.offset) as u64;
        let skipped = io::copy(&mut (&mut self.reader).take(pad), &mut io::sink())
            .map_err(|e| SnapshotError::io(&self.path, e))?;
        if skipped < pad {
            self.done = true;
        }
        self.offset = 0;
        Ok(())
    }

    fn truncated_or_io(&self, row_id: RowId, e: io::Error) -> SnapshotError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SnapshotError::Truncated {
                path: self.path.clone(),
                row_id,
            }
        } else {
            SnapshotError::io(&self.path, e)
        }
    }

    /// Collect every remaining row
    pub fn read_all(mut self) -> Result<Vec<(RowId, Vec<u8>)>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Iterator for SnapshotReader {
    type Item = Result<(RowId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}
