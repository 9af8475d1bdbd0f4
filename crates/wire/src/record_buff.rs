//! Bounded record buffer for server row pushes
//!
//! Layout of a filled buffer:
//!
//! ```text
//! [table_id:i32] ([row_id:i32][size:u64][row bytes])* [-1 | -2] ...
//! ```
//!
//! A buffer never grows past its capacity; `append_*` returns `false` when
//! the item does not fit and leaves the buffer unchanged.

use crate::error::{Result, WireError};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use sspps_core::{RowId, TableId, SERIALIZED_TABLE_END, SERIALIZED_TABLE_SEPARATOR};
use std::io::Cursor;

/// Bytes of the `[row_id][size]` record header
pub const RECORD_HEADER_SIZE: usize = 4 + 8;

/// Append-only buffer with a hard capacity
#[derive(Debug, Clone)]
pub struct RecordBuff {
    mem: Vec<u8>,
    capacity: usize,
}

impl RecordBuff {
    /// Empty buffer that holds at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            mem: Vec::with_capacity(capacity.min(1 << 20)),
            capacity,
        }
    }

    /// Append a `[record_id][size][bytes]` record if it fits
    pub fn append_record(&mut self, record_id: i32, record: &[u8]) -> bool {
        if RECORD_HEADER_SIZE + record.len() > self.remaining() {
            return false;
        }
        let mut header = [0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_i32(&mut header[..4], record_id);
        LittleEndian::write_u64(&mut header[4..], record.len() as u64);
        self.mem.extend_from_slice(&header);
        self.mem.extend_from_slice(record);
        true
    }

    /// Append a bare `i32` (table id or separator) if it fits
    pub fn append_i32(&mut self, value: i32) -> bool {
        if 4 > self.remaining() {
            return false;
        }
        let mut bytes = [0u8; 4];
        LittleEndian::write_i32(&mut bytes, value);
        self.mem.extend_from_slice(&bytes);
        true
    }

    /// Bytes written
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Hard limit
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available
    pub fn remaining(&self) -> usize {
        self.capacity - self.mem.len()
    }

    /// Written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }

    /// Take the written bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.mem
    }
}

/// One row record of a push payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushedRow<'a> {
    /// Table the row belongs to
    pub table_id: TableId,
    /// Row id
    pub row_id: RowId,
    /// Serialized row
    pub data: &'a [u8],
}

/// Walks the records of a `ServerPushRow` payload
///
/// Row ids are non-negative in push payloads; -1 and -2 are the table
/// separator and end markers. A payload cut short by a full buffer simply
/// ends without the end marker.
#[derive(Debug)]
pub struct PushRowReader<'a> {
    buf: &'a [u8],
    pos: usize,
    table_id: Option<TableId>,
    done: bool,
}

impl<'a> PushRowReader<'a> {
    /// Reader over `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            table_id: None,
            done: buf.is_empty(),
        }
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32> {
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        let value = cursor
            .read_i32::<LittleEndian>()
            .map_err(|e| WireError::Decode(field, e))?;
        self.pos += 4;
        Ok(value)
    }

    /// Next row record, `None` once the payload is exhausted
    pub fn next_row(&mut self) -> Result<Option<PushedRow<'a>>> {
        if self.done {
            return Ok(None);
        }
        if self.table_id.is_none() {
            self.table_id = Some(self.read_i32("push table id")?);
        }
        loop {
            if self.pos >= self.buf.len() {
                self.done = true;
                return Ok(None);
            }
            let marker = self.read_i32("push row id")?;
            match marker {
                SERIALIZED_TABLE_END => {
                    self.done = true;
                    return Ok(None);
                }
                SERIALIZED_TABLE_SEPARATOR => {
                    if self.pos >= self.buf.len() {
                        self.done = true;
                        return Ok(None);
                    }
                    self.table_id = Some(self.read_i32("push table id")?);
                }
                row_id => {
                    let mut cursor = Cursor::new(&self.buf[self.pos..]);
                    let size = cursor
                        .read_u64::<LittleEndian>()
                        .map_err(|e| WireError::Decode("push row size", e))?
                        as usize;
                    self.pos += 8;
                    let end = self.pos.checked_add(size).filter(|end| *end <= self.buf.len());
                    let Some(end) = end else {
                        return Err(WireError::Decode(
                            "push row data",
                            std::io::ErrorKind::UnexpectedEof.into(),
                        ));
                    };
                    let data = &self.buf[self.pos..end];
                    self.pos = end;
                    return Ok(Some(PushedRow {
                        table_id: self.table_id.unwrap_or_default(),
                        row_id,
                        data,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_until_full() {
        let mut buff = RecordBuff::new(4 + RECORD_HEADER_SIZE + 3 + 4);
        assert!(buff.append_i32(5));
        assert!(buff.append_record(9, &[1, 2, 3]));
        assert!(!buff.append_record(10, &[0]));
        assert!(buff.append_i32(-2));
        assert_eq!(buff.remaining(), 0);
        assert!(!buff.append_i32(0));

        let bytes = buff.into_bytes();
        assert_eq!(LittleEndian::read_i32(&bytes[4..]), 9);
        assert_eq!(LittleEndian::read_u64(&bytes[8..]), 3);
        assert_eq!(&bytes[16..19], &[1, 2, 3]);
        assert_eq!(LittleEndian::read_i32(&bytes[19..]), -2);
    }

    #[test]
    fn test_push_reader_walks_tables() {
        let mut buff = RecordBuff::new(1024);
        assert!(buff.append_i32(3));
        assert!(buff.append_record(0, &[1, 1]));
        assert!(buff.append_record(4, &[2]));
        assert!(buff.append_i32(SERIALIZED_TABLE_SEPARATOR));
        assert!(buff.append_i32(8));
        assert!(buff.append_record(1, &[]));
        assert!(buff.append_i32(SERIALIZED_TABLE_END));
        let bytes = buff.into_bytes();

        let mut reader = PushRowReader::new(&bytes);
        let mut seen = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            seen.push((row.table_id, row.row_id, row.data.to_vec()));
        }
        assert_eq!(
            seen,
            vec![(3, 0, vec![1, 1]), (3, 4, vec![2]), (8, 1, vec![])]
        );
    }

    #[test]
    fn test_push_reader_stops_at_cut_buffer() {
        let mut buff = RecordBuff::new(64);
        buff.append_i32(2);
        buff.append_record(5, &[9; 4]);
        let bytes = buff.into_bytes();
        let mut reader = PushRowReader::new(&bytes);
        assert_eq!(reader.next_row().unwrap().unwrap().row_id, 5);
        assert!(reader.next_row().unwrap().is_none());
        assert!(PushRowReader::new(&[]).next_row().unwrap().is_none());
    }

    #[test]
    fn test_push_reader_rejects_short_record() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&[0; 10]);
        let err = PushRowReader::new(&bytes).next_row().unwrap_err();
        assert!(err.is_malformed());
    }
}
