//! `ClientSendOpLog` payload encoding
//!
//! ```text
//! [num_tables:i32]
//!   per table: [table_id:i32][update_size:u64][num_rows:i32]
//!     per row: [row_id:i32][row oplog]
//! ```
//!
//! The row oplog uses the sparse or dense encoding of `RowOpLog`, chosen per
//! table. The receiver supplies each table's `OpLogLayout`, since the payload
//! does not repeat it.

use crate::error::{OpLogError, Result};
use crate::row_oplog::{RowOpLog, VERSION_TRAILER_SIZE};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use sspps_core::{ColumnId, Row, RowId, TableId};
use std::collections::BTreeMap;

/// How a table's row oplogs are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpLogLayout {
    /// Dense encoding instead of sparse
    pub dense: bool,
    /// Dense encoding carries a version trailer
    pub versioned: bool,
    /// Width of one update
    pub update_size: usize,
}

#[derive(Debug)]
struct TableSection {
    table_id: TableId,
    update_size: usize,
    num_rows: i32,
    bytes: Vec<u8>,
}

/// Accumulates row oplogs into one payload per destination server
#[derive(Debug, Default)]
pub struct OpLogSerializer {
    servers: BTreeMap<i32, Vec<TableSection>>,
    total_bytes: usize,
    total_rows: usize,
}

impl OpLogSerializer {
    /// Empty serializer
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `oplog` for `server_id`; returns the bytes it added
    ///
    /// Sparse tables drop zero deltas before encoding.
    pub fn append_row_oplog(
        &mut self,
        server_id: i32,
        table_id: TableId,
        dense: bool,
        row_id: RowId,
        oplog: &mut RowOpLog,
        sample: &dyn Row,
    ) -> usize {
        let sections = self.servers.entry(server_id).or_default();
        let needs_section = sections
            .last()
            .map_or(true, |section| section.table_id != table_id);
        if needs_section {
            sections.push(TableSection {
                table_id,
                update_size: oplog.update_size(),
                num_rows: 0,
                bytes: Vec::new(),
            });
        }
        let Some(section) = sections.last_mut() else {
            unreachable!("section pushed above");
        };

        let start = section.bytes.len();
        let _ = section.bytes.write_i32::<LittleEndian>(row_id);
        if dense {
            oplog.serialize_dense(&mut section.bytes);
        } else {
            oplog.clear_zeros_and_get_nonzero_size(sample);
            oplog.serialize_sparse(sample, &mut section.bytes);
        }
        section.num_rows += 1;

        let added = section.bytes.len() - start;
        self.total_bytes += added;
        self.total_rows += 1;
        added
    }

    /// Row oplog bytes appended so far, excluding headers
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Row oplogs appended so far
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Whether nothing was appended
    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Servers that will receive a payload
    pub fn server_ids(&self) -> Vec<i32> {
        self.servers.keys().copied().collect()
    }

    /// Assemble each server's payload
    pub fn finish(self) -> BTreeMap<i32, Vec<u8>> {
        self.servers
            .into_iter()
            .map(|(server_id, sections)| {
                let size = 4 + sections
                    .iter()
                    .map(|s| 4 + 8 + 4 + s.bytes.len())
                    .sum::<usize>();
                let mut out = Vec::with_capacity(size);
                let _ = out.write_i32::<LittleEndian>(sections.len() as i32);
                for section in sections {
                    let _ = out.write_i32::<LittleEndian>(section.table_id);
                    let _ = out.write_u64::<LittleEndian>(section.update_size as u64);
                    let _ = out.write_i32::<LittleEndian>(section.num_rows);
                    out.extend_from_slice(&section.bytes);
                }
                (server_id, out)
            })
            .collect()
    }
}

/// Decoded updates of one row
#[derive(Debug, Clone, PartialEq)]
pub enum RowUpdates<'a> {
    /// Explicit column ids, one update each
    Sparse {
        /// Columns touched
        column_ids: Vec<ColumnId>,
        /// Concatenated updates in `column_ids` order
        updates: &'a [u8],
    },
    /// Updates for columns `0..num_updates`
    Dense {
        /// Concatenated updates
        updates: &'a [u8],
        /// Number of columns
        num_updates: usize,
        /// `(version, end_of_version)` when the table is versioned
        version: Option<(u64, bool)>,
    },
}

impl RowUpdates<'_> {
    /// Number of column updates
    pub fn num_updates(&self) -> usize {
        match self {
            RowUpdates::Sparse { column_ids, .. } => column_ids.len(),
            RowUpdates::Dense { num_updates, .. } => *num_updates,
        }
    }
}

/// One row's entry in a payload
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate<'a> {
    /// Table the row belongs to
    pub table_id: TableId,
    /// Row id
    pub row_id: RowId,
    /// Its updates
    pub updates: RowUpdates<'a>,
}

#[derive(Debug, Clone, Copy)]
struct CurrentTable {
    table_id: TableId,
    layout: OpLogLayout,
    rows_left: i32,
}

/// Streaming parser for oplog payloads
#[derive(Debug)]
pub struct SerializedOpLogReader<'a> {
    buf: &'a [u8],
    pos: usize,
    tables_left: i32,
    current: Option<CurrentTable>,
}

impl<'a> SerializedOpLogReader<'a> {
    /// Start reading `buf`; an empty buffer holds no tables
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut reader = Self {
            buf,
            pos: 0,
            tables_left: 0,
            current: None,
        };
        if !buf.is_empty() {
            reader.tables_left = reader.read_count("num_tables")?;
        }
        Ok(reader)
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8]> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(OpLogError::Truncated {
                field,
                need: n,
                have,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_i32(&mut self, field: &'static str) -> Result<i32> {
        self.take(4, field).map(LittleEndian::read_i32)
    }

    fn read_u64(&mut self, field: &'static str) -> Result<u64> {
        self.take(8, field).map(LittleEndian::read_u64)
    }

    fn read_count(&mut self, field: &'static str) -> Result<i32> {
        let value = self.read_i32(field)?;
        if value < 0 {
            return Err(OpLogError::NegativeCount { field, value });
        }
        Ok(value)
    }

    /// Next row, resolving each new table's layout through `layout_of`
    pub fn next_row<F>(&mut self, mut layout_of: F) -> Result<Option<RowUpdate<'a>>>
    where
        F: FnMut(TableId) -> Option<OpLogLayout>,
    {
        let mut table = loop {
            match self.current {
                Some(t) if t.rows_left > 0 => break t,
                _ => {
                    if self.tables_left == 0 {
                        self.current = None;
                        return Ok(None);
                    }
                    self.tables_left -= 1;
                    let table_id = self.read_i32("table_id")?;
                    let update_size = self.read_u64("update_size")? as usize;
                    let rows_left = self.read_count("num_rows")?;
                    let layout = layout_of(table_id).ok_or(OpLogError::UnknownTable(table_id))?;
                    if layout.update_size != update_size {
                        return Err(OpLogError::UpdateSizeMismatch {
                            table_id,
                            payload: update_size,
                            table: layout.update_size,
                        });
                    }
                    self.current = Some(CurrentTable {
                        table_id,
                        layout,
                        rows_left,
                    });
                }
            }
        };

        let row_id = self.read_i32("row_id")?;
        let num = self.read_count("num_updates")? as usize;
        let update_size = table.layout.update_size;
        let updates = if table.layout.dense {
            let updates = self.take(num * update_size, "dense updates")?;
            let version = if table.layout.versioned {
                let trailer = self.take(VERSION_TRAILER_SIZE, "version trailer")?;
                Some((LittleEndian::read_u64(&trailer[..8]), trailer[8] != 0))
            } else {
                None
            };
            RowUpdates::Dense {
                updates,
                num_updates: num,
                version,
            }
        } else {
            let cols = self.take(num * 4, "column ids")?;
            let column_ids = cols.chunks_exact(4).map(LittleEndian::read_i32).collect();
            let updates = self.take(num * update_size, "sparse updates")?;
            RowUpdates::Sparse {
                column_ids,
                updates,
            }
        };

        table.rows_left -= 1;
        self.current = Some(table);
        Ok(Some(RowUpdate {
            table_id: table.table_id,
            row_id,
            updates,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sspps_core::{encode_updates, DenseRow, Element, SparseRow, DENSE_F32, SPARSE_I32};

    fn sparse_layout() -> OpLogLayout {
        OpLogLayout {
            dense: false,
            versioned: false,
            update_size: 4,
        }
    }

    #[test]
    fn test_two_tables_two_servers() {
        let sparse = SparseRow::<i32>::new(SPARSE_I32);
        let dense = DenseRow::<f32>::with_capacity(DENSE_F32, 2);
        let mut ser = OpLogSerializer::new();

        let mut a = RowOpLog::sparse(4);
        a.inc(&sparse, 3, &encode_updates(&[5i32]), 0);
        a.inc(&sparse, 4, &encode_updates(&[0i32]), 0);
        ser.append_row_oplog(0, 1, false, 10, &mut a, &sparse);

        let mut b = RowOpLog::versioned_dense(&dense, 2);
        b.inc(&dense, 1, &encode_updates(&[2.5f32]), 0);
        b.set_version(4, true);
        ser.append_row_oplog(0, 2, true, 11, &mut b, &dense);

        let mut c = RowOpLog::sparse(4);
        c.inc(&sparse, 0, &encode_updates(&[1i32]), 0);
        ser.append_row_oplog(1, 1, false, 12, &mut c, &sparse);

        assert_eq!(ser.total_rows(), 3);
        let payloads = ser.finish();
        assert_eq!(payloads.len(), 2);

        let layout_of = |t: TableId| match t {
            1 => Some(sparse_layout()),
            2 => Some(OpLogLayout {
                dense: true,
                versioned: true,
                update_size: 4,
            }),
            _ => None,
        };
        let mut reader = SerializedOpLogReader::new(&payloads[&0]).unwrap();
        let first = reader.next_row(layout_of).unwrap().unwrap();
        assert_eq!(first.table_id, 1);
        assert_eq!(first.row_id, 10);
        match first.updates {
            RowUpdates::Sparse {
                column_ids,
                updates,
            } => {
                assert_eq!(column_ids, vec![3]);
                assert_eq!(i32::read_le(updates), 5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let second = reader.next_row(layout_of).unwrap().unwrap();
        assert_eq!(second.row_id, 11);
        match second.updates {
            RowUpdates::Dense {
                updates,
                num_updates,
                version,
            } => {
                assert_eq!(num_updates, 2);
                assert_eq!(f32::read_le(&updates[4..]), 2.5);
                assert_eq!(version, Some((4, true)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reader.next_row(layout_of).unwrap().is_none());
    }

    #[test]
    fn test_empty_payload_has_no_rows() {
        let mut reader = SerializedOpLogReader::new(&[]).unwrap();
        assert!(reader.next_row(|_| Some(sparse_layout())).unwrap().is_none());
    }

    #[test]
    fn test_truncated_and_unknown_table() {
        let sparse = SparseRow::<i32>::new(SPARSE_I32);
        let mut ser = OpLogSerializer::new();
        let mut a = RowOpLog::sparse(4);
        a.inc(&sparse, 3, &encode_updates(&[5i32]), 0);
        ser.append_row_oplog(0, 7, false, 1, &mut a, &sparse);
        let payload = ser.finish().remove(&0).unwrap();

        let mut reader = SerializedOpLogReader::new(&payload).unwrap();
        assert_eq!(
            reader.next_row(|_| None).unwrap_err(),
            OpLogError::UnknownTable(7)
        );

        let cut = &payload[..payload.len() - 2];
        let mut reader = SerializedOpLogReader::new(cut).unwrap();
        assert!(reader
            .next_row(|_| Some(sparse_layout()))
            .unwrap_err()
            .is_truncated());
    }
}
