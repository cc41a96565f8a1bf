//! The structured block that flows through pipes: a run of timestamped
//! rows sharing one [`Layout`]. Mirrors the reference's structured numpy
//! array (`timestamp`, `data` fields) without requiring generic dtypes at
//! compile time — values are carried as packed little-endian bytes and
//! interpreted through [`Elem`] only where numeric semantics are needed
//! (decimation).

use crate::error::{JouleError, Result};
use crate::layout::{Elem, Layout};

/// One run of samples at a single layout. `data` is row-major, `layout.
/// count * layout.dtype.width()` bytes per row (the raw value payload,
/// timestamps are carried separately for easy monotonic validation).
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub layout: Layout,
    pub timestamps: Vec<u64>,
    pub data: Vec<u8>,
}

impl Block {
    pub fn empty(layout: Layout) -> Self {
        Block {
            layout,
            timestamps: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn row_value_width(&self) -> usize {
        self.layout.count * self.layout.dtype.width()
    }

    /// Build a block from flat rows of `[timestamp, v0, v1, ...]` decoded
    /// values (the "flat block whose first column is timestamps" case in
    /// §4.C's `write`).
    pub fn from_flat_values(layout: Layout, rows: &[Vec<f64>]) -> Self {
        let mut timestamps = Vec::with_capacity(rows.len());
        let mut data = Vec::with_capacity(rows.len() * layout.count * layout.dtype.width());
        for row in rows {
            timestamps.push(row[0] as u64);
            for v in &row[1..] {
                Elem::from_f64(layout.dtype, *v).encode(&mut data);
            }
        }
        Block {
            layout,
            timestamps,
            data,
        }
    }

    pub fn row_values(&self, row: usize) -> Vec<Elem> {
        let width = self.layout.dtype.width();
        let start = row * self.row_value_width();
        (0..self.layout.count)
            .map(|i| {
                let off = start + i * width;
                Elem::decode(self.layout.dtype, &self.data[off..off + width])
            })
            .collect()
    }

    /// Validate that timestamps are strictly increasing within the block
    /// and non-decreasing against `prev_last`. Spec §4.C `write`.
    pub fn validate_monotonic(&self, prev_last: Option<u64>) -> Result<()> {
        let mut last = prev_last;
        for &ts in &self.timestamps {
            if let Some(prev) = last {
                if ts < prev {
                    return Err(JouleError::InvalidData(format!(
                        "timestamp {ts} is before previous timestamp {prev}"
                    )));
                }
            }
            last = Some(ts);
        }
        Ok(())
    }

    pub fn slice(&self, start: usize, end: usize) -> Block {
        let width = self.row_value_width();
        Block {
            layout: self.layout,
            timestamps: self.timestamps[start..end].to_vec(),
            data: self.data[start * width..end * width].to_vec(),
        }
    }

    pub fn split_off(&mut self, at: usize) -> Block {
        let width = self.row_value_width();
        let tail_ts = self.timestamps.split_off(at);
        let tail_data = self.data.split_off(at * width);
        Block {
            layout: self.layout,
            timestamps: tail_ts,
            data: tail_data,
        }
    }

    pub fn append(&mut self, mut other: Block) {
        debug_assert_eq!(self.layout, other.layout);
        self.timestamps.append(&mut other.timestamps);
        self.data.append(&mut other.data);
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.timestamps.last().copied()
    }

    /// Decode one raw record (timestamp + packed values) at byte offset 0.
    pub fn decode_raw_row(layout: &Layout, bytes: &[u8]) -> (u64, &[u8]) {
        let ts = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        (ts, &bytes[8..layout.raw_row_width()])
    }

    /// Encode this block's rows as raw little-endian records.
    pub fn encode_raw(&self) -> Vec<u8> {
        let width = self.row_value_width();
        let mut out = Vec::with_capacity(self.len() * self.layout.raw_row_width());
        for (i, &ts) in self.timestamps.iter().enumerate() {
            out.extend_from_slice(&ts.to_le_bytes());
            out.extend_from_slice(&self.data[i * width..(i + 1) * width]);
        }
        out
    }

    /// Decode a buffer of whole raw records into a block. Any trailing
    /// partial record is returned as leftover bytes (framed pipe uses this
    /// to hold a partial tail).
    pub fn decode_raw<'a>(layout: Layout, bytes: &'a [u8]) -> (Block, &'a [u8]) {
        let row_width = layout.raw_row_width();
        let n = bytes.len() / row_width;
        let mut timestamps = Vec::with_capacity(n);
        let mut data = Vec::with_capacity(n * layout.count * layout.dtype.width());
        for i in 0..n {
            let row = &bytes[i * row_width..(i + 1) * row_width];
            let ts = u64::from_le_bytes(row[0..8].try_into().unwrap());
            timestamps.push(ts);
            data.extend_from_slice(&row[8..]);
        }
        (
            Block {
                layout,
                timestamps,
                data,
            },
            &bytes[n * row_width..],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    #[test]
    fn flat_round_trips_through_raw_encode_decode() {
        let layout = Layout::parse("int32_2").unwrap();
        let block = Block::from_flat_values(
            layout,
            &[vec![10.0, 1.0, 2.0], vec![20.0, 3.0, 4.0]],
        );
        let raw = block.encode_raw();
        let (decoded, rest) = Block::decode_raw(layout, &raw);
        assert!(rest.is_empty());
        assert_eq!(decoded, block);
    }

    #[test]
    fn monotonic_validation_rejects_decrease() {
        let layout = Layout::parse("int32_1").unwrap();
        let block = Block::from_flat_values(layout, &[vec![10.0, 1.0], vec![5.0, 2.0]]);
        assert!(block.validate_monotonic(None).is_err());
    }
}
