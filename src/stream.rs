//! The stream model: identity, layout, and retention policy for one
//! named time series. Folder ownership is out of scope (§3) but
//! `folder_id` is kept so call sites compile against the real shape.

use crate::layout::Layout;

/// Retention sentinel meaning "keep everything" (mirrors the reference's
/// `Stream.KEEP_ALL`).
pub const KEEP_ALL: i64 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    pub id: i64,
    pub name: String,
    pub layout: Layout,
    pub decimate: bool,
    pub keep_us: i64,
    pub folder_id: i64,
}

impl Stream {
    pub fn new(id: i64, name: impl Into<String>, layout: Layout) -> Self {
        Stream {
            id,
            name: name.into(),
            layout,
            decimate: true,
            keep_us: KEEP_ALL,
            folder_id: 0,
        }
    }

    pub fn decimated_layout(&self) -> Layout {
        self.layout.decimated()
    }

    /// Name of the raw hypertable: `stream<id>`.
    pub fn table_name(&self) -> String {
        format!("stream{}", self.id)
    }

    /// Name of the decimated hypertable at the given factor: `stream<id>_d<factor>`.
    pub fn decimated_table_name(&self, factor: u32) -> String {
        format!("stream{}_d{}", self.id, factor)
    }

    /// Name of the boundary table: `stream<id>_intervals`.
    pub fn intervals_table_name(&self) -> String {
        format!("stream{}_intervals", self.id)
    }
}

/// Derived view exposing summary statistics for a stream (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub rows: u64,
    pub bytes: u64,
    /// `(factor, row_count)` for each maintained decimation level.
    pub decimated_rows: Vec<(u32, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    #[test]
    fn table_names_follow_stream_id() {
        let s = Stream::new(42, "accel", Layout::parse("float32_3").unwrap());
        assert_eq!(s.table_name(), "stream42");
        assert_eq!(s.decimated_table_name(4), "stream42_d4");
        assert_eq!(s.intervals_table_name(), "stream42_intervals");
    }
}
