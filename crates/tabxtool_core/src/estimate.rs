use std::io::{self, Write};

use crate::error::PackError;
use crate::record::Record;
use crate::tabx::TabxLayout;

/// Measures the serialized size of a candidate chunk.
pub trait SizeEstimate {
    fn estimate(&mut self, records: &[Record]) -> Result<usize, PackError>;
    /// Number of `estimate` calls made so far.
    fn calls(&self) -> usize;
}

/// Exact estimator: renders the chunk page through the same serializer as the
/// chunk writer and counts the bytes.
#[derive(Debug)]
pub struct SerializedSize<'a> {
    layout: &'a TabxLayout,
    calls: usize,
}

impl<'a> SerializedSize<'a> {
    pub fn new(layout: &'a TabxLayout) -> Self {
        Self { layout, calls: 0 }
    }
}

impl SizeEstimate for SerializedSize<'_> {
    fn estimate(&mut self, records: &[Record]) -> Result<usize, PackError> {
        self.calls += 1;
        let mut counter = ByteCounter::default();
        self.layout.render(records, &mut counter)?;
        Ok(counter.bytes)
    }

    fn calls(&self) -> usize {
        self.calls
    }
}

#[derive(Debug, Default)]
struct ByteCounter {
    bytes: usize,
}

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Language;

    #[test]
    fn estimate_matches_rendered_utf8_length() {
        let layout = TabxLayout::default();
        let records = vec![
            Record::new("unified_npc_balloon", "BA", 1).with_text(Language::Ja, "こんにちは"),
            Record::new("unified_npc_balloon", "YE", 2).with_text(Language::En, "tab\there \"quoted\""),
        ];
        let mut estimator = SerializedSize::new(&layout);

        let size = estimator.estimate(&records).expect("estimate");
        let rendered = layout.render_to_string(&records).expect("render");

        assert_eq!(size, rendered.len());
        assert!(size > rendered.chars().count());
    }

    #[test]
    fn counts_every_call() {
        let layout = TabxLayout::default();
        let records = vec![Record::new("unified_npc_balloon", "BA", 1)];
        let mut estimator = SerializedSize::new(&layout);
        assert_eq!(estimator.calls(), 0);

        estimator.estimate(&records).expect("estimate");
        estimator.estimate(&[]).expect("estimate");
        assert_eq!(estimator.calls(), 2);
    }

    #[test]
    fn empty_chunk_still_carries_schema_overhead() {
        let layout = TabxLayout::default();
        let mut estimator = SerializedSize::new(&layout);
        let empty = estimator.estimate(&[]).expect("estimate");
        let one = estimator
            .estimate(&[Record::new("unified_npc_balloon", "BA", 1)])
            .expect("estimate");
        assert!(empty > 500);
        assert!(one > empty);
    }
}
