use std::ops::Range;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PackError;
use crate::estimate::{SerializedSize, SizeEstimate};
use crate::record::Record;
use crate::report::{DEFAULT_LONG_FIELD_THRESHOLD, LongFieldReport, LongFieldReporter};
use crate::tabx::TabxLayout;

/// Safe page size for a tabx page on the target wiki.
pub const DEFAULT_CEILING_BYTES: usize = 1_800_000;
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackOptions {
    pub ceiling_bytes: usize,
    pub batch_size: usize,
    pub long_field_threshold: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            ceiling_bytes: DEFAULT_CEILING_BYTES,
            batch_size: DEFAULT_BATCH_SIZE,
            long_field_threshold: DEFAULT_LONG_FIELD_THRESHOLD,
        }
    }
}

impl PackOptions {
    /// Build options from raw configuration values, rejecting non-positive limits.
    pub fn new(ceiling_bytes: i64, batch_size: i64, long_field_threshold: usize) -> Result<Self, PackError> {
        let ceiling = usize::try_from(ceiling_bytes)
            .ok()
            .filter(|value| *value > 0)
            .ok_or(PackError::InvalidCeiling(ceiling_bytes))?;
        let batch = usize::try_from(batch_size)
            .ok()
            .filter(|value| *value > 0)
            .ok_or(PackError::InvalidBatchSize(batch_size))?;
        Ok(Self {
            ceiling_bytes: ceiling,
            batch_size: batch,
            long_field_threshold,
        })
    }

    pub fn validate(&self) -> Result<(), PackError> {
        if self.ceiling_bytes == 0 {
            return Err(PackError::InvalidCeiling(0));
        }
        if self.batch_size == 0 {
            return Err(PackError::InvalidBatchSize(0));
        }
        Ok(())
    }
}

/// One finalized chunk: a contiguous run of the input records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedChunk {
    pub index: usize,
    pub range: Range<usize>,
    pub byte_size: usize,
    pub elapsed: Duration,
    pub estimate_calls: usize,
    pub overflow: bool,
}

impl PackedChunk {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn records<'r>(&self, records: &'r [Record]) -> &'r [Record] {
        &records[self.range.clone()]
    }
}

/// A single record that exceeds the ceiling on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavoidableOverflow {
    pub chunk_index: usize,
    pub uid: String,
    pub byte_size: usize,
    pub ceiling_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct PackingResult {
    pub chunks: Vec<PackedChunk>,
    pub overflows: Vec<UnavoidableOverflow>,
    pub long_fields: LongFieldReport,
    pub estimate_calls: usize,
    pub elapsed: Duration,
    pub ceiling_bytes: usize,
    pub batch_size: usize,
}

impl PackingResult {
    pub fn record_count(&self) -> usize {
        self.chunks.iter().map(PackedChunk::len).sum()
    }
}

#[derive(Debug)]
struct OpenChunk {
    range: Range<usize>,
    byte_size: usize,
    opened_at: Instant,
    calls_at_open: usize,
}

impl OpenChunk {
    fn at(position: usize, calls: usize) -> Self {
        Self {
            range: position..position,
            byte_size: 0,
            opened_at: Instant::now(),
            calls_at_open: calls,
        }
    }

    fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    fn extend_to(&mut self, end: usize, byte_size: usize) {
        self.range.end = end;
        self.byte_size = byte_size;
    }
}

/// Greedy batch-wise packer.
///
/// Each `step` consumes one batch: the batch is appended to the open chunk if
/// the combined page fits under the ceiling. Otherwise the open chunk is
/// closed, the batch is tried on its own, and failing that the batch is placed
/// record by record. A record that is too large even on its own becomes a
/// one-record chunk and is reported as an [`UnavoidableOverflow`].
///
/// Callers that need to stop early may stop between steps and call `finish`.
pub struct ChunkPacker<'a, E> {
    records: &'a [Record],
    options: PackOptions,
    estimator: E,
    reporter: LongFieldReporter,
    next: usize,
    current: OpenChunk,
    chunks: Vec<PackedChunk>,
    overflows: Vec<UnavoidableOverflow>,
    started_at: Instant,
}

impl<'a, E: SizeEstimate> ChunkPacker<'a, E> {
    pub fn new(records: &'a [Record], options: PackOptions, estimator: E) -> Result<Self, PackError> {
        options.validate()?;
        let calls = estimator.calls();
        Ok(Self {
            records,
            options,
            estimator,
            reporter: LongFieldReporter::new(options.long_field_threshold),
            next: 0,
            current: OpenChunk::at(0, calls),
            chunks: Vec::new(),
            overflows: Vec::new(),
            started_at: Instant::now(),
        })
    }

    /// Number of input records consumed so far.
    pub fn consumed(&self) -> usize {
        self.next
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.records.len()
    }

    /// Consume the next batch. Returns `false` once the input is exhausted.
    pub fn step(&mut self) -> Result<bool, PackError> {
        if self.is_done() {
            return Ok(false);
        }
        let batch_start = self.next;
        let batch_end = (batch_start + self.options.batch_size).min(self.records.len());
        for record in &self.records[batch_start..batch_end] {
            self.reporter.observe(record);
        }
        self.next = batch_end;

        let ceiling = self.options.ceiling_bytes;
        let was_empty = self.current.is_empty();
        let candidate = self.estimate(self.current.range.start..batch_end)?;
        if candidate <= ceiling {
            self.current.extend_to(batch_end, candidate);
            return Ok(true);
        }

        // With an empty open chunk the candidate already was the batch alone.
        let batch_alone = if was_empty {
            candidate
        } else {
            self.finalize();
            let size = self.estimate(batch_start..batch_end)?;
            if size <= ceiling {
                self.current.extend_to(batch_end, size);
                return Ok(true);
            }
            size
        };

        if batch_end - batch_start == 1 {
            self.current.extend_to(batch_end, batch_alone);
            self.finalize();
            return Ok(true);
        }

        for index in batch_start..batch_end {
            self.place_record(index)?;
        }
        Ok(true)
    }

    /// Close any trailing chunk and return the result.
    pub fn finish(mut self) -> PackingResult {
        self.finalize();
        PackingResult {
            chunks: self.chunks,
            overflows: self.overflows,
            long_fields: self.reporter.finish(),
            estimate_calls: self.estimator.calls(),
            elapsed: self.started_at.elapsed(),
            ceiling_bytes: self.options.ceiling_bytes,
            batch_size: self.options.batch_size,
        }
    }

    pub fn run(mut self) -> Result<PackingResult, PackError> {
        while self.step()? {}
        Ok(self.finish())
    }

    fn place_record(&mut self, index: usize) -> Result<(), PackError> {
        let ceiling = self.options.ceiling_bytes;
        if !self.current.is_empty() {
            let size = self.estimate(self.current.range.start..index + 1)?;
            if size <= ceiling {
                self.current.extend_to(index + 1, size);
                return Ok(());
            }
            self.finalize();
        }
        let size = self.estimate(index..index + 1)?;
        self.current.extend_to(index + 1, size);
        if size > ceiling {
            self.finalize();
        }
        Ok(())
    }

    fn estimate(&mut self, range: Range<usize>) -> Result<usize, PackError> {
        self.estimator.estimate(&self.records[range])
    }

    fn finalize(&mut self) {
        let calls = self.estimator.calls();
        let next = OpenChunk::at(self.current.range.end, calls);
        let open = std::mem::replace(&mut self.current, next);
        if open.is_empty() {
            return;
        }

        let index = self.chunks.len();
        let overflow = open.byte_size > self.options.ceiling_bytes;
        if overflow {
            let uid = self.records[open.range.start].uid.clone();
            warn!(
                chunk = index,
                uid = %uid,
                bytes = open.byte_size,
                ceiling = self.options.ceiling_bytes,
                "record exceeds the chunk ceiling on its own; emitting it as a single-record chunk"
            );
            self.overflows.push(UnavoidableOverflow {
                chunk_index: index,
                uid,
                byte_size: open.byte_size,
                ceiling_bytes: self.options.ceiling_bytes,
            });
        }

        let chunk = PackedChunk {
            index,
            byte_size: open.byte_size,
            elapsed: open.opened_at.elapsed(),
            estimate_calls: calls - open.calls_at_open,
            overflow,
            range: open.range,
        };
        debug!(
            chunk = chunk.index,
            records = chunk.len(),
            bytes = chunk.byte_size,
            estimate_calls = chunk.estimate_calls,
            "chunk finalized"
        );
        self.chunks.push(chunk);
    }
}

/// Pack `records` into chunk pages rendered with `layout`.
pub fn pack(records: &[Record], layout: &TabxLayout, options: PackOptions) -> Result<PackingResult, PackError> {
    pack_with(records, options, SerializedSize::new(layout))
}

pub fn pack_with<E: SizeEstimate>(
    records: &[Record],
    options: PackOptions,
    estimator: E,
) -> Result<PackingResult, PackError> {
    ChunkPacker::new(records, options, estimator)?.run()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::record::Language;

    /// Sums a fixed per-record size taken from the record id.
    #[derive(Default)]
    struct ScriptedSizes {
        calls: usize,
    }

    impl SizeEstimate for ScriptedSizes {
        fn estimate(&mut self, records: &[Record]) -> Result<usize, PackError> {
            self.calls += 1;
            Ok(records.iter().map(|record| record.id as usize).sum())
        }

        fn calls(&self) -> usize {
            self.calls
        }
    }

    fn sized(sizes: &[usize]) -> Vec<Record> {
        sizes
            .iter()
            .map(|size| Record::new("test", "BA", *size as i64))
            .collect()
    }

    fn options(ceiling_bytes: usize, batch_size: usize) -> PackOptions {
        PackOptions {
            ceiling_bytes,
            batch_size,
            long_field_threshold: DEFAULT_LONG_FIELD_THRESHOLD,
        }
    }

    fn ranges(result: &PackingResult) -> Vec<Range<usize>> {
        result.chunks.iter().map(|chunk| chunk.range.clone()).collect()
    }

    #[test]
    fn batch_that_overflows_the_open_chunk_starts_a_new_one() {
        let records = sized(&[400, 400, 500]);
        let result = pack_with(&records, options(1000, 2), ScriptedSizes::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..2, 2..3]);
        assert_eq!(result.chunks[0].byte_size, 800);
        assert_eq!(result.chunks[1].byte_size, 500);
        assert!(result.overflows.is_empty());
        // First batch, failed append of the second batch, second batch alone.
        assert_eq!(result.estimate_calls, 3);
        assert_eq!(result.chunks[0].estimate_calls, 2);
        assert_eq!(result.chunks[1].estimate_calls, 1);
    }

    #[test]
    fn single_oversized_record_is_emitted_alone_and_reported() {
        let records = sized(&[1500]);
        let result = pack_with(&records, options(1000, 10), ScriptedSizes::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..1]);
        assert!(result.chunks[0].overflow);
        assert_eq!(
            result.overflows,
            vec![UnavoidableOverflow {
                chunk_index: 0,
                uid: "BA-1500".to_string(),
                byte_size: 1500,
                ceiling_bytes: 1000,
            }]
        );
        assert_eq!(result.estimate_calls, 1);
    }

    #[test]
    fn oversized_batch_falls_back_to_single_records() {
        let records = sized(&[300, 300, 300, 300, 300]);
        let result = pack_with(&records, options(1000, 4), ScriptedSizes::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..3, 3..5]);
        assert_eq!(result.chunks[0].byte_size, 900);
        assert_eq!(result.chunks[1].byte_size, 600);
    }

    #[test]
    fn oversized_record_inside_a_batch_is_isolated() {
        let records = sized(&[200, 1500, 200]);
        let result = pack_with(&records, options(1000, 3), ScriptedSizes::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..1, 1..2, 2..3]);
        assert_eq!(
            result
                .chunks
                .iter()
                .map(|chunk| chunk.overflow)
                .collect::<Vec<_>>(),
            vec![false, true, false]
        );
        assert_eq!(result.overflows.len(), 1);
        assert_eq!(result.overflows[0].chunk_index, 1);
    }

    #[test]
    fn open_chunk_is_closed_before_trying_the_batch_alone() {
        // The second batch fits neither appended nor alone. Record 2 would
        // still fit behind the first chunk, but that chunk is already closed.
        let records = sized(&[200, 100, 600, 600, 100, 100]);
        let result = pack_with(&records, options(1000, 2), ScriptedSizes::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..2, 2..3, 3..6]);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let result = pack_with(&[], options(1000, 10), ScriptedSizes::default()).expect("pack");
        assert!(result.chunks.is_empty());
        assert!(result.overflows.is_empty());
        assert_eq!(result.estimate_calls, 0);
    }

    #[test]
    fn non_positive_limits_are_rejected() {
        assert!(matches!(
            PackOptions::new(0, 10, 400),
            Err(PackError::InvalidCeiling(0))
        ));
        assert!(matches!(
            PackOptions::new(-5, 10, 400),
            Err(PackError::InvalidCeiling(-5))
        ));
        assert!(matches!(
            PackOptions::new(1000, 0, 400),
            Err(PackError::InvalidBatchSize(0))
        ));
        let records = sized(&[1]);
        assert!(matches!(
            pack_with(&records, options(1000, 0), ScriptedSizes::default()),
            Err(PackError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn stepping_can_stop_between_batches() {
        let records = sized(&[100, 100, 100, 100, 100]);
        let mut packer = ChunkPacker::new(&records, options(1000, 2), ScriptedSizes::default()).expect("packer");
        assert!(packer.step().expect("step"));
        assert_eq!(packer.consumed(), 2);
        let result = packer.finish();
        assert_eq!(ranges(&result), vec![0..2]);
        assert_eq!(result.long_fields.observed_records, 2);
    }

    #[test]
    fn real_estimator_keeps_chunks_under_the_ceiling() {
        let layout = TabxLayout::default();
        let records = (0..40)
            .map(|id| {
                Record::new("unified_npc_balloon", "YE", id)
                    .with_text(Language::En, "x".repeat(40 + (id as usize * 37) % 200))
                    .with_text(Language::Ja, "あ".repeat((id as usize * 13) % 90))
            })
            .collect::<Vec<_>>();
        let ceiling = 6_000;
        let result = pack(&records, &layout, options(ceiling, 3)).expect("pack");

        assert!(result.chunks.len() > 1);
        for chunk in &result.chunks {
            let rendered = layout
                .render_to_string(chunk.records(&records))
                .expect("render");
            assert_eq!(rendered.len(), chunk.byte_size);
            assert!(chunk.byte_size <= ceiling);
        }
        assert_eq!(result.record_count(), records.len());
    }

    #[test]
    fn long_fields_are_reported_during_packing() {
        let layout = TabxLayout::default();
        let records = vec![
            Record::new("unified_npc_balloon", "BA", 1).with_text(Language::En, "short"),
            Record::new("unified_npc_balloon", "BA", 2).with_text(Language::En, "y".repeat(450)),
        ];
        let result = pack(&records, &layout, PackOptions::default()).expect("pack");

        assert_eq!(ranges(&result), vec![0..2]);
        assert_eq!(result.long_fields.observed_records, 2);
        let flagged = result.long_fields.entries.get("BA-2").expect("BA-2 flagged");
        assert_eq!(flagged[0].field, "text_EN");
        assert_eq!(flagged[0].length, 450);
    }

    #[test]
    fn serialization_failure_propagates() {
        let layout = TabxLayout::new(BTreeMap::new(), &[Language::En], 2);
        let records = vec![
            Record::new("unified_npc_balloon", "BA", 1).with_text(Language::En, "ok"),
            Record::new("unified_npc_balloon", "BA", 2).with_text(Language::Tc, "無"),
        ];
        let error = pack(&records, &layout, PackOptions::default()).expect_err("must fail");
        assert!(matches!(error, PackError::Serialization { ref uid, .. } if uid == "BA-2"));
    }

    proptest! {
        #[test]
        fn packing_invariants_hold(
            sizes in prop::collection::vec(1usize..2_000, 0..60),
            ceiling in 500usize..3_000,
            batch_size in 1usize..12,
        ) {
            let records = sized(&sizes);
            let first = pack_with(&records, options(ceiling, batch_size), ScriptedSizes::default()).expect("pack");
            let second = pack_with(&records, options(ceiling, batch_size), ScriptedSizes::default()).expect("pack");

            // Contiguous, ordered, complete.
            let mut expected_start = 0;
            for chunk in &first.chunks {
                prop_assert_eq!(chunk.range.start, expected_start);
                prop_assert!(!chunk.is_empty());
                expected_start = chunk.range.end;
            }
            prop_assert_eq!(expected_start, records.len());
            prop_assert_eq!(first.record_count(), records.len());

            for chunk in &first.chunks {
                let total: usize = sizes[chunk.range.clone()].iter().sum();
                prop_assert_eq!(total, chunk.byte_size);
                if chunk.byte_size > ceiling {
                    prop_assert_eq!(chunk.len(), 1);
                    prop_assert!(chunk.overflow);
                } else {
                    prop_assert!(!chunk.overflow);
                }
            }
            let oversized = sizes.iter().filter(|size| **size > ceiling).count();
            prop_assert_eq!(first.overflows.len(), oversized);

            prop_assert_eq!(ranges(&first), ranges(&second));
        }
    }
}
