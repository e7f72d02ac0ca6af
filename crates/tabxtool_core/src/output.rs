use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::pack::{PackingResult, UnavoidableOverflow};
use crate::record::Record;
use crate::report::LongFieldReport;
use crate::tabx::TabxLayout;

pub fn chunk_file_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_chunk_{index}.json")
}

pub fn report_file_name(prefix: &str) -> String {
    format!("{prefix}_pack_report.json")
}

/// Extract `n` from `<prefix>_chunk_<n>.json`.
pub fn parse_chunk_index(prefix: &str, file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix("_chunk_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    pub index: usize,
    pub path: PathBuf,
    pub file_name: String,
}

impl ChunkFile {
    pub fn stem(&self) -> &str {
        self.file_name
            .strip_suffix(".json")
            .unwrap_or(&self.file_name)
    }
}

/// List chunk files of `prefix` in `dir`, ordered by numeric chunk index.
pub fn discover_chunk_files(dir: &Path, prefix: &str) -> Result<Vec<ChunkFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(index) = parse_chunk_index(prefix, &file_name) else {
            continue;
        };
        files.push(ChunkFile {
            index,
            path: entry.into_path(),
            file_name,
        });
    }
    files.sort_by_key(|file| file.index);
    Ok(files)
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReportEntry {
    pub index: usize,
    pub file: String,
    pub records: usize,
    pub byte_size: usize,
    pub elapsed_ms: f64,
    pub estimate_calls: usize,
    pub overflow: bool,
    pub first_uid: String,
    pub last_uid: String,
}

/// Side report written next to the chunk files.
#[derive(Debug, Clone, Serialize)]
pub struct PackReport {
    pub input_records: usize,
    pub ceiling_bytes: usize,
    pub batch_size: usize,
    pub estimate_calls: usize,
    pub elapsed_ms: f64,
    pub chunks: Vec<ChunkReportEntry>,
    pub overflows: Vec<UnavoidableOverflow>,
    pub long_fields: LongFieldReport,
}

impl PackReport {
    pub fn new(prefix: &str, records: &[Record], result: &PackingResult) -> Self {
        let chunks = result
            .chunks
            .iter()
            .map(|chunk| {
                let members = chunk.records(records);
                ChunkReportEntry {
                    index: chunk.index,
                    file: chunk_file_name(prefix, chunk.index),
                    records: chunk.len(),
                    byte_size: chunk.byte_size,
                    elapsed_ms: chunk.elapsed.as_secs_f64() * 1000.0,
                    estimate_calls: chunk.estimate_calls,
                    overflow: chunk.overflow,
                    first_uid: members.first().map(|r| r.uid.clone()).unwrap_or_default(),
                    last_uid: members.last().map(|r| r.uid.clone()).unwrap_or_default(),
                }
            })
            .collect();
        Self {
            input_records: records.len(),
            ceiling_bytes: result.ceiling_bytes,
            batch_size: result.batch_size,
            estimate_calls: result.estimate_calls,
            elapsed_ms: result.elapsed.as_secs_f64() * 1000.0,
            chunks,
            overflows: result.overflows.clone(),
            long_fields: result.long_fields.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrittenChunk {
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
    pub records: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub removed: Vec<PathBuf>,
    pub files: Vec<WrittenChunk>,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WriteOptions<'a> {
    pub output_dir: &'a Path,
    pub prefix: &'a str,
    pub write_report: bool,
}

/// Replace the chunk files of `prefix` with the packed result.
pub fn write_chunks(
    options: &WriteOptions<'_>,
    layout: &TabxLayout,
    records: &[Record],
    result: &PackingResult,
) -> Result<WriteReport> {
    fs::create_dir_all(options.output_dir)
        .with_context(|| format!("failed to create {}", options.output_dir.display()))?;

    let mut report = WriteReport::default();
    for stale in discover_chunk_files(options.output_dir, options.prefix)? {
        fs::remove_file(&stale.path)
            .with_context(|| format!("failed to remove {}", stale.path.display()))?;
        report.removed.push(stale.path);
    }
    if !report.removed.is_empty() {
        warn!(count = report.removed.len(), "removed existing chunk files");
    }

    for chunk in &result.chunks {
        let path = options
            .output_dir
            .join(chunk_file_name(options.prefix, chunk.index));
        let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        layout
            .render(chunk.records(records), &mut writer)
            .with_context(|| format!("failed to write {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to write {}", path.display()))?;
        drop(writer);

        let bytes = fs::metadata(&path)
            .with_context(|| format!("failed to inspect {}", path.display()))?
            .len();
        if bytes != chunk.byte_size as u64 {
            bail!(
                "{} is {bytes} bytes but was packed as {} bytes",
                path.display(),
                chunk.byte_size
            );
        }
        report.files.push(WrittenChunk {
            index: chunk.index,
            path,
            bytes,
            records: chunk.len(),
        });
    }

    if options.write_report {
        let path = options.output_dir.join(report_file_name(options.prefix));
        let rendered = serde_json::to_string_pretty(&PackReport::new(options.prefix, records, result))
            .context("failed to serialize pack report")?;
        fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
        report.report_path = Some(path);
    }

    info!(
        chunks = report.files.len(),
        dir = %options.output_dir.display(),
        "wrote chunk files"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tempfile::tempdir;

    use super::*;
    use crate::pack::{PackOptions, pack};
    use crate::record::Language;

    fn records(count: i64) -> Vec<Record> {
        (1..=count)
            .map(|id| {
                Record::new("unified_npc_balloon", "BA", id)
                    .with_text(Language::En, format!("line {id} {}", "z".repeat(60)))
                    .with_text(Language::Chs, "对话".repeat(20))
            })
            .collect()
    }

    #[test]
    fn parse_chunk_index_requires_exact_shape() {
        assert_eq!(parse_chunk_index("npc", "npc_chunk_12.json"), Some(12));
        assert_eq!(parse_chunk_index("npc", "npc_chunk_x.json"), None);
        assert_eq!(parse_chunk_index("npc", "npc_pack_report.json"), None);
        assert_eq!(parse_chunk_index("npc", "other_chunk_1.json"), None);
    }

    #[test]
    fn discover_sorts_numerically() {
        let temp = tempdir().expect("tempdir");
        for name in ["npc_chunk_10.json", "npc_chunk_2.json", "npc_chunk_1.json", "notes.txt"] {
            fs::write(temp.path().join(name), "{}").expect("write");
        }
        let files = discover_chunk_files(temp.path(), "npc").expect("discover");
        let indexes = files.iter().map(|file| file.index).collect::<Vec<_>>();
        assert_eq!(indexes, vec![1, 2, 10]);
        assert_eq!(files[2].stem(), "npc_chunk_10");
    }

    #[test]
    fn written_files_match_packed_sizes_and_order() {
        let temp = tempdir().expect("tempdir");
        let layout = TabxLayout::default();
        let records = records(30);
        let options = PackOptions {
            ceiling_bytes: 8_000,
            batch_size: 4,
            ..PackOptions::default()
        };
        let result = pack(&records, &layout, options).expect("pack");
        assert!(result.chunks.len() > 1);

        let report = write_chunks(
            &WriteOptions {
                output_dir: temp.path(),
                prefix: "npc",
                write_report: true,
            },
            &layout,
            &records,
            &result,
        )
        .expect("write chunks");

        assert_eq!(report.files.len(), result.chunks.len());
        let mut uids = Vec::new();
        for file in discover_chunk_files(temp.path(), "npc").expect("discover") {
            let content = fs::read_to_string(&file.path).expect("read chunk");
            assert!(content.len() <= 8_000);
            let parsed: Value = serde_json::from_str(&content).expect("parse chunk");
            for row in parsed["data"].as_array().expect("data") {
                uids.push(row[1].as_str().expect("uid").to_string());
            }
        }
        let expected = records.iter().map(|r| r.uid.clone()).collect::<Vec<_>>();
        assert_eq!(uids, expected);

        let side: Value = serde_json::from_str(
            &fs::read_to_string(temp.path().join("npc_pack_report.json")).expect("read report"),
        )
        .expect("parse report");
        assert_eq!(side["input_records"], 30);
        assert_eq!(side["chunks"].as_array().expect("chunks").len(), result.chunks.len());
    }

    #[test]
    fn rewriting_removes_stale_chunks() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("npc_chunk_7.json"), "{}").expect("write stale");
        fs::write(temp.path().join("keep_chunk_7.json"), "{}").expect("write other prefix");
        let layout = TabxLayout::default();
        let records = records(2);
        let result = pack(&records, &layout, PackOptions::default()).expect("pack");

        let report = write_chunks(
            &WriteOptions {
                output_dir: temp.path(),
                prefix: "npc",
                write_report: false,
            },
            &layout,
            &records,
            &result,
        )
        .expect("write chunks");

        assert_eq!(report.removed.len(), 1);
        assert!(!temp.path().join("npc_chunk_7.json").exists());
        assert!(temp.path().join("npc_chunk_0.json").exists());
        assert!(temp.path().join("keep_chunk_7.json").exists());
        assert!(report.report_path.is_none());
    }
}
