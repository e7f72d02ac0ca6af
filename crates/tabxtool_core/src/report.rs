use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::{Language, Record};

pub const DEFAULT_LONG_FIELD_THRESHOLD: usize = 400;

/// A text cell longer than the soft threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LongField {
    pub uid: String,
    pub field: String,
    pub language: Option<Language>,
    pub length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LongFieldReport {
    pub threshold: usize,
    pub observed_records: usize,
    pub entries: BTreeMap<String, Vec<LongField>>,
}

impl LongFieldReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn field_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LongField> {
        self.entries.values().flatten()
    }
}

/// Collects long text cells while records stream through the packer.
/// Lengths are counted in characters, not bytes.
#[derive(Debug, Clone)]
pub struct LongFieldReporter {
    report: LongFieldReport,
}

impl LongFieldReporter {
    pub fn new(threshold: usize) -> Self {
        Self {
            report: LongFieldReport {
                threshold,
                ..LongFieldReport::default()
            },
        }
    }

    pub fn observe(&mut self, record: &Record) {
        self.report.observed_records += 1;
        let fixed = [
            ("data_type", record.data_type.as_str()),
            ("uid", record.uid.as_str()),
            ("source", record.source.as_str()),
        ];
        for (field, value) in fixed {
            self.check(record, field, None, value);
        }
        for (language, text) in &record.texts {
            self.check(record, language.column(), Some(*language), text);
        }
    }

    fn check(&mut self, record: &Record, field: &str, language: Option<Language>, value: &str) {
        let length = value.chars().count();
        if length <= self.report.threshold {
            return;
        }
        self.report
            .entries
            .entry(record.uid.clone())
            .or_default()
            .push(LongField {
                uid: record.uid.clone(),
                field: field.to_string(),
                language,
                length,
            });
    }

    pub fn finish(self) -> LongFieldReport {
        self.report
    }
}
