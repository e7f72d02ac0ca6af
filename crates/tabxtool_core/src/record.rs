use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordError;

/// Client languages shipped with the game text tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Language {
    Ko,
    En,
    Ja,
    Chs,
    Fr,
    De,
    Tc,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Self::Ko,
        Self::En,
        Self::Ja,
        Self::Chs,
        Self::Fr,
        Self::De,
        Self::Tc,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Ko => "KO",
            Self::En => "EN",
            Self::Ja => "JA",
            Self::Chs => "CHS",
            Self::Fr => "FR",
            Self::De => "DE",
            Self::Tc => "TC",
        }
    }

    /// Column name used in both the input records and the tabx schema.
    pub fn column(self) -> &'static str {
        match self {
            Self::Ko => "text_KO",
            Self::En => "text_EN",
            Self::Ja => "text_JA",
            Self::Chs => "text_CHS",
            Self::Fr => "text_FR",
            Self::De => "text_DE",
            Self::Tc => "text_TC",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|language| language.code().eq_ignore_ascii_case(code.trim()))
    }

    pub fn from_column(column: &str) -> Option<Self> {
        column.strip_prefix("text_").and_then(Self::from_code)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One merged multilingual text entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data_type: String,
    pub uid: String,
    pub id: i64,
    pub source: String,
    pub texts: BTreeMap<Language, String>,
}

impl Record {
    pub fn new(data_type: &str, source: &str, id: i64) -> Self {
        Self {
            data_type: data_type.to_string(),
            uid: format!("{source}-{id}"),
            id,
            source: source.to_string(),
            texts: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, language: Language, text: impl Into<String>) -> Self {
        self.texts.insert(language, text.into());
        self
    }

    pub fn text(&self, language: Language) -> Option<&str> {
        self.texts.get(&language).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    data_type: String,
    uid: String,
    id: i64,
    source: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl RawRecord {
    fn into_record(self, index: usize) -> Result<Record, RecordError> {
        if self.uid.trim().is_empty() {
            return Err(RecordError::EmptyUid { index });
        }
        let mut texts = BTreeMap::new();
        for (field, value) in self.extra {
            let Some(language) = Language::from_column(&field) else {
                return Err(RecordError::UnknownField {
                    index,
                    uid: self.uid,
                    field,
                });
            };
            match value {
                Value::Null => {}
                Value::String(text) => {
                    texts.insert(language, text);
                }
                _ => {
                    return Err(RecordError::NonStringText {
                        index,
                        uid: self.uid,
                        field,
                    });
                }
            }
        }
        Ok(Record {
            data_type: self.data_type,
            uid: self.uid,
            id: self.id,
            source: self.source,
            texts,
        })
    }
}

/// Parse a JSON array of records, keeping input order.
pub fn parse_records(content: &str) -> Result<Vec<Record>, RecordError> {
    let raw: Vec<RawRecord> =
        serde_json::from_str(content.trim_start_matches('\u{feff}')).map_err(RecordError::Malformed)?;
    raw.into_iter()
        .enumerate()
        .map(|(index, record)| record.into_record(index))
        .collect()
}

pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read records from {}", path.display()))?;
    parse_records(&content).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_in_input_order() {
        let records = parse_records(
            r#"[
                {"data_type": "unified_npc_balloon", "uid": "BA-2", "id": 2, "source": "BA", "text_EN": "Hello", "text_JA": null},
                {"data_type": "unified_npc_balloon", "uid": "YE-1", "id": 1, "source": "YE", "text_CHS": "你好"}
            ]"#,
        )
        .expect("parse records");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].uid, "BA-2");
        assert_eq!(records[0].text(Language::En), Some("Hello"));
        assert_eq!(records[0].text(Language::Ja), None);
        assert_eq!(records[1].uid, "YE-1");
        assert_eq!(records[1].text(Language::Chs), Some("你好"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = parse_records(
            r#"[{"data_type": "x", "uid": "BA-1", "id": 1, "source": "BA", "text_XX": "?"}]"#,
        )
        .expect_err("must fail");
        assert!(matches!(error, RecordError::UnknownField { ref field, .. } if field == "text_XX"));
    }

    #[test]
    fn rejects_non_string_text() {
        let error = parse_records(
            r#"[{"data_type": "x", "uid": "BA-1", "id": 1, "source": "BA", "text_EN": 5}]"#,
        )
        .expect_err("must fail");
        assert!(matches!(error, RecordError::NonStringText { .. }));
    }

    #[test]
    fn rejects_non_array_input() {
        let error = parse_records(r#"{"uid": "BA-1"}"#).expect_err("must fail");
        assert!(matches!(error, RecordError::Malformed(_)));
    }

    #[test]
    fn language_columns_round_trip() {
        for language in Language::ALL {
            assert_eq!(Language::from_column(language.column()), Some(language));
        }
        assert_eq!(Language::from_code("chs"), Some(Language::Chs));
        assert_eq!(Language::from_column("uid"), None);
    }

    #[test]
    fn new_builds_uid_from_source_and_id() {
        let record = Record::new("unified_npc_balloon", "IC", 12306).with_text(Language::En, "Welcome");
        assert_eq!(record.uid, "IC-12306");
        assert_eq!(record.text(Language::En), Some("Welcome"));
    }
}
