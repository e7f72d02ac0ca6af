use std::collections::BTreeMap;
use std::io::Write;

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use serde_json::Serializer;
use serde_json::ser::PrettyFormatter;

use crate::error::PackError;
use crate::record::{Language, Record};

pub const DEFAULT_DESCRIPTION: &str = "统一的NPC对话气泡和喊话数据";
pub const DEFAULT_INDENT: usize = 2;

/// Columns that precede the language columns in every row.
pub const FIXED_COLUMNS: [(&str, FieldType); 4] = [
    ("data_type", FieldType::String),
    ("uid", FieldType::String),
    ("id", FieldType::Number),
    ("source", FieldType::String),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldTitle {
    pub en: String,
    pub zh: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub title: FieldTitle,
}

impl SchemaField {
    fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            title: FieldTitle {
                en: name.to_string(),
                zh: name.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TabxSchema {
    pub fields: Vec<SchemaField>,
}

/// Fixed parts of every chunk page: description, schema and column order.
#[derive(Debug, Clone)]
pub struct TabxLayout {
    description: BTreeMap<String, String>,
    schema: TabxSchema,
    languages: Vec<Language>,
    indent: Vec<u8>,
}

impl Default for TabxLayout {
    fn default() -> Self {
        let description = BTreeMap::from([("zh".to_string(), DEFAULT_DESCRIPTION.to_string())]);
        Self::new(description, &Language::ALL, DEFAULT_INDENT)
    }
}

impl TabxLayout {
    pub fn new(description: BTreeMap<String, String>, languages: &[Language], indent: usize) -> Self {
        let mut fields = FIXED_COLUMNS
            .iter()
            .map(|(name, field_type)| SchemaField::new(name, *field_type))
            .collect::<Vec<_>>();
        fields.extend(
            languages
                .iter()
                .map(|language| SchemaField::new(language.column(), FieldType::String)),
        );
        Self {
            description,
            schema: TabxSchema { fields },
            languages: languages.to_vec(),
            indent: vec![b' '; indent],
        }
    }

    pub fn schema(&self) -> &TabxSchema {
        &self.schema
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema
            .fields
            .iter()
            .map(|field| field.name.as_str())
            .collect()
    }

    /// Check that a record fits the column set before it is rendered.
    pub fn validate(&self, record: &Record) -> Result<(), PackError> {
        if let Some(language) = record
            .texts
            .keys()
            .find(|language| !self.languages.contains(language))
        {
            return Err(PackError::Serialization {
                uid: record.uid.clone(),
                message: format!("no `{}` column in the tabx schema", language.column()),
            });
        }
        Ok(())
    }

    /// Write the chunk page for `records` exactly as it is stored on disk.
    pub fn render<W: Write>(&self, records: &[Record], writer: W) -> Result<(), PackError> {
        for record in records {
            self.validate(record)?;
        }
        let document = TabxDocument {
            description: &self.description,
            schema: &self.schema,
            data: TabxRows {
                records,
                languages: &self.languages,
            },
        };
        let formatter = PrettyFormatter::with_indent(&self.indent);
        let mut serializer = Serializer::with_formatter(writer, formatter);
        document.serialize(&mut serializer)?;
        Ok(())
    }

    pub fn render_to_string(&self, records: &[Record]) -> Result<String, PackError> {
        let mut buffer = Vec::new();
        self.render(records, &mut buffer)?;
        String::from_utf8(buffer).map_err(|error| PackError::Serialization {
            uid: records.first().map(|record| record.uid.clone()).unwrap_or_default(),
            message: error.to_string(),
        })
    }
}

#[derive(Serialize)]
struct TabxDocument<'a> {
    description: &'a BTreeMap<String, String>,
    schema: &'a TabxSchema,
    data: TabxRows<'a>,
}

struct TabxRows<'a> {
    records: &'a [Record],
    languages: &'a [Language],
}

impl Serialize for TabxRows<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.records.len()))?;
        for record in self.records {
            seq.serialize_element(&TabxRow {
                record,
                languages: self.languages,
            })?;
        }
        seq.end()
    }
}

struct TabxRow<'a> {
    record: &'a Record,
    languages: &'a [Language],
}

impl Serialize for TabxRow<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(FIXED_COLUMNS.len() + self.languages.len()))?;
        seq.serialize_element(&self.record.data_type)?;
        seq.serialize_element(&self.record.uid)?;
        seq.serialize_element(&self.record.id)?;
        seq.serialize_element(&self.record.source)?;
        for language in self.languages {
            // Untranslated cells are stored as empty strings.
            seq.serialize_element(self.record.text(*language).unwrap_or(""))?;
        }
        seq.end()
    }
}
