//! Tabular previews of a single variable.
//!
//! The kernel-side scripts answer a matrix request with a pandas
//! `orient="table"` document: a table schema plus one JSON object per row.
//! Models are built per request and never cached.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::error::DecodeError;
use crate::payload;

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type", default = "any_type")]
    pub field_type: String,
}

static NULL: Value = Value::Null;

fn any_type() -> String {
    "any".to_string()
}

/// Column layout of a matrix preview.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<SchemaField>,
    #[serde(rename = "primaryKey", default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

/// A row-capped tabular projection of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MatrixModel {
    pub schema: TableSchema,
    #[ts(type = "Array<Record<string, unknown>>")]
    pub data: Vec<Map<String, Value>>,
}

impl MatrixModel {
    /// Parse a matrix reply and enforce the row cap.
    ///
    /// The cap is applied here as well as in the kernel script, so a model
    /// never holds more than `max_rows` rows whatever the kernel sent.
    pub fn decode(raw: &str, max_rows: usize) -> Result<Self, DecodeError> {
        let mut model: MatrixModel = payload::decode_json(raw)?;
        model.data.truncate(max_rows);
        Ok(model)
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.schema.fields.iter().map(|f| f.name.as_str())
    }

    /// Row cells in schema column order, missing cells as `Null`.
    pub fn rows(&self) -> impl Iterator<Item = Vec<&Value>> {
        self.data.iter().map(move |row| {
            self.schema
                .fields
                .iter()
                .map(|f| row.get(&f.name).unwrap_or(&NULL))
                .collect()
        })
    }
}
