//! Variable records and the update events that carry them.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::DecodeError;
use crate::payload;

/// One user-visible variable as described by the kernel-side script.
///
/// Field names on the wire are fixed by the inspection scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Variable {
    #[serde(rename = "varName")]
    pub name: String,
    #[serde(rename = "varType")]
    pub declared_type: String,
    #[serde(rename = "varSize", default)]
    pub size_estimate: String,
    #[serde(rename = "varShape", default)]
    pub shape_description: String,
    #[serde(rename = "varContent", default)]
    pub content_preview: String,
    #[serde(rename = "isMatrix", default)]
    pub is_tabular: bool,
    #[serde(rename = "isWidget", default)]
    pub is_interactive_widget: bool,
}

/// Title shown above a variable list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UpdateTitle {
    #[serde(rename = "kernelName", skip_serializing_if = "Option::is_none")]
    pub session_label: Option<String>,
    #[serde(rename = "languageName", skip_serializing_if = "Option::is_none")]
    pub language_label: Option<String>,
}

/// The latest known variable state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct UpdateEvent {
    pub title: UpdateTitle,
    pub variables: Vec<Variable>,
}

impl UpdateEvent {
    pub fn new(title: UpdateTitle, variables: Vec<Variable>) -> Self {
        Self { title, variables }
    }

    /// An event with no variables, used for lifecycle placeholders.
    pub fn placeholder(title: UpdateTitle) -> Self {
        Self {
            title,
            variables: Vec::new(),
        }
    }
}

/// A record as kernel scripts print it, before text coercion.
#[derive(Deserialize)]
struct WireVariable {
    #[serde(rename = "varName")]
    name: String,
    #[serde(rename = "varType")]
    declared_type: String,
    #[serde(rename = "varSize", default, deserialize_with = "string_or_number")]
    size_estimate: String,
    #[serde(rename = "varShape", default, deserialize_with = "string_or_number")]
    shape_description: String,
    #[serde(rename = "varContent", default, deserialize_with = "string_or_number")]
    content_preview: String,
    #[serde(rename = "isMatrix", default)]
    is_tabular: bool,
    #[serde(rename = "isWidget", default)]
    is_interactive_widget: bool,
}

impl From<WireVariable> for Variable {
    fn from(wire: WireVariable) -> Self {
        Variable {
            name: wire.name,
            declared_type: wire.declared_type,
            size_estimate: wire.size_estimate,
            shape_description: wire.shape_description,
            content_preview: wire.content_preview,
            is_tabular: wire.is_tabular,
            is_interactive_widget: wire.is_interactive_widget,
        }
    }
}

/// Parse a list-variables reply (`text/plain` of the query result).
pub fn decode_variables(raw: &str) -> Result<Vec<Variable>, DecodeError> {
    let records: Vec<WireVariable> = payload::decode_json(raw)?;
    Ok(records.into_iter().map(Variable::from).collect())
}

/// R's `jsonlite` emits sizes as numbers; the record keeps everything as text.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}
