//! Terminal rendering of variable lists and matrix previews.

use kernel_inspector::{MatrixModel, UpdateEvent, Variable, VariableView};
use serde_json::Value;
use tabled::{builder::Builder, settings::Style, Table, Tabled};

const CONTENT_WIDTH: usize = 60;

#[derive(Tabled)]
struct VariableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    declared_type: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "SHAPE")]
    shape: String,
    #[tabled(rename = "CONTENT")]
    content: String,
}

impl From<&Variable> for VariableRow {
    fn from(v: &Variable) -> Self {
        let mut name = v.name.clone();
        if v.is_tabular {
            name.push_str(" [table]");
        } else if v.is_interactive_widget {
            name.push_str(" [widget]");
        }
        VariableRow {
            name,
            declared_type: v.declared_type.clone(),
            size: or_dash(&v.size_estimate),
            shape: or_dash(&v.shape_description),
            content: truncate(&v.content_preview, CONTENT_WIDTH),
        }
    }
}

fn or_dash(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

/// Collapse to one line and cut at `max_len` characters.
pub fn truncate(text: &str, max_len: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_len {
        single_line
    } else {
        let head: String = single_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

pub fn title_line(event: &UpdateEvent) -> String {
    match (&event.title.session_label, &event.title.language_label) {
        (Some(session), Some(language)) => format!("{} ({})", session, language),
        (Some(label), None) | (None, Some(label)) => label.clone(),
        (None, None) => String::new(),
    }
}

pub fn variables_table(event: &UpdateEvent) -> String {
    if event.variables.is_empty() {
        return "No variables".to_string();
    }
    let rows: Vec<VariableRow> = event.variables.iter().map(VariableRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => truncate(s, CONTENT_WIDTH),
        other => truncate(&other.to_string(), CONTENT_WIDTH),
    }
}

pub fn matrix_table(model: &MatrixModel) -> String {
    let mut builder = Builder::default();
    builder.push_record(model.column_names().map(str::to_string));
    for row in model.rows() {
        builder.push_record(row.into_iter().map(cell_text));
    }
    builder.build().with(Style::rounded()).to_string()
}

/// Prints every update, as a table or as one JSON object per line.
pub struct TerminalView {
    pub json: bool,
}

impl VariableView for TerminalView {
    fn render(&self, event: &UpdateEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => log::error!("Failed to serialize update: {}", e),
            }
        } else {
            println!("{}", title_line(event));
            println!("{}", variables_table(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_inspector::UpdateTitle;

    fn event() -> UpdateEvent {
        let variables = serde_json::from_str(
            r#"[{"varName":"df","varType":"DataFrame","varSize":"128","varShape":"3 rows x 2 cols","varContent":"a, b","isMatrix":true,"isWidget":false},
                {"varName":"s","varType":"str","varSize":"54","varShape":"","varContent":"line one\nline two","isMatrix":false,"isWidget":false}]"#,
        )
        .unwrap();
        UpdateEvent::new(
            UpdateTitle {
                session_label: Some("analysis.ipynb".into()),
                language_label: Some("Python".into()),
            },
            variables,
        )
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(truncate("ééééééééé", 5), "éé...");
    }

    #[test]
    fn test_variables_table() {
        let table = variables_table(&event());
        assert!(table.contains("NAME"));
        assert!(table.contains("df [table]"));
        assert!(table.contains("line one line two"));
        assert_eq!(title_line(&event()), "analysis.ipynb (Python)");
    }

    #[test]
    fn test_empty_and_placeholder() {
        let placeholder = UpdateEvent::placeholder(UpdateTitle {
            session_label: Some("Restarting kernel...".into()),
            language_label: None,
        });
        assert_eq!(variables_table(&placeholder), "No variables");
        assert_eq!(title_line(&placeholder), "Restarting kernel...");
    }

    #[test]
    fn test_matrix_table() {
        let model = MatrixModel::decode(
            r#"{"schema":{"fields":[{"name":"index","type":"integer"},{"name":"city","type":"string"}]},"data":[{"index":0,"city":"Oslo"},{"index":1,"city":null}]}"#,
            10,
        )
        .unwrap();
        let table = matrix_table(&model);
        assert!(table.contains("city"));
        assert!(table.contains("Oslo"));
    }
}
