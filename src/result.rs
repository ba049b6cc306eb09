use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Outcome of a single `execute` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResult {
    /// Standard output of a shell command (Linux, Windows)
    Text { body: String },

    /// Fully fetched result set of a SQL statement.
    ///
    /// Only MySQL reports `columns`; Oracle and SQL Server return rows only.
    Table {
        #[serde(skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Value>>,
    },
}

impl CommandResult {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn table(columns: Option<Vec<String>>, rows: Vec<Vec<Value>>) -> Self {
        Self::Table { columns, rows }
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { body } => write!(f, "{}", body.trim_end_matches(['\r', '\n'])),
            Self::Table { columns, rows } => {
                let mut lines = Vec::with_capacity(rows.len() + 1);
                if let Some(columns) = columns {
                    lines.push(columns.join("\t"));
                }
                for row in rows {
                    lines.push(row.iter().map(render_cell).collect::<Vec<_>>().join("\t"));
                }
                if rows.is_empty() {
                    lines.push("(0 rows)".to_string());
                }
                write!(f, "{}", lines.join("\n"))
            }
        }
    }
}
