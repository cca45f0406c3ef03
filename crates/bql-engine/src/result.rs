//! Statement results

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tabular outcome of one statement, optionally with a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueryResult {
    pub fn table(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            message: None,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }

    /// Position of a column by name.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (i, col_name) in self.columns.iter().enumerate() {
                    if let Some(value) = row.get(i) {
                        obj.insert(col_name.clone(), value.clone());
                    }
                }
                Value::Object(obj)
            })
            .collect();

        json!({
            "columns": self.columns,
            "rows": rows,
            "row_count": self.row_count,
            "message": self.message,
        })
    }

    /// Plain-text rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(message) = &self.message {
            out.push_str(message);
            out.push('\n');
        }
        if self.columns.is_empty() {
            return out;
        }

        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(display_cell).collect())
            .collect();
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }

        let rule: String = widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+");
        let line = |values: &[String]| -> String {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!(" {v:<w$} "))
                .collect::<Vec<_>>()
                .join("|")
        };

        out.push_str(&line(&self.columns));
        out.push('\n');
        out.push_str(&rule);
        out.push('\n');
        for row in &cells {
            out.push_str(&line(row));
            out.push('\n');
        }
        out.push_str(&format!("({} rows)\n", self.row_count));
        out
    }
}

fn display_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(x) if n.is_f64() => {
                let rounded = format!("{x:.6}");
                rounded.trim_end_matches('0').trim_end_matches('.').to_string()
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_to_json() {
        let result = QueryResult::table(
            vec!["row_id".to_string(), "name".to_string()],
            vec![vec![json!(0), json!("Alice")], vec![json!(1), json!("Bob")]],
        );

        let json = result.to_json();

        assert_eq!(json["row_count"], 2);
        assert_eq!(json["columns"].as_array().unwrap().len(), 2);
        assert_eq!(json["rows"][1]["name"], "Bob");
        assert!(json["message"].is_null());
    }

    #[test]
    fn test_render_aligns_columns() {
        let result = QueryResult::table(
            vec!["model_id".to_string(), "iterations".to_string()],
            vec![vec![json!(0), json!(25)], vec![json!(1), json!(0.5)]],
        )
        .with_message("Models for kiva:");
        let text = result.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Models for kiva:");
        assert_eq!(lines[1], " model_id | iterations ");
        assert_eq!(lines[3], " 0        | 25         ");
        assert_eq!(lines[4], " 1        | 0.5        ");
        assert_eq!(lines[5], "(2 rows)");
    }

    #[test]
    fn test_message_only_result() {
        let result = QueryResult::message("Dropped 3 models");
        assert_eq!(result.row_count, 0);
        assert_eq!(result.render(), "Dropped 3 models\n");
    }
}
