//! Small rectangular row container used for probe results and alarm
//! payloads: named columns, row cap on display, plain-text and HTML
//! rendering.

use std::sync::Arc;

use crate::expr::Value;

/// A rectangular value with named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Record> {
        let fields = Arc::new(self.columns.clone());
        self.rows.get(index).map(|values| Record {
            fields,
            values: values.clone(),
        })
    }

    pub fn records(&self) -> Vec<Record> {
        let fields = Arc::new(self.columns.clone());
        self.rows
            .iter()
            .map(|values| Record {
                fields: Arc::clone(&fields),
                values: values.clone(),
            })
            .collect()
    }

    /// Render as aligned plain text, showing at most `max_rows` rows with an
    /// overflow indicator.
    pub fn to_text(&self, max_rows: usize) -> String {
        if self.columns.is_empty() && self.rows.is_empty() {
            return "(empty)".to_string();
        }

        let shown = self.rows.len().min(max_rows);
        let mut cells: Vec<Vec<String>> = Vec::with_capacity(shown + 1);
        cells.push(self.columns.clone());
        for row in &self.rows[..shown] {
            cells.push(row.iter().map(display_cell).collect());
        }

        let ncols = cells.iter().map(Vec::len).max().unwrap_or(0);
        let mut widths = vec![0usize; ncols];
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let mut out = String::new();
        for row in &cells {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    line.push_str("  ");
                }
                line.push_str(cell);
                if i + 1 < row.len() {
                    for _ in cell.chars().count()..widths[i] {
                        line.push(' ');
                    }
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("... ({} rows total)\n", self.rows.len()));
        }
        out.pop();
        out
    }

    /// Render as an HTML table.
    pub fn to_html(&self) -> String {
        let mut out = String::from("<table border=\"1\">\n<thead><tr>");
        for col in &self.columns {
            out.push_str("<th>");
            out.push_str(&escape_html(col));
            out.push_str("</th>");
        }
        out.push_str("</tr></thead>\n<tbody>\n");
        for row in &self.rows {
            out.push_str("<tr>");
            for cell in row {
                out.push_str("<td>");
                out.push_str(&escape_html(&display_cell(cell)));
                out.push_str("</td>");
            }
            out.push_str("</tr>\n");
        }
        out.push_str("</tbody>\n</table>");
        out
    }
}

/// One row with named fields, produced by indexing a [`Table`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: Arc<Vec<String>>,
    pub values: Vec<Value>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .position(|f| f == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn display_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Table {
        let rows = (0..n)
            .map(|i| vec![Value::Str(format!("2024-06-{:02}", i + 1)), Value::Int(i as i64)])
            .collect();
        Table::new(vec!["date".into(), "cnt".into()], rows)
    }

    #[test]
    fn text_render_caps_rows() {
        let text = sample(25).to_text(10);
        assert!(text.contains("... (25 rows total)"));
        assert_eq!(text.lines().count(), 12); // header + 10 rows + overflow
    }

    #[test]
    fn text_render_small_table_has_no_overflow() {
        let text = sample(3).to_text(10);
        assert!(!text.contains("rows total"));
        assert!(text.starts_with("date"));
    }

    #[test]
    fn html_render_escapes_cells() {
        let table = Table::new(
            vec!["v".into()],
            vec![vec![Value::Str("<script>".into())]],
        );
        let html = table.to_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.starts_with("<table"));
    }

    #[test]
    fn record_field_lookup() {
        let table = sample(2);
        let rec = table.row(1).unwrap();
        assert_eq!(rec.get("cnt"), Some(&Value::Int(1)));
        assert!(rec.get("missing").is_none());
    }
}
