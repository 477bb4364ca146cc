//! Output rendering for the operator CLI.

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
    Yaml,
    Count,
}

/// Tabular projection of a result for the table/csv/count formats.
pub struct Rows {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Rows {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }
}

/// Render a result in the requested format. `value` feeds the structured
/// formats, `rows` the tabular ones.
pub fn render<T: Serialize>(format: OutputFormat, value: &T, rows: &Rows) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        OutputFormat::Count => Ok(rows.rows.len().to_string()),
        OutputFormat::Csv => Ok(render_csv(rows)),
        OutputFormat::Table => Ok(render_table(rows)),
    }
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_csv(rows: &Rows) -> String {
    let mut out = String::new();
    out.push_str(
        &rows
            .headers
            .iter()
            .map(|h| csv_field(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');
    for row in &rows.rows {
        out.push_str(
            &row.iter()
                .map(|field| csv_field(field))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

fn render_table(rows: &Rows) -> String {
    let mut widths: Vec<usize> = rows.headers.iter().map(|h| h.len()).collect();
    for row in &rows.rows {
        for (i, field) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(field.len());
            }
        }
    }

    let mut out = String::new();
    let format_row = |fields: &[String], widths: &[usize]| -> String {
        fields
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{:<width$}", field, width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    out.push_str(&format_row(&rows.headers, &widths));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    out.push('\n');
    for row in &rows.rows {
        out.push_str(&format_row(row, &widths));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Rows {
        let mut rows = Rows::new(&["id", "name"]);
        rows.push(vec!["1".to_string(), "alpha".to_string()]);
        rows.push(vec!["2".to_string(), "beta, with comma".to_string()]);
        rows
    }

    #[test]
    fn count_renders_row_count() {
        let out = render(OutputFormat::Count, &(), &sample()).unwrap();
        assert_eq!(out, "2");
    }

    #[test]
    fn csv_escapes_commas() {
        let out = render(OutputFormat::Csv, &(), &sample()).unwrap();
        assert!(out.contains("\"beta, with comma\""));
        assert!(out.starts_with("id,name\n"));
    }

    #[test]
    fn csv_escapes_quotes() {
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn table_aligns_columns() {
        let out = render(OutputFormat::Table, &(), &sample()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("id"));
        assert!(lines[1].starts_with("--"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn json_uses_value_not_rows() {
        #[derive(Serialize)]
        struct Payload {
            total: u32,
        }
        let out = render(OutputFormat::Json, &Payload { total: 7 }, &sample()).unwrap();
        assert!(out.contains("\"total\": 7"));
    }
}
