//! In-memory tabular dataset loaded from CSV.
//!
//! Every cell is kept as its original string; typed views
//! ([`Dataset::numeric_column`], [`Dataset::is_numeric`]) are computed on
//! demand. Rows shorter than the header are padded with empty cells so
//! that every row has exactly `columns.len()` values.

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, Trim};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;

/// A CSV file held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Reads a CSV file with a header row.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Reads CSV data with a header row from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::Headers)
            .from_reader(reader);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.is_empty() {
            bail!("CSV has no header row");
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Failed to parse CSV row {}", index + 1))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(columns.len(), String::new());
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow::anyhow!("column '{}' not found", name))
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(col)).map(String::as_str)
    }

    /// Looks a cell up by column name; `None` when the column is absent.
    pub fn value(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == name)?;
        self.get(row, col)
    }

    /// A copy holding only the first `n` rows.
    pub fn head(&self, n: usize) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Trims and lowercases every column name.
    pub fn normalize_columns(&mut self) {
        for column in &mut self.columns {
            *column = column.trim().to_lowercase();
        }
    }

    /// Parses a column as floats. Empty or unparsable cells become `None`.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let col = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| parse_number(&row[col])).collect())
    }

    /// True when every non-empty cell of `col` parses as a number and at
    /// least one cell is non-empty.
    pub fn is_numeric(&self, col: usize) -> bool {
        let mut seen = false;
        for row in &self.rows {
            let cell = row[col].trim();
            if cell.is_empty() {
                continue;
            }
            if parse_number(cell).is_none() {
                return false;
            }
            seen = true;
        }
        seen
    }

    /// One row as a JSON object keyed by column name.
    pub fn record(&self, row: usize) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(values) = self.rows.get(row) {
            for (column, value) in self.columns.iter().zip(values) {
                map.insert(column.clone(), Value::String(value.clone()));
            }
        }
        map
    }

    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        (0..self.rows.len()).map(|i| self.record(i)).collect()
    }

    /// Renders the given rows as a fixed-width text table, prefixed by the
    /// row index. Used to hand retrieved rows to a language model.
    pub fn render_table(&self, rows: &[usize]) -> String {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for &r in rows {
            if let Some(values) = self.rows.get(r) {
                for (w, v) in widths.iter_mut().zip(values) {
                    *w = (*w).max(v.chars().count());
                }
            }
        }
        let index_width = rows
            .iter()
            .map(|r| r.to_string().len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        out.push_str(&" ".repeat(index_width));
        for (column, w) in self.columns.iter().zip(&widths) {
            out.push_str(&format!("  {:>width$}", column, width = w));
        }
        for &r in rows {
            let Some(values) = self.rows.get(r) else {
                continue;
            };
            out.push('\n');
            out.push_str(&format!("{:<width$}", r, width = index_width));
            for (v, w) in values.iter().zip(&widths) {
                out.push_str(&format!("  {:>width$}", v, width = w));
            }
        }
        out
    }
}

/// Parses a cell as `f64`, accepting surrounding whitespace. NaN and
/// infinities are rejected.
pub fn parse_number(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOWS: &str = "Stime,Dload,proto\n\
        1421927414,100.5,tcp\n\
        1421927420,,udp\n\
        1421927480,300,tcp\n";

    #[test]
    fn test_shape_and_columns() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        assert_eq!(ds.shape(), (3, 3));
        assert_eq!(ds.columns, vec!["Stime", "Dload", "proto"]);
    }

    #[test]
    fn test_short_rows_padded() {
        let ds = Dataset::from_reader("a,b,c\n1,2\n".as_bytes()).unwrap();
        assert_eq!(ds.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn test_numeric_column_with_gaps() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        let values = ds.numeric_column("Dload").unwrap();
        assert_eq!(values, vec![Some(100.5), None, Some(300.0)]);
    }

    #[test]
    fn test_unknown_column() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        let err = ds.numeric_column("Sload").unwrap_err();
        assert!(err.to_string().contains("column 'Sload' not found"));
    }

    #[test]
    fn test_is_numeric() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        assert!(ds.is_numeric(0));
        assert!(ds.is_numeric(1));
        assert!(!ds.is_numeric(2));
    }

    #[test]
    fn test_all_empty_column_is_not_numeric() {
        let ds = Dataset::from_reader("a,b\n1,\n2,\n".as_bytes()).unwrap();
        assert!(!ds.is_numeric(1));
    }

    #[test]
    fn test_normalize_columns() {
        let mut ds = Dataset::from_reader(" SrcIP ,Proto\n1.2.3.4,tcp\n".as_bytes()).unwrap();
        ds.normalize_columns();
        assert_eq!(ds.columns, vec!["srcip", "proto"]);
        assert_eq!(ds.value(0, "srcip"), Some("1.2.3.4"));
    }

    #[test]
    fn test_head() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        assert_eq!(ds.head(2).shape(), (2, 3));
        assert_eq!(ds.head(10).shape(), (3, 3));
    }

    #[test]
    fn test_record() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        let rec = ds.record(0);
        assert_eq!(rec["proto"], Value::String("tcp".into()));
        assert_eq!(rec.len(), 3);
    }

    #[test]
    fn test_render_table_contains_rows() {
        let ds = Dataset::from_reader(FLOWS.as_bytes()).unwrap();
        let table = ds.render_table(&[2, 0]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Dload"));
        assert!(lines[1].starts_with('2'));
        assert!(lines[1].contains("300"));
        assert!(lines[2].contains("100.5"));
    }

    #[test]
    fn test_parse_number_rejects_nan() {
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number(" 4.5 "), Some(4.5));
        assert_eq!(parse_number("-"), None);
    }
}
