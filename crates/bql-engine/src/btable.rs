//! Btables: a CSV-backed table, its schema, and its models

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use bql_model::{ColumnType, DataColumn, Dataset, LatentState, ModelKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::EngineError;

/// Cell spellings read as missing.
const MISSING: [&str; 5] = ["", "NA", "NaN", "nan", "None"];

/// Numeric columns need more distinct values than this to be continuous.
const CONTINUOUS_MIN_DISTINCT: usize = 20;
const CONTINUOUS_MIN_RATIO: f64 = 0.02;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub ctype: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub state: LatentState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Btable {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Raw cell text by row; `None` is missing.
    pub rows: Vec<Vec<Option<String>>>,
    #[serde(default)]
    pub models: BTreeMap<usize, ModelRecord>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub column_lists: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
}

fn is_missing(cell: &str) -> bool {
    MISSING.contains(&cell)
}

fn is_numeric(cell: &str) -> bool {
    cell.parse::<f64>().map(|x| x.is_finite()).unwrap_or(false)
}

/// Guess a column type from its observed values.
pub fn guess_type(values: &[Option<String>]) -> ColumnType {
    let observed: Vec<&str> = values.iter().flatten().map(String::as_str).collect();
    if observed.is_empty() {
        return ColumnType::Ignore;
    }
    let distinct: HashSet<&str> = observed.iter().copied().collect();
    if observed.iter().all(|v| is_numeric(v)) {
        let ratio = distinct.len() as f64 / observed.len() as f64;
        if distinct.len() > CONTINUOUS_MIN_DISTINCT && ratio > CONTINUOUS_MIN_RATIO {
            ColumnType::Continuous
        } else {
            ColumnType::Multinomial
        }
    } else if distinct.len() == values.len() && values.len() > 1 {
        ColumnType::Key
    } else {
        ColumnType::Multinomial
    }
}

impl Btable {
    /// Read a CSV file with a header row and guess every column's type.
    pub fn from_csv(name: &str, path: &Path) -> Result<Self, EngineError> {
        let file = std::fs::File::open(path).map_err(|e| EngineError::file(path, e))?;
        let csv_error = |source| EngineError::Csv {
            path: path.display().to_string(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        let mut seen = HashSet::new();
        if let Some(dup) = headers.iter().find(|h| !seen.insert(h.as_str())) {
            return Err(EngineError::InvalidQuery(format!("duplicate column {dup} in {}", path.display())));
        }

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            if record.len() != headers.len() {
                warn!(
                    file = %path.display(),
                    line = line + 2,
                    fields = record.len(),
                    expected = headers.len(),
                    "Skipping malformed CSV row"
                );
                continue;
            }
            rows.push(
                record
                    .iter()
                    .map(|cell| (!is_missing(cell)).then(|| cell.to_string()))
                    .collect::<Vec<_>>(),
            );
        }

        let columns = headers
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let values: Vec<Option<String>> = rows.iter().map(|r| r[i].clone()).collect();
                ColumnMeta {
                    ctype: guess_type(&values),
                    name,
                }
            })
            .collect();

        debug!(btable = name, rows = rows.len(), "Read CSV");
        Ok(Self {
            name: name.to_string(),
            columns,
            rows,
            models: BTreeMap::new(),
            labels: BTreeMap::new(),
            metadata: BTreeMap::new(),
            column_lists: BTreeMap::new(),
            created_at: Utc::now(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, EngineError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| EngineError::ColumnNotFound {
                btable: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Btable indices of the modelled columns, in order.
    pub fn modeled_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|i| self.columns[*i].ctype.is_modeled())
            .collect()
    }

    /// Change a column's type, checking that its values allow it.
    pub fn set_type(&mut self, column: &str, ctype: ColumnType) -> Result<(), EngineError> {
        let idx = self.column_index(column)?;
        if ctype == ColumnType::Continuous {
            if let Some(bad) = self.rows.iter().filter_map(|r| r[idx].as_deref()).find(|v| !is_numeric(v)) {
                return Err(EngineError::InvalidType {
                    column: column.to_string(),
                    ctype,
                    reason: format!("value {bad:?} is not numeric"),
                });
            }
        }
        self.columns[idx].ctype = ctype;
        Ok(())
    }

    /// Modelled columns encoded for the models.
    pub fn dataset(&self) -> Result<Dataset, EngineError> {
        let modeled = self.modeled_columns();
        if modeled.is_empty() {
            return Err(EngineError::NoModeledColumns(self.name.clone()));
        }
        let names = modeled.iter().map(|i| self.columns[*i].name.clone()).collect();
        let columns = modeled
            .iter()
            .map(|i| {
                let cells = self.rows.iter().map(|r| r[*i].as_deref());
                match self.columns[*i].ctype {
                    ColumnType::Continuous => {
                        DataColumn::Continuous(cells.map(|c| c.and_then(|v| v.parse().ok())).collect())
                    }
                    _ => {
                        let categories: Vec<String> = cells
                            .clone()
                            .flatten()
                            .map(str::to_string)
                            .collect::<BTreeSet<_>>()
                            .into_iter()
                            .collect();
                        let codes = cells
                            .map(|c| c.and_then(|v| categories.iter().position(|k| k == v)))
                            .collect();
                        DataColumn::Multinomial { categories, codes }
                    }
                }
            })
            .collect();
        Ok(Dataset::new(names, columns)?)
    }

    /// SHA-256 over everything a model depends on: modelled column names,
    /// types, categories and the row count.
    pub fn fingerprint(&self) -> Result<String, EngineError> {
        let data = self.dataset()?;
        let mut hasher = Sha256::new();
        hasher.update(data.n_rows().to_le_bytes());
        for (i, name) in data.names().iter().enumerate() {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(data.column(i).column_type().as_str().as_bytes());
            if let DataColumn::Multinomial { categories, .. } = data.column(i) {
                for category in categories {
                    hasher.update([1u8]);
                    hasher.update(category.as_bytes());
                }
            }
            hasher.update([2u8]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Config shared by all current models.
    pub fn model_kind(&self) -> Option<ModelKind> {
        self.models.values().next().map(|m| m.state.kind)
    }

    pub fn next_model_id(&self) -> usize {
        self.models.keys().next_back().map(|id| id + 1).unwrap_or(0)
    }

    /// JSON form of a stored cell: numbers for continuous columns, text otherwise.
    pub fn cell_json(&self, row: usize, col: usize) -> JsonValue {
        match self.cell(row, col) {
            None => JsonValue::Null,
            Some(text) => match self.columns[col].ctype {
                ColumnType::Continuous => text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
                _ => JsonValue::String(text.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn strings(values: &[&str]) -> Vec<Option<String>> {
        values
            .iter()
            .map(|v| (!is_missing(v)).then(|| v.to_string()))
            .collect()
    }

    #[test]
    fn test_guess_type_rules() {
        let many: Vec<String> = (0..30).map(|i| format!("{}.5", i)).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        assert_eq!(guess_type(&strings(&many)), ColumnType::Continuous);
        assert_eq!(guess_type(&strings(&["1", "2", "2", "1"])), ColumnType::Multinomial);
        assert_eq!(guess_type(&strings(&["a", "b", "c"])), ColumnType::Key);
        assert_eq!(guess_type(&strings(&["a", "b", "a"])), ColumnType::Multinomial);
        assert_eq!(guess_type(&strings(&["", "NA"])), ColumnType::Ignore);
    }

    #[test]
    fn test_from_csv_normalises_headers_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, " Name ,Score,Grade").unwrap();
        writeln!(file, "ann,1.5,A").unwrap();
        writeln!(file, "bob,NA,B").unwrap();
        writeln!(file, "cat,2.5").unwrap();
        writeln!(file, "dan,None,A").unwrap();
        drop(file);

        let btable = Btable::from_csv("t", &path).unwrap();
        let names: Vec<&str> = btable.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["name", "score", "grade"]);
        assert_eq!(btable.n_rows(), 3);
        assert_eq!(btable.cell(1, 1), None);
        assert_eq!(btable.columns[0].ctype, ColumnType::Key);
        assert_eq!(btable.columns[2].ctype, ColumnType::Multinomial);
    }

    #[test]
    fn test_set_type_rejects_text_as_continuous() {
        let mut btable = Btable {
            name: "t".into(),
            columns: vec![ColumnMeta { name: "c".into(), ctype: ColumnType::Multinomial }],
            rows: vec![vec![Some("x".into())], vec![Some("1".into())]],
            models: BTreeMap::new(),
            labels: BTreeMap::new(),
            metadata: BTreeMap::new(),
            column_lists: BTreeMap::new(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            btable.set_type("c", ColumnType::Continuous),
            Err(EngineError::InvalidType { .. })
        ));
        btable.set_type("c", ColumnType::Ignore).unwrap();
        assert!(matches!(btable.dataset(), Err(EngineError::NoModeledColumns(_))));
    }

    #[test]
    fn test_fingerprint_tracks_schema() {
        let mut btable = Btable {
            name: "t".into(),
            columns: vec![
                ColumnMeta { name: "a".into(), ctype: ColumnType::Multinomial },
                ColumnMeta { name: "b".into(), ctype: ColumnType::Multinomial },
            ],
            rows: vec![vec![Some("1".into()), Some("x".into())], vec![Some("2".into()), None]],
            models: BTreeMap::new(),
            labels: BTreeMap::new(),
            metadata: BTreeMap::new(),
            column_lists: BTreeMap::new(),
            created_at: Utc::now(),
        };
        let before = btable.fingerprint().unwrap();
        assert_eq!(before, btable.fingerprint().unwrap());
        btable.set_type("a", ColumnType::Continuous).unwrap();
        assert_ne!(before, btable.fingerprint().unwrap());
    }
}
