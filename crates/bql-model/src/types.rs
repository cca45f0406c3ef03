//! Type system shared by the parser, the models and the engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::component::Prior;
use crate::ModelError;

/// Statistical type of a btable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Continuous,
    Multinomial,
    /// Kept in the btable but never modelled.
    Ignore,
    /// Row identifier; shown but never modelled.
    Key,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Continuous => "continuous",
            ColumnType::Multinomial => "multinomial",
            ColumnType::Ignore => "ignore",
            ColumnType::Key => "key",
        }
    }

    pub fn is_modeled(self) -> bool {
        matches!(self, ColumnType::Continuous | ColumnType::Multinomial)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "continuous" => Ok(ColumnType::Continuous),
            "multinomial" => Ok(ColumnType::Multinomial),
            "ignore" => Ok(ColumnType::Ignore),
            "key" => Ok(ColumnType::Key),
            other => Err(format!("Unknown column type: {other}")),
        }
    }
}

/// Which structure kernels a model runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModelKind {
    /// Columns partitioned into views, rows partitioned within each view.
    #[default]
    #[serde(rename = "crosscat")]
    CrossCat,
    /// A single view with a Dirichlet process mixture over rows.
    #[serde(rename = "crp_mixture")]
    CrpMixture,
    /// A single view with a single cluster.
    #[serde(rename = "naive_bayes")]
    NaiveBayes,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::CrossCat => "crosscat",
            ModelKind::CrpMixture => "crp mixture",
            ModelKind::NaiveBayes => "naive bayes",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split(|c: char| c.is_whitespace() || c == '_')
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        match normalized.as_str() {
            "crosscat" => Ok(ModelKind::CrossCat),
            "crp mixture" => Ok(ModelKind::CrpMixture),
            "naive bayes" => Ok(ModelKind::NaiveBayes),
            other => Err(format!("Unknown model config: {other}")),
        }
    }
}

/// One observed cell in model space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datum {
    Real(f64),
    /// Index into the column's category list.
    Code(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataColumn {
    Continuous(Vec<Option<f64>>),
    Multinomial {
        categories: Vec<String>,
        codes: Vec<Option<usize>>,
    },
}

impl DataColumn {
    pub fn len(&self) -> usize {
        match self {
            DataColumn::Continuous(values) => values.len(),
            DataColumn::Multinomial { codes, .. } => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, row: usize) -> Option<Datum> {
        match self {
            DataColumn::Continuous(values) => values.get(row).copied().flatten().map(Datum::Real),
            DataColumn::Multinomial { codes, .. } => codes.get(row).copied().flatten().map(Datum::Code),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            DataColumn::Continuous(_) => ColumnType::Continuous,
            DataColumn::Multinomial { .. } => ColumnType::Multinomial,
        }
    }
}

/// The modelled columns of a btable, in original column order.
#[derive(Debug, Clone)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<DataColumn>,
    priors: Vec<Prior>,
    n_rows: usize,
}

impl Dataset {
    pub fn new(names: Vec<String>, columns: Vec<DataColumn>) -> Result<Self, ModelError> {
        if names.len() != columns.len() {
            return Err(ModelError::DatasetShape(format!(
                "{} column names for {} columns",
                names.len(),
                columns.len()
            )));
        }
        let n_rows = columns.first().map(DataColumn::len).unwrap_or(0);
        if let Some((name, col)) = names.iter().zip(&columns).find(|(_, c)| c.len() != n_rows) {
            return Err(ModelError::DatasetShape(format!(
                "column {name} has {} rows, expected {n_rows}",
                col.len()
            )));
        }
        let priors = columns.iter().map(Prior::for_column).collect();
        Ok(Self { names, columns, priors, n_rows })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, col: usize) -> &DataColumn {
        &self.columns[col]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<Datum> {
        self.columns.get(col).and_then(|c| c.get(row))
    }

    pub(crate) fn prior(&self, col: usize) -> &Prior {
        &self.priors[col]
    }

    /// Map a textual value into model space for `col`.
    pub fn encode(&self, col: usize, text: &str) -> Option<Datum> {
        match self.columns.get(col)? {
            DataColumn::Continuous(_) => text.trim().parse().ok().map(Datum::Real),
            DataColumn::Multinomial { categories, .. } => {
                let text = text.trim();
                categories
                    .iter()
                    .position(|c| c == text)
                    .or_else(|| {
                        // Numeric categories written differently ("2" vs "2.0").
                        let x: f64 = text.parse().ok()?;
                        categories
                            .iter()
                            .position(|c| c.parse::<f64>().map(|y| y == x).unwrap_or(false))
                    })
                    .map(Datum::Code)
            }
        }
    }

    /// Category label for a multinomial code.
    pub fn category(&self, col: usize, code: usize) -> Option<&str> {
        match self.columns.get(col)? {
            DataColumn::Multinomial { categories, .. } => categories.get(code).map(String::as_str),
            DataColumn::Continuous(_) => None,
        }
    }

    /// Squared Pearson correlation over rows where both continuous columns are observed.
    pub fn correlation(&self, a: usize, b: usize) -> Result<f64, ModelError> {
        let (DataColumn::Continuous(xs), DataColumn::Continuous(ys)) = (&self.columns[a], &self.columns[b]) else {
            return Err(ModelError::Unsupported(format!(
                "correlation between {} and {} requires two continuous columns",
                self.names[a], self.names[b]
            )));
        };
        let pairs: Vec<(f64, f64)> = xs
            .iter()
            .zip(ys)
            .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
            .collect();
        let n = pairs.len() as f64;
        if pairs.len() < 2 {
            return Ok(0.0);
        }
        let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n;
        let my = pairs.iter().map(|p| p.1).sum::<f64>() / n;
        let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
        for (x, y) in &pairs {
            sxy += (x - mx) * (y - my);
            sxx += (x - mx).powi(2);
            syy += (y - my).powi(2);
        }
        if sxx <= 0.0 || syy <= 0.0 {
            return Ok(0.0);
        }
        Ok(sxy * sxy / (sxx * syy))
    }
}
