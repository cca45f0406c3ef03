//! Expression evaluation: plain columns and model-backed functions
//!
//! Row functions (`SIMILARITY TO`, `TYPICALITY`, `PREDICTIVE PROBABILITY OF`,
//! `PROBABILITY OF`) are evaluated per row. Column functions (`TYPICALITY`,
//! `DEPENDENCE PROBABILITY WITH`, `CORRELATION WITH`) are evaluated per
//! modelled column in ESTIMATE COLUMNS.

use std::borrow::Cow;
use std::cmp::Ordering;

use bql_ast::{CmpOp, Expr, RowRef, SimilarityTo, Value};
use bql_model::{ColumnType, Dataset, Datum, Ensemble, LatentState, ModelError};
use serde_json::Value as JsonValue;

use crate::btable::Btable;
use crate::error::EngineError;

pub const ROW_ID: &str = "row_id";

pub(crate) fn json_f64(x: f64) -> JsonValue {
    serde_json::Number::from_f64(x)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Everything an expression can read while one statement runs.
pub(crate) struct Scope<'a> {
    pub btable: &'a Btable,
    pub data: Option<&'a Dataset>,
    /// Dataset column for each btable column, if modelled.
    model_index: Vec<Option<usize>>,
    ensemble: Option<Ensemble<'a>>,
}

impl<'a> Scope<'a> {
    pub fn new(btable: &'a Btable, data: Option<&'a Dataset>, states: &'a [LatentState]) -> Result<Self, EngineError> {
        let mut model_index = vec![None; btable.columns.len()];
        for (d, b) in btable.modeled_columns().into_iter().enumerate() {
            model_index[b] = Some(d);
        }
        let ensemble = match data {
            Some(data) if !states.is_empty() => Some(Ensemble::new(data, states)?),
            _ => None,
        };
        Ok(Self {
            btable,
            data,
            model_index,
            ensemble,
        })
    }

    pub fn ensemble(&self) -> Result<&Ensemble<'a>, EngineError> {
        self.ensemble
            .as_ref()
            .ok_or_else(|| EngineError::NoModels(self.btable.name.clone()))
    }

    pub fn dataset(&self) -> Result<&'a Dataset, EngineError> {
        self.data
            .ok_or_else(|| EngineError::NoModeledColumns(self.btable.name.clone()))
    }

    /// Dataset index of a modelled column.
    pub fn modeled_index(&self, name: &str) -> Result<usize, EngineError> {
        let idx = self.btable.column_index(name)?;
        self.model_index[idx].ok_or_else(|| EngineError::NotModeled {
            column: name.to_string(),
            ctype: self.btable.columns[idx].ctype,
        })
    }

    pub fn modeled_names(&self) -> Vec<String> {
        self.btable
            .modeled_columns()
            .into_iter()
            .map(|i| self.btable.columns[i].name.clone())
            .collect()
    }

    fn resolve_row(&self, row: &RowRef) -> Result<usize, EngineError> {
        match row {
            RowRef::Id(id) if *id < self.btable.n_rows() => Ok(*id),
            RowRef::Id(id) => Err(EngineError::RowNotFound(id.to_string())),
            RowRef::Matching { column, value } => {
                let col = self.btable.column_index(column)?;
                (0..self.btable.n_rows())
                    .find(|r| {
                        self.btable
                            .cell(*r, col)
                            .is_some_and(|cell| compare_text(cell, value) == Some(Ordering::Equal))
                    })
                    .ok_or_else(|| EngineError::RowNotFound(format!("{column} = {value}")))
            }
        }
    }

    fn similarity(&self, sim: &SimilarityTo, row: usize) -> Result<f64, EngineError> {
        let target = self.resolve_row(&sim.row)?;
        let column = sim
            .respect_to
            .as_deref()
            .map(|c| self.modeled_index(c))
            .transpose()?;
        Ok(self.ensemble()?.similarity(row, target, column))
    }

    /// Decode a model-space value into its JSON cell form.
    pub fn decode(&self, col: usize, datum: Datum) -> JsonValue {
        match datum {
            Datum::Real(x) => json_f64(x),
            Datum::Code(code) => self
                .data
                .and_then(|d| d.category(col, code))
                .map(|c| JsonValue::String(c.to_string()))
                .unwrap_or(JsonValue::Null),
        }
    }

    /// Evaluate `expr` for one row.
    pub fn eval_row(&self, expr: &Expr, row: usize) -> Result<JsonValue, EngineError> {
        match expr {
            Expr::Column(name) if name == ROW_ID => Ok(JsonValue::from(row)),
            Expr::Column(name) => {
                let col = self.btable.column_index(name)?;
                Ok(self.btable.cell_json(row, col))
            }
            Expr::Similarity(sim) => Ok(json_f64(self.similarity(sim, row)?)),
            Expr::Typicality => Ok(json_f64(self.ensemble()?.row_typicality(row))),
            Expr::PredictiveProbability { column } => {
                let col = self.modeled_index(column)?;
                let ensemble = self.ensemble()?;
                Ok(match self.dataset()?.get(row, col) {
                    Some(datum) => json_f64(ensemble.predictive_probability(row, col, datum)),
                    None => JsonValue::Null,
                })
            }
            Expr::Probability { column, value } => {
                let col = self.modeled_index(column)?;
                let ensemble = self.ensemble()?;
                let data = self.dataset()?;
                match data.encode(col, &value.as_text()) {
                    Some(datum) => Ok(json_f64(ensemble.predictive_probability(row, col, datum))),
                    // Categories never observed have no support.
                    None if data.column(col).column_type() == ColumnType::Multinomial => Ok(json_f64(0.0)),
                    None => Err(EngineError::InvalidQuery(format!(
                        "{value} is not a number for continuous column {column}"
                    ))),
                }
            }
            Expr::DependenceProbability { .. } | Expr::Correlation { .. } => Err(EngineError::InvalidQuery(format!(
                "{expr} is a column function, use it in ESTIMATE COLUMNS"
            ))),
            Expr::Wildcard => Err(EngineError::InvalidQuery("* is only valid in a select list".into())),
        }
    }

    /// Evaluate a column function for dataset column `col`.
    pub fn eval_column(&self, expr: &Expr, col: usize) -> Result<JsonValue, EngineError> {
        match expr {
            Expr::Typicality => Ok(json_f64(self.ensemble()?.column_typicality(col))),
            Expr::DependenceProbability { column } => {
                let other = self.modeled_index(column)?;
                Ok(json_f64(self.ensemble()?.dependence_probability(col, other)))
            }
            Expr::Correlation { column } => {
                let other = self.modeled_index(column)?;
                match self.dataset()?.correlation(col, other) {
                    Ok(r2) => Ok(json_f64(r2)),
                    Err(ModelError::Unsupported(_)) => Ok(JsonValue::Null),
                    Err(e) => Err(e.into()),
                }
            }
            other => Err(EngineError::InvalidQuery(format!(
                "{other} cannot be estimated for a column"
            ))),
        }
    }
}

/// Compare stored text against a literal, numerically when both are numbers.
fn compare_text(cell: &str, literal: &Value) -> Option<Ordering> {
    match (cell.trim().parse::<f64>(), literal.as_f64()) {
        (Ok(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(cell.cmp(literal.as_text().as_str())),
    }
}

/// Whether an evaluated value satisfies `op literal`. Missing values never do.
pub(crate) fn satisfies(value: &JsonValue, op: CmpOp, literal: &Value) -> Result<bool, EngineError> {
    let ordering = match value {
        JsonValue::Null => return Ok(false),
        JsonValue::Number(n) => {
            let a = n.as_f64().unwrap_or(f64::NAN);
            let b = literal.as_f64().ok_or_else(|| {
                EngineError::InvalidQuery(format!("cannot compare a number with {literal}"))
            })?;
            a.partial_cmp(&b)
        }
        JsonValue::String(s) => compare_text(s, literal),
        other => compare_text(&other.to_string(), literal),
    };
    Ok(ordering.is_some_and(|o| op.holds(o)))
}

fn sort_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

fn sort_text(value: &JsonValue) -> Cow<'_, str> {
    match value {
        JsonValue::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    }
}

/// Ordering of two evaluated values: numbers and numeric text first in
/// numeric order, then other text in lexical order. Missing values sort
/// last in either direction.
pub(crate) fn sort_order(a: &JsonValue, b: &JsonValue, descending: bool) -> Ordering {
    let ord = match (a, b) {
        (JsonValue::Null, JsonValue::Null) => return Ordering::Equal,
        (JsonValue::Null, _) => return Ordering::Greater,
        (_, JsonValue::Null) => return Ordering::Less,
        _ => match (sort_number(a), sort_number(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => sort_text(a).cmp(&sort_text(b)),
        },
    };
    if descending {
        ord.reverse()
    } else {
        ord
    }
}
