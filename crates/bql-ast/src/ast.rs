//! AST types for BQL
//!
//! One variant per statement form, closely following the Pest grammar.
//! Identifiers are stored lower-cased; literal text keeps its case.

use std::fmt;

use bql_model::{ColumnType, ModelKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    ListBtables,
    CreateBtable { btable: String, path: String },
    DropBtable { btable: String },
    ShowSchema { btable: String },
    UpdateSchema { btable: String, mappings: Vec<(String, ColumnType)> },
    LoadModels { path: String, btable: String },
    SaveModels { btable: String, path: String },
    InitializeModels { btable: String, count: usize, kind: Option<ModelKind> },
    Analyze { btable: String, models: Option<Vec<ModelRange>>, budget: Option<AnalyzeBudget> },
    ShowModels { btable: String },
    ShowDiagnostics { btable: String },
    DropModels { btable: String, models: Option<Vec<ModelRange>> },
    ShowColumns { btable: String, list: Option<String> },
    ShowColumnLists { btable: String },
    LabelColumns { btable: String, labels: Vec<(String, String)> },
    ShowLabels { btable: String, columns: Option<Vec<String>> },
    UpdateMetadata { btable: String, entries: Vec<(String, String)> },
    ShowMetadata { btable: String, keys: Option<Vec<String>> },
    Select(SelectQuery),
    Infer(InferQuery),
    Simulate(SimulateQuery),
    EstimateColumns(EstimateColumnsQuery),
}

impl Statement {
    /// Btable the statement operates on, if any.
    pub fn btable(&self) -> Option<&str> {
        match self {
            Statement::ListBtables => None,
            Statement::CreateBtable { btable, .. }
            | Statement::DropBtable { btable }
            | Statement::ShowSchema { btable }
            | Statement::UpdateSchema { btable, .. }
            | Statement::LoadModels { btable, .. }
            | Statement::SaveModels { btable, .. }
            | Statement::InitializeModels { btable, .. }
            | Statement::Analyze { btable, .. }
            | Statement::ShowModels { btable }
            | Statement::ShowDiagnostics { btable }
            | Statement::DropModels { btable, .. }
            | Statement::ShowColumns { btable, .. }
            | Statement::ShowColumnLists { btable }
            | Statement::LabelColumns { btable, .. }
            | Statement::ShowLabels { btable, .. }
            | Statement::UpdateMetadata { btable, .. }
            | Statement::ShowMetadata { btable, .. } => Some(btable),
            Statement::Select(q) => Some(&q.btable),
            Statement::Infer(q) => Some(&q.btable),
            Statement::Simulate(q) => Some(&q.btable),
            Statement::EstimateColumns(q) => Some(&q.btable),
        }
    }

    /// Short statement name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::ListBtables => "list_btables",
            Statement::CreateBtable { .. } => "create_btable",
            Statement::DropBtable { .. } => "drop_btable",
            Statement::ShowSchema { .. } => "show_schema",
            Statement::UpdateSchema { .. } => "update_schema",
            Statement::LoadModels { .. } => "load_models",
            Statement::SaveModels { .. } => "save_models",
            Statement::InitializeModels { .. } => "initialize_models",
            Statement::Analyze { .. } => "analyze",
            Statement::ShowModels { .. } => "show_models",
            Statement::ShowDiagnostics { .. } => "show_diagnostics",
            Statement::DropModels { .. } => "drop_models",
            Statement::ShowColumns { .. } => "show_columns",
            Statement::ShowColumnLists { .. } => "show_column_lists",
            Statement::LabelColumns { .. } => "label_columns",
            Statement::ShowLabels { .. } => "show_labels",
            Statement::UpdateMetadata { .. } => "update_metadata",
            Statement::ShowMetadata { .. } => "show_metadata",
            Statement::Select(_) => "select",
            Statement::Infer(_) => "infer",
            Statement::Simulate(_) => "simulate",
            Statement::EstimateColumns(_) => "estimate_columns",
        }
    }
}

/// Inclusive range of model ids; a single id has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRange {
    pub start: usize,
    pub end: usize,
}

impl ModelRange {
    pub fn contains(&self, id: usize) -> bool {
        (self.start..=self.end).contains(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalyzeBudget {
    Iterations(usize),
    Seconds(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub btable: String,
    /// `USING MODELS`; all models when absent.
    pub models: Option<Vec<ModelRange>>,
    pub exprs: Vec<Expr>,
    pub similar_to: Option<SimilarityTo>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferQuery {
    pub btable: String,
    /// `USING MODELS`; all models when absent.
    pub models: Option<Vec<ModelRange>>,
    pub exprs: Vec<Expr>,
    pub conditions: Vec<Condition>,
    pub confidence: f64,
    pub samples: Option<usize>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulateQuery {
    pub btable: String,
    /// `USING MODELS`; all models when absent.
    pub models: Option<Vec<ModelRange>>,
    pub exprs: Vec<Expr>,
    pub givens: Vec<(String, Value)>,
    pub times: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateColumnsQuery {
    pub btable: String,
    /// `USING MODELS`; all models when absent.
    pub models: Option<Vec<ModelRange>>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Wildcard,
    /// A column, `row_id`, or a saved column list name.
    Column(String),
    Similarity(SimilarityTo),
    Typicality,
    PredictiveProbability { column: String },
    Probability { column: String, value: Value },
    DependenceProbability { column: String },
    Correlation { column: String },
}

impl Expr {
    /// True for expressions whose value comes from the models.
    pub fn is_probabilistic(&self) -> bool {
        !matches!(self, Expr::Wildcard | Expr::Column(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTo {
    pub row: RowRef,
    pub respect_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowRef {
    Id(usize),
    /// First row whose `column` equals `value`.
    Matching { column: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub expr: Expr,
    pub op: CmpOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    /// `None` when no direction was written.
    pub desc: Option<bool>,
}

impl SortKey {
    /// Probabilistic functions sort descending unless told otherwise.
    pub fn is_descending(&self) -> bool {
        self.desc.unwrap_or_else(|| self.expr.is_probabilistic())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    /// Text form used when matching against raw cell values.
    pub fn as_text(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical rendering. Output re-parses to an equal statement.

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Id(id) => write!(f, "{id}"),
            RowRef::Matching { column, value } => write!(f, "({column} = {value})"),
        }
    }
}

impl fmt::Display for SimilarityTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIMILARITY TO {}", self.row)?;
        if let Some(column) = &self.respect_to {
            write!(f, " WITH RESPECT TO {column}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Wildcard => f.write_str("*"),
            Expr::Column(name) => f.write_str(name),
            Expr::Similarity(sim) => write!(f, "{sim}"),
            Expr::Typicality => f.write_str("TYPICALITY"),
            Expr::PredictiveProbability { column } => write!(f, "PREDICTIVE PROBABILITY OF {column}"),
            Expr::Probability { column, value } => write!(f, "PROBABILITY OF {column} = {value}"),
            Expr::DependenceProbability { column } => write!(f, "DEPENDENCE PROBABILITY WITH {column}"),
            Expr::Correlation { column } => write!(f, "CORRELATION WITH {column}"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.expr, self.op, self.value)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        match self.desc {
            Some(true) => f.write_str(" DESC"),
            Some(false) => f.write_str(" ASC"),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ModelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

fn write_tail(
    f: &mut fmt::Formatter<'_>,
    conditions: &[Condition],
    order_by: &[SortKey],
    limit: Option<usize>,
) -> fmt::Result {
    if !conditions.is_empty() {
        let conds: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
        write!(f, " WHERE {}", conds.join(" AND "))?;
    }
    if !order_by.is_empty() {
        write!(f, " ORDER BY {}", join(order_by))?;
    }
    if let Some(limit) = limit {
        write!(f, " LIMIT {limit}")?;
    }
    Ok(())
}

fn write_models(f: &mut fmt::Formatter<'_>, models: &Option<Vec<ModelRange>>) -> fmt::Result {
    match models {
        Some(models) => write!(f, " USING MODELS {}", join(models)),
        None => Ok(()),
    }
}

fn write_path(f: &mut fmt::Formatter<'_>, path: &str) -> fmt::Result {
    let bare = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '~' | '-'));
    if bare {
        f.write_str(path)
    } else {
        write!(f, "{}", Value::String(path.to_string()))
    }
}

fn write_assignments(f: &mut fmt::Formatter<'_>, entries: &[(String, String)]) -> fmt::Result {
    let items: Vec<String> = entries
        .iter()
        .map(|(k, v)| format!("{k} = {}", Value::String(v.clone())))
        .collect();
    f.write_str(&items.join(", "))
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::ListBtables => f.write_str("LIST BTABLES"),
            Statement::CreateBtable { btable, path } => {
                write!(f, "CREATE BTABLE {btable} FROM ")?;
                write_path(f, path)
            }
            Statement::DropBtable { btable } => write!(f, "DROP BTABLE {btable}"),
            Statement::ShowSchema { btable } => write!(f, "SHOW SCHEMA FOR {btable}"),
            Statement::UpdateSchema { btable, mappings } => {
                let items: Vec<String> = mappings
                    .iter()
                    .map(|(col, ty)| format!("{col} = {}", ty.as_str().to_uppercase()))
                    .collect();
                write!(f, "UPDATE SCHEMA FOR {btable} SET {}", items.join(", "))
            }
            Statement::LoadModels { path, btable } => {
                f.write_str("LOAD MODELS ")?;
                write_path(f, path)?;
                write!(f, " INTO {btable}")
            }
            Statement::SaveModels { btable, path } => {
                write!(f, "SAVE MODELS FROM {btable} TO ")?;
                write_path(f, path)
            }
            Statement::InitializeModels { btable, count, kind } => {
                write!(f, "INITIALIZE {count} MODELS FOR {btable}")?;
                if let Some(kind) = kind {
                    write!(f, " WITH CONFIG {}", kind.as_str().to_uppercase())?;
                }
                Ok(())
            }
            Statement::Analyze { btable, models, budget } => {
                write!(f, "ANALYZE {btable}")?;
                if let Some(models) = models {
                    write!(f, " MODELS {}", join(models))?;
                }
                match budget {
                    Some(AnalyzeBudget::Iterations(n)) => write!(f, " FOR {n} ITERATIONS"),
                    Some(AnalyzeBudget::Seconds(n)) => write!(f, " FOR {n} SECONDS"),
                    None => Ok(()),
                }
            }
            Statement::ShowModels { btable } => write!(f, "SHOW MODELS FOR {btable}"),
            Statement::ShowDiagnostics { btable } => write!(f, "SHOW DIAGNOSTICS FOR {btable}"),
            Statement::DropModels { btable, models } => {
                f.write_str("DROP MODELS")?;
                if let Some(models) = models {
                    write!(f, " {}", join(models))?;
                }
                write!(f, " FROM {btable}")
            }
            Statement::ShowColumns { btable, list } => match list {
                Some(list) => write!(f, "SHOW COLUMNS {list} FROM {btable}"),
                None => write!(f, "SHOW COLUMNS FROM {btable}"),
            },
            Statement::ShowColumnLists { btable } => write!(f, "SHOW COLUMN LISTS FOR {btable}"),
            Statement::LabelColumns { btable, labels } => {
                write!(f, "LABEL COLUMNS FOR {btable} SET ")?;
                write_assignments(f, labels)
            }
            Statement::ShowLabels { btable, columns } => {
                write!(f, "SHOW LABELS FOR {btable}")?;
                if let Some(columns) = columns {
                    write!(f, " {}", columns.join(", "))?;
                }
                Ok(())
            }
            Statement::UpdateMetadata { btable, entries } => {
                write!(f, "UPDATE METADATA FOR {btable} SET ")?;
                write_assignments(f, entries)
            }
            Statement::ShowMetadata { btable, keys } => {
                write!(f, "SHOW METADATA FOR {btable}")?;
                if let Some(keys) = keys {
                    write!(f, " {}", keys.join(", "))?;
                }
                Ok(())
            }
            Statement::Select(q) => {
                write!(f, "SELECT {} FROM {}", join(&q.exprs), q.btable)?;
                write_models(f, &q.models)?;
                if let Some(sim) = &q.similar_to {
                    write!(f, " WITH {sim}")?;
                }
                write_tail(f, &q.conditions, &q.order_by, q.limit)
            }
            Statement::Infer(q) => {
                write!(f, "INFER {} FROM {}", join(&q.exprs), q.btable)?;
                write_models(f, &q.models)?;
                write_tail(f, &q.conditions, &[], None)?;
                write!(f, " WITH CONFIDENCE {:?}", q.confidence)?;
                if let Some(samples) = q.samples {
                    write!(f, " WITH {samples} SAMPLES")?;
                }
                write_tail(f, &[], &q.order_by, q.limit)
            }
            Statement::Simulate(q) => {
                write!(f, "SIMULATE {} FROM {}", join(&q.exprs), q.btable)?;
                write_models(f, &q.models)?;
                if !q.givens.is_empty() {
                    let givens: Vec<String> =
                        q.givens.iter().map(|(c, v)| format!("{c} = {v}")).collect();
                    write!(f, " GIVEN {}", givens.join(" AND "))?;
                }
                write!(f, " TIMES {}", q.times)
            }
            Statement::EstimateColumns(q) => {
                write!(f, "ESTIMATE COLUMNS FROM {}", q.btable)?;
                write_models(f, &q.models)?;
                write_tail(f, &q.conditions, &q.order_by, q.limit)?;
                if let Some(name) = &q.save_as {
                    write!(f, " AS {name}")?;
                }
                Ok(())
            }
        }
    }
}
