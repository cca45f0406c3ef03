use bql_ast::ParseError;
use bql_model::{ColumnType, ModelError, ModelKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Could not access {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read CSV {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Btable {0} does not exist")]
    BtableNotFound(String),

    #[error("Btable {0} already exists")]
    BtableExists(String),

    #[error("Btable {0} has no rows")]
    EmptyBtable(String),

    #[error("Btable {0} has no modelled columns")]
    NoModeledColumns(String),

    #[error("Column {column} does not exist in btable {btable}")]
    ColumnNotFound { btable: String, column: String },

    #[error("Column list {list} does not exist in btable {btable}")]
    ColumnListNotFound { btable: String, list: String },

    #[error("Column {column} is not modelled (type {ctype})")]
    NotModeled { column: String, ctype: ColumnType },

    #[error("Cannot set column {column} to {ctype}: {reason}")]
    InvalidType {
        column: String,
        ctype: ColumnType,
        reason: String,
    },

    #[error("Row {0} does not exist")]
    RowNotFound(String),

    #[error("Btable {0} has no models; run INITIALIZE MODELS first")]
    NoModels(String),

    #[error("Model {id} does not exist in btable {btable}")]
    ModelNotFound { btable: String, id: usize },

    #[error("Btable {0} already has models; drop them before updating the schema")]
    ModelsExist(String),

    #[error("Btable {btable} already has {existing} models, cannot add {requested} models")]
    ConfigMismatch {
        btable: String,
        existing: ModelKind,
        requested: ModelKind,
    },

    #[error("Model bundle does not match btable {btable}: {reason}")]
    SchemaMismatch { btable: String, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl EngineError {
    pub(crate) fn file(path: &std::path::Path, source: std::io::Error) -> Self {
        EngineError::File {
            path: path.display().to_string(),
            source,
        }
    }
}
