//! BQL engine - executes parsed statements against stored btables
//!
//! The engine owns a [`BtableStore`] and a seeded random number generator.
//! Every statement loads the btable it names, runs, and writes the btable
//! back when it changed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bql_ast::{AnalyzeBudget, ModelRange, Statement};
use bql_model::{Dataset, LatentState, ModelKind};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

mod btable;
mod bundle;
mod error;
mod estimate;
mod functions;
mod query;
mod result;
mod store;

pub use btable::{guess_type, Btable, ColumnMeta, ModelRecord};
pub use bundle::{BundledModel, ModelBundle};
pub use error::EngineError;
pub use result::QueryResult;
pub use store::{BtableStore, FileStore, MemoryStore};

use functions::Scope;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed seed for reproducible runs; drawn from entropy when unset.
    pub seed: Option<u64>,
    pub default_iterations: usize,
    pub default_samples: usize,
    /// Relative file paths in statements resolve against this directory.
    pub base_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: None,
            default_iterations: 1000,
            default_samples: 50,
            base_dir: PathBuf::from("."),
        }
    }
}

pub struct Engine {
    store: Box<dyn BtableStore>,
    rng: StdRng,
    config: EngineConfig,
}

/// Ids selected by a model id list, in ascending order.
fn select_ids(btable: &Btable, ranges: Option<&[ModelRange]>) -> Result<Vec<usize>, EngineError> {
    let Some(ranges) = ranges else {
        return Ok(btable.models.keys().copied().collect());
    };
    for range in ranges {
        for id in range.start..=range.end {
            if !btable.models.contains_key(&id) {
                return Err(EngineError::ModelNotFound {
                    btable: btable.name.clone(),
                    id,
                });
            }
        }
    }
    Ok(btable
        .models
        .keys()
        .copied()
        .filter(|id| ranges.iter().any(|r| r.contains(*id)))
        .collect())
}

fn model_table(btable: &Btable) -> QueryResult {
    let rows = btable
        .models
        .iter()
        .map(|(id, m)| vec![json!(id), json!(m.state.iterations)])
        .collect();
    QueryResult::table(vec!["model_id".into(), "iterations".into()], rows)
}

fn pairs(columns: [&str; 2], entries: impl IntoIterator<Item = (String, String)>) -> QueryResult {
    let rows = entries
        .into_iter()
        .map(|(k, v)| vec![JsonValue::String(k), JsonValue::String(v)])
        .collect();
    QueryResult::table(columns.iter().map(|c| c.to_string()).collect(), rows)
}

impl Engine {
    pub fn new(store: Box<dyn BtableStore>, config: EngineConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { store, rng, config }
    }

    /// Engine over a [`MemoryStore`].
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Box::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.base_dir = dir.into();
    }

    pub fn btables(&self) -> Result<Vec<String>, EngineError> {
        self.store.list()
    }

    /// Parse and execute every statement of a script, stopping at the first error.
    pub fn execute_script(&mut self, text: &str) -> Result<Vec<QueryResult>, EngineError> {
        bql_ast::parse_script(text)?
            .iter()
            .map(|stmt| self.execute(stmt))
            .collect()
    }

    pub fn execute(&mut self, stmt: &Statement) -> Result<QueryResult, EngineError> {
        let start = Instant::now();
        debug!(statement = %stmt, "Executing statement");
        let result = self.dispatch(stmt);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => info!(
                kind = stmt.kind(),
                btable = stmt.btable().unwrap_or(""),
                rows = r.row_count,
                elapsed_ms,
                "Statement completed"
            ),
            Err(e) => warn!(
                kind = stmt.kind(),
                btable = stmt.btable().unwrap_or(""),
                error = %e,
                elapsed_ms,
                "Statement failed"
            ),
        }
        result
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.base_dir.join(path)
        }
    }

    fn load(&self, name: &str) -> Result<Btable, EngineError> {
        self.store
            .get(name)?
            .ok_or_else(|| EngineError::BtableNotFound(name.to_string()))
    }

    fn dispatch(&mut self, stmt: &Statement) -> Result<QueryResult, EngineError> {
        match stmt {
            Statement::ListBtables => {
                let rows = self.store.list()?.into_iter().map(|n| vec![json!(n)]).collect();
                Ok(QueryResult::table(vec!["btable".into()], rows))
            }
            Statement::CreateBtable { btable, path } => self.create_btable(btable, path),
            Statement::DropBtable { btable } => {
                if self.store.remove(btable)? {
                    Ok(QueryResult::message(format!("Dropped btable {btable}")))
                } else {
                    warn!(btable = %btable, "Dropping a btable that does not exist");
                    Ok(QueryResult::message(format!("Btable {btable} does not exist; nothing dropped")))
                }
            }
            Statement::ShowSchema { btable } => Ok(self.schema(&self.load(btable)?)),
            Statement::UpdateSchema { btable, mappings } => {
                let mut table = self.load(btable)?;
                if !table.models.is_empty() {
                    return Err(EngineError::ModelsExist(btable.clone()));
                }
                for (column, ctype) in mappings {
                    table.set_type(column, *ctype)?;
                }
                self.store.put(&table)?;
                Ok(self.schema(&table).with_message(format!("Updated schema for {btable}")))
            }
            Statement::LoadModels { path, btable } => self.load_models(btable, path),
            Statement::SaveModels { btable, path } => {
                let table = self.load(btable)?;
                if table.models.is_empty() {
                    return Err(EngineError::NoModels(btable.clone()));
                }
                let path = self.resolve_path(path);
                ModelBundle::from_btable(&table)?.write(&path)?;
                Ok(QueryResult::message(format!(
                    "Saved {} models from {btable} to {}",
                    table.models.len(),
                    path.display()
                )))
            }
            Statement::InitializeModels { btable, count, kind } => {
                self.initialize_models(btable, *count, kind.unwrap_or_default())
            }
            Statement::Analyze { btable, models, budget } => self.analyze(btable, models.as_deref(), *budget),
            Statement::ShowModels { btable } => {
                let table = self.load(btable)?;
                if table.models.is_empty() {
                    return Ok(QueryResult::message(format!("No models for {btable}")));
                }
                Ok(model_table(&table))
            }
            Statement::ShowDiagnostics { btable } => {
                let table = self.load(btable)?;
                if table.models.is_empty() {
                    return Ok(QueryResult::message(format!("No models for {btable}")));
                }
                let rows = table
                    .models
                    .iter()
                    .map(|(id, m)| {
                        let d = &m.state.diagnostics;
                        vec![
                            json!(id),
                            json!(m.state.iterations),
                            json!(m.state.num_views()),
                            d.logscore.last().copied().map(functions::json_f64).unwrap_or(JsonValue::Null),
                            json!(m.updated_at.to_rfc3339()),
                        ]
                    })
                    .collect();
                Ok(QueryResult::table(
                    vec![
                        "model_id".into(),
                        "iterations".into(),
                        "num_views".into(),
                        "logscore".into(),
                        "updated_at".into(),
                    ],
                    rows,
                ))
            }
            Statement::DropModels { btable, models } => {
                let mut table = self.load(btable)?;
                let ids = select_ids(&table, models.as_deref())?;
                for id in &ids {
                    table.models.remove(id);
                }
                self.store.put(&table)?;
                Ok(QueryResult::message(format!("Dropped {} models from {btable}", ids.len())))
            }
            Statement::ShowColumns { btable, list } => {
                let table = self.load(btable)?;
                let names: Vec<String> = match list {
                    Some(list) => table.column_lists.get(list).cloned().ok_or_else(|| {
                        EngineError::ColumnListNotFound {
                            btable: btable.clone(),
                            list: list.clone(),
                        }
                    })?,
                    None => table.columns.iter().map(|c| c.name.clone()).collect(),
                };
                let rows = names.into_iter().map(|n| vec![json!(n)]).collect();
                Ok(QueryResult::table(vec!["column".into()], rows))
            }
            Statement::ShowColumnLists { btable } => {
                let table = self.load(btable)?;
                Ok(pairs(
                    ["column_list", "columns"],
                    table.column_lists.iter().map(|(k, v)| (k.clone(), v.join(", "))),
                ))
            }
            Statement::LabelColumns { btable, labels } => {
                let mut table = self.load(btable)?;
                for (column, label) in labels {
                    table.column_index(column)?;
                    table.labels.insert(column.clone(), label.clone());
                }
                self.store.put(&table)?;
                Ok(pairs(["column", "label"], labels.iter().cloned()))
            }
            Statement::ShowLabels { btable, columns } => {
                let table = self.load(btable)?;
                let names: Vec<String> = match columns {
                    Some(columns) => {
                        for c in columns {
                            table.column_index(c)?;
                        }
                        columns.clone()
                    }
                    None => table.columns.iter().map(|c| c.name.clone()).collect(),
                };
                Ok(pairs(
                    ["column", "label"],
                    names.into_iter().filter_map(|c| {
                        let label = table.labels.get(&c)?.clone();
                        Some((c, label))
                    }),
                ))
            }
            Statement::UpdateMetadata { btable, entries } => {
                let mut table = self.load(btable)?;
                table.metadata.extend(entries.iter().cloned());
                self.store.put(&table)?;
                Ok(pairs(["key", "value"], entries.iter().cloned()))
            }
            Statement::ShowMetadata { btable, keys } => {
                let table = self.load(btable)?;
                let entries: Vec<(String, String)> = match keys {
                    Some(keys) => keys
                        .iter()
                        .filter_map(|k| table.metadata.get(k).map(|v| (k.clone(), v.clone())))
                        .collect(),
                    None => table.metadata.clone().into_iter().collect(),
                };
                Ok(pairs(["key", "value"], entries))
            }
            Statement::Select(q) => {
                let table = self.load(&q.btable)?;
                let (data, states) = Self::model_inputs(&table, q.models.as_deref())?;
                let scope = Scope::new(&table, data.as_ref(), &states)?;
                query::select(&scope, q)
            }
            Statement::Infer(q) => {
                let table = self.load(&q.btable)?;
                let (data, states) = Self::model_inputs(&table, q.models.as_deref())?;
                let scope = Scope::new(&table, data.as_ref(), &states)?;
                query::infer(&scope, q, self.config.default_samples, &mut self.rng)
            }
            Statement::Simulate(q) => {
                let table = self.load(&q.btable)?;
                let (data, states) = Self::model_inputs(&table, q.models.as_deref())?;
                let scope = Scope::new(&table, data.as_ref(), &states)?;
                query::simulate(&scope, q, &mut self.rng)
            }
            Statement::EstimateColumns(q) => {
                let mut table = self.load(&q.btable)?;
                let (data, states) = Self::model_inputs(&table, q.models.as_deref())?;
                let (result, selected) = {
                    let scope = Scope::new(&table, data.as_ref(), &states)?;
                    estimate::estimate_columns(&scope, q)?
                };
                match &q.save_as {
                    Some(name) => {
                        table.column_lists.insert(name.clone(), selected);
                        self.store.put(&table)?;
                        Ok(result.with_message(format!("Saved column list {name}")))
                    }
                    None => Ok(result),
                }
            }
        }
    }

    /// Dataset (absent when nothing is modelled) and the chosen model states
    /// of a btable; `models` of `None` takes every model.
    fn model_inputs(
        table: &Btable,
        models: Option<&[ModelRange]>,
    ) -> Result<(Option<Dataset>, Vec<LatentState>), EngineError> {
        let data = match table.dataset() {
            Ok(data) => Some(data),
            Err(EngineError::NoModeledColumns(_)) => None,
            Err(e) => return Err(e),
        };
        let states = select_ids(table, models)?
            .into_iter()
            .filter_map(|id| table.models.get(&id))
            .map(|record| record.state.clone())
            .collect();
        Ok((data, states))
    }

    fn schema(&self, table: &Btable) -> QueryResult {
        pairs(
            ["column", "type"],
            table
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.ctype.as_str().to_string())),
        )
    }

    fn create_btable(&mut self, name: &str, path: &str) -> Result<QueryResult, EngineError> {
        if self.store.exists(name)? {
            return Err(EngineError::BtableExists(name.to_string()));
        }
        let path = self.resolve_path(path);
        let table = Btable::from_csv(name, &path)?;
        if table.n_rows() == 0 {
            return Err(EngineError::EmptyBtable(name.to_string()));
        }
        self.store.put(&table)?;
        info!(btable = name, rows = table.n_rows(), columns = table.columns.len(), "Created btable");

        let columns = table.columns.iter().map(|c| c.name.clone()).collect();
        let types = table.columns.iter().map(|c| json!(c.ctype.as_str())).collect();
        Ok(QueryResult::table(columns, vec![types]).with_message(format!(
            "Created btable {name} with {} rows. Inferred schema:",
            table.n_rows()
        )))
    }

    fn initialize_models(&mut self, name: &str, count: usize, kind: ModelKind) -> Result<QueryResult, EngineError> {
        let mut table = self.load(name)?;
        if let Some(existing) = table.model_kind() {
            if existing != kind {
                return Err(EngineError::ConfigMismatch {
                    btable: name.to_string(),
                    existing,
                    requested: kind,
                });
            }
        }
        let data = table.dataset()?;
        let first = table.next_model_id();
        let end = first.checked_add(count).ok_or_else(|| {
            EngineError::InvalidQuery(format!("cannot initialize {count} models after model {first}"))
        })?;
        for id in first..end {
            let state = LatentState::initialize(&data, kind, &mut self.rng);
            table.models.insert(
                id,
                ModelRecord {
                    state,
                    updated_at: Utc::now(),
                },
            );
        }
        self.store.put(&table)?;
        info!(btable = name, count, kind = %kind, "Initialized models");
        Ok(QueryResult::message(format!(
            "Initialized {count} {kind} models for {name}"
        )))
    }

    fn analyze(
        &mut self,
        name: &str,
        models: Option<&[ModelRange]>,
        budget: Option<AnalyzeBudget>,
    ) -> Result<QueryResult, EngineError> {
        let mut table = self.load(name)?;
        if table.models.is_empty() {
            return Err(EngineError::NoModels(name.to_string()));
        }
        let ids = select_ids(&table, models)?;
        let (iterations, deadline) = match budget {
            Some(AnalyzeBudget::Iterations(n)) => (n, None),
            // A deadline past the clock's range leaves only the iteration cap.
            Some(AnalyzeBudget::Seconds(s)) => (
                self.config.default_iterations,
                Instant::now().checked_add(Duration::from_secs(s)),
            ),
            None => (self.config.default_iterations, None),
        };
        let data = table.dataset()?;

        // Seeds are drawn in id order so a fixed engine seed reproduces the run.
        let mut jobs: Vec<(usize, u64, &mut ModelRecord)> = table
            .models
            .iter_mut()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(id, record)| (*id, 0, record))
            .collect();
        for job in &mut jobs {
            job.1 = self.rng.gen();
        }
        let start = Instant::now();
        jobs.par_iter_mut().for_each(|(id, seed, record)| {
            let mut rng = StdRng::seed_from_u64(*seed);
            let sweeps = record.state.analyze(&data, iterations, deadline, &mut rng);
            record.updated_at = Utc::now();
            info!(
                btable = name,
                model_id = *id,
                sweeps,
                total_iterations = record.state.iterations,
                "Analyzed model"
            );
        });
        let analyzed = jobs.len();
        info!(btable = name, models = analyzed, elapsed_ms = start.elapsed().as_millis() as u64, "Analyze complete");

        self.store.put(&table)?;
        Ok(model_table(&table).with_message(format!("Analyzed {analyzed} models for {name}")))
    }

    fn load_models(&mut self, name: &str, path: &str) -> Result<QueryResult, EngineError> {
        let mut table = self.load(name)?;
        let path = self.resolve_path(path);
        let bundle = ModelBundle::read(&path)?;
        let states = bundle.into_states(&table)?;
        if let (Some(existing), Some(first)) = (table.model_kind(), states.first()) {
            if existing != first.kind {
                return Err(EngineError::ConfigMismatch {
                    btable: name.to_string(),
                    existing,
                    requested: first.kind,
                });
            }
        }
        let first = table.next_model_id();
        let count = states.len();
        for (offset, state) in states.into_iter().enumerate() {
            table.models.insert(
                first + offset,
                ModelRecord {
                    state,
                    updated_at: Utc::now(),
                },
            );
        }
        self.store.put(&table)?;
        Ok(QueryResult::message(format!(
            "Loaded {count} models from {} into {name}",
            path.display()
        )))
    }
}
