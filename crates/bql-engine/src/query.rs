//! SELECT, INFER and SIMULATE

use bql_ast::{Condition, Expr, InferQuery, SelectQuery, SimulateQuery, SortKey};
use rand::rngs::StdRng;
use serde_json::Value as JsonValue;

use crate::btable::Btable;
use crate::error::EngineError;
use crate::functions::{satisfies, sort_order, Scope, ROW_ID};
use crate::result::QueryResult;

/// One output column of a row query.
struct Output {
    name: String,
    expr: Expr,
}

/// A column name, or the columns of the saved list it names.
fn expand_column(btable: &Btable, name: &str) -> Result<Vec<String>, EngineError> {
    if btable.column_index(name).is_ok() {
        return Ok(vec![name.to_string()]);
    }
    btable
        .column_lists
        .get(name)
        .cloned()
        .ok_or_else(|| EngineError::ColumnNotFound {
            btable: btable.name.clone(),
            column: name.to_string(),
        })
}

/// Expand `*` and column lists; `row_id` is always emitted first so it is skipped here.
fn outputs(scope: &Scope<'_>, exprs: &[Expr]) -> Result<Vec<Output>, EngineError> {
    let btable = scope.btable;
    let mut out = Vec::new();
    for expr in exprs {
        match expr {
            Expr::Wildcard => out.extend(btable.columns.iter().map(|c| Output {
                name: c.name.clone(),
                expr: Expr::Column(c.name.clone()),
            })),
            Expr::Column(name) if name == ROW_ID => {}
            Expr::Column(name) => out.extend(expand_column(btable, name)?.into_iter().map(|c| Output {
                name: c.clone(),
                expr: Expr::Column(c),
            })),
            other => out.push(Output {
                name: other.to_string(),
                expr: other.clone(),
            }),
        }
    }
    Ok(out)
}

/// Rows passing every condition, ordered by `keys` and then by row id.
fn matching_rows(
    scope: &Scope<'_>,
    conditions: &[Condition],
    keys: &[SortKey],
    limit: Option<usize>,
) -> Result<Vec<usize>, EngineError> {
    let mut rows: Vec<(usize, Vec<JsonValue>)> = Vec::new();
    'rows: for row in 0..scope.btable.n_rows() {
        for cond in conditions {
            if !satisfies(&scope.eval_row(&cond.expr, row)?, cond.op, &cond.value)? {
                continue 'rows;
            }
        }
        let values = keys
            .iter()
            .map(|k| scope.eval_row(&k.expr, row))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push((row, values));
    }

    // Stable sort keeps row id order among ties.
    rows.sort_by(|(_, a), (_, b)| {
        keys.iter()
            .zip(a.iter().zip(b))
            .map(|(key, (x, y))| sort_order(x, y, key.is_descending()))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut rows: Vec<usize> = rows.into_iter().map(|(row, _)| row).collect();
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

fn with_row_id(outputs: &[Output]) -> Vec<String> {
    std::iter::once(ROW_ID.to_string())
        .chain(outputs.iter().map(|o| o.name.clone()))
        .collect()
}

pub(crate) fn select(scope: &Scope<'_>, query: &SelectQuery) -> Result<QueryResult, EngineError> {
    let outputs = outputs(scope, &query.exprs)?;
    let mut keys = query.order_by.clone();
    if let Some(sim) = &query.similar_to {
        keys.push(SortKey {
            expr: Expr::Similarity(sim.clone()),
            desc: Some(true),
        });
    }
    let rows = matching_rows(scope, &query.conditions, &keys, query.limit)?;

    let data = rows
        .into_iter()
        .map(|row| {
            let mut values = vec![JsonValue::from(row)];
            for output in &outputs {
                values.push(scope.eval_row(&output.expr, row)?);
            }
            Ok(values)
        })
        .collect::<Result<Vec<_>, EngineError>>()?;
    Ok(QueryResult::table(with_row_id(&outputs), data))
}

/// Like SELECT, with missing modelled cells imputed when confident enough.
pub(crate) fn infer(
    scope: &Scope<'_>,
    query: &InferQuery,
    default_samples: usize,
    rng: &mut StdRng,
) -> Result<QueryResult, EngineError> {
    let ensemble = scope.ensemble()?;
    let samples = query.samples.unwrap_or(default_samples);
    let outputs = outputs(scope, &query.exprs)?;
    let rows = matching_rows(scope, &query.conditions, &query.order_by, query.limit)?;

    let mut imputed = 0usize;
    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = vec![JsonValue::from(row)];
        for output in &outputs {
            let value = scope.eval_row(&output.expr, row)?;
            let fill = match (&output.expr, &value) {
                (Expr::Column(name), JsonValue::Null) => {
                    let idx = scope.btable.column_index(name)?;
                    if scope.btable.columns[idx].ctype.is_modeled() {
                        let col = scope.modeled_index(name)?;
                        ensemble
                            .impute(row, col, samples, rng)
                            .filter(|imp| imp.confidence >= query.confidence)
                            .map(|imp| scope.decode(col, imp.value))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if fill.is_some() {
                imputed += 1;
            }
            values.push(fill.unwrap_or(value));
        }
        data.push(values);
    }
    tracing::debug!(btable = %scope.btable.name, imputed, samples, "Imputed cells");
    Ok(QueryResult::table(with_row_id(&outputs), data))
}

/// Draw hypothetical rows, optionally conditioned on given values.
pub(crate) fn simulate(scope: &Scope<'_>, query: &SimulateQuery, rng: &mut StdRng) -> Result<QueryResult, EngineError> {
    let ensemble = scope.ensemble()?;
    let data = scope.dataset()?;

    let mut names = Vec::new();
    for expr in &query.exprs {
        match expr {
            Expr::Wildcard => names.extend(scope.modeled_names()),
            Expr::Column(name) => names.extend(expand_column(scope.btable, name)?),
            other => {
                return Err(EngineError::InvalidQuery(format!(
                    "SIMULATE takes columns, not {other}"
                )))
            }
        }
    }
    let targets = names
        .iter()
        .map(|n| scope.modeled_index(n))
        .collect::<Result<Vec<_>, _>>()?;

    let mut givens = Vec::with_capacity(query.givens.len());
    for (column, value) in &query.givens {
        let col = scope.modeled_index(column)?;
        let datum = data.encode(col, &value.as_text()).ok_or_else(|| {
            EngineError::InvalidQuery(format!("{value} is not a valid value for column {column}"))
        })?;
        givens.push((col, datum));
    }

    let draws = ensemble.simulate(&givens, &targets, query.times, rng);
    let rows = draws
        .into_iter()
        .map(|draw| {
            targets
                .iter()
                .zip(draw)
                .map(|(col, datum)| {
                    let given = givens.iter().find(|(g, _)| g == col).map(|(_, d)| *d);
                    scope.decode(*col, given.unwrap_or(datum))
                })
                .collect()
        })
        .collect();
    Ok(QueryResult::table(names, rows))
}
