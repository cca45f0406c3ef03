//! ESTIMATE COLUMNS

use bql_ast::EstimateColumnsQuery;
use serde_json::Value as JsonValue;

use crate::error::EngineError;
use crate::functions::{satisfies, sort_order, Scope};
use crate::result::QueryResult;

/// Filter, order and limit the modelled columns by column functions.
///
/// Returns the result table and the selected column names.
pub(crate) fn estimate_columns(
    scope: &Scope<'_>,
    query: &EstimateColumnsQuery,
) -> Result<(QueryResult, Vec<String>), EngineError> {
    let names = scope.modeled_names();

    let mut candidates: Vec<(usize, Vec<JsonValue>)> = Vec::new();
    'columns: for (col, _) in names.iter().enumerate() {
        for cond in &query.conditions {
            if !satisfies(&scope.eval_column(&cond.expr, col)?, cond.op, &cond.value)? {
                continue 'columns;
            }
        }
        let scores = query
            .order_by
            .iter()
            .map(|key| scope.eval_column(&key.expr, col))
            .collect::<Result<Vec<_>, _>>()?;
        candidates.push((col, scores));
    }

    candidates.sort_by(|(_, a), (_, b)| {
        query
            .order_by
            .iter()
            .zip(a.iter().zip(b))
            .map(|(key, (x, y))| sort_order(x, y, key.is_descending()))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(limit) = query.limit {
        candidates.truncate(limit);
    }

    let columns = std::iter::once("column".to_string())
        .chain(query.order_by.iter().map(|k| k.expr.to_string()))
        .collect();
    let selected: Vec<String> = candidates.iter().map(|(col, _)| names[*col].clone()).collect();
    let rows = candidates
        .into_iter()
        .map(|(col, scores)| {
            std::iter::once(JsonValue::String(names[col].clone()))
                .chain(scores)
                .collect()
        })
        .collect();
    Ok((QueryResult::table(columns, rows), selected))
}
