//! Pest-based parser for BQL

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use bql_model::{ColumnType, ModelKind};

use crate::ast::*;

#[derive(Parser)]
#[grammar = "bql.pest"]
pub struct BqlParser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Pest error: {0}")]
    Pest(#[from] pest::error::Error<Rule>),
}

/// Parse exactly one BQL statement (a trailing `;` is allowed).
pub fn parse(source: &str) -> Result<Statement, ParseError> {
    let mut pairs = BqlParser::parse(Rule::single, source)?;
    let single = next(&mut pairs, "statement")?;
    let stmt = single
        .into_inner()
        .find(|p| p.as_rule() != Rule::EOI)
        .ok_or_else(|| ParseError::Syntax("Empty input".to_string()))?;
    parse_statement(stmt)
}

/// Parse a `;`-separated script. Empty statements are skipped.
pub fn parse_script(source: &str) -> Result<Vec<Statement>, ParseError> {
    let mut pairs = BqlParser::parse(Rule::script, source)?;
    let script = next(&mut pairs, "script")?;
    script
        .into_inner()
        .filter(|p| p.as_rule() != Rule::EOI)
        .map(parse_statement)
        .collect()
}

fn next<'a>(pairs: &mut Pairs<'a, Rule>, what: &str) -> Result<Pair<'a, Rule>, ParseError> {
    pairs
        .next()
        .ok_or_else(|| ParseError::Syntax(format!("Missing {what}")))
}

/// Children of `pair` with keyword tokens removed.
fn significant(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn is_keyword(rule: Rule) -> bool {
    format!("{rule:?}").starts_with("k_")
}

fn ident(pair: Pair<'_, Rule>) -> String {
    pair.as_str().to_lowercase()
}

fn expect<'a>(
    iter: &mut impl Iterator<Item = Pair<'a, Rule>>,
    rule: Rule,
) -> Result<Pair<'a, Rule>, ParseError> {
    match iter.next() {
        Some(p) if p.as_rule() == rule => Ok(p),
        Some(p) => Err(ParseError::Syntax(format!(
            "Expected {rule:?}, found {:?} '{}'",
            p.as_rule(),
            p.as_str()
        ))),
        None => Err(ParseError::Syntax(format!("Expected {rule:?}"))),
    }
}

fn expect_ident<'a>(iter: &mut impl Iterator<Item = Pair<'a, Rule>>) -> Result<String, ParseError> {
    expect(iter, Rule::ident).map(ident)
}

fn parse_usize(pair: Pair<'_, Rule>) -> Result<usize, ParseError> {
    pair.as_str()
        .parse()
        .map_err(|_| ParseError::Syntax(format!("Number out of range: {}", pair.as_str())))
}

fn parse_statement(pair: Pair<'_, Rule>) -> Result<Statement, ParseError> {
    let rule = pair.as_rule();
    let mut inner = significant(pair);

    let stmt = match rule {
        Rule::list_btables => Statement::ListBtables,
        Rule::create_btable => {
            let btable = expect_ident(&mut inner)?;
            let path = parse_path(expect(&mut inner, Rule::path)?)?;
            Statement::CreateBtable { btable, path }
        }
        Rule::drop_btable => Statement::DropBtable { btable: expect_ident(&mut inner)? },
        Rule::show_schema => Statement::ShowSchema { btable: expect_ident(&mut inner)? },
        Rule::update_schema => {
            let btable = expect_ident(&mut inner)?;
            let mappings = inner
                .map(parse_type_assign)
                .collect::<Result<Vec<_>, _>>()?;
            Statement::UpdateSchema { btable, mappings }
        }
        Rule::load_models => {
            let path = parse_path(expect(&mut inner, Rule::path)?)?;
            let btable = expect_ident(&mut inner)?;
            Statement::LoadModels { path, btable }
        }
        Rule::save_models => {
            let btable = expect_ident(&mut inner)?;
            let path = parse_path(expect(&mut inner, Rule::path)?)?;
            Statement::SaveModels { btable, path }
        }
        Rule::initialize_models => {
            let count = parse_usize(expect(&mut inner, Rule::uint)?)?;
            let btable = expect_ident(&mut inner)?;
            let kind = inner.next().map(parse_model_kind).transpose()?;
            Statement::InitializeModels { btable, count, kind }
        }
        Rule::analyze => {
            let btable = expect_ident(&mut inner)?;
            let mut models = None;
            let mut budget = None;
            for p in inner {
                match p.as_rule() {
                    Rule::model_ids => models = Some(parse_model_ids(p)?),
                    Rule::analyze_budget => budget = Some(parse_budget(p)?),
                    _ => {}
                }
            }
            Statement::Analyze { btable, models, budget }
        }
        Rule::show_models => Statement::ShowModels { btable: expect_ident(&mut inner)? },
        Rule::show_diagnostics => Statement::ShowDiagnostics { btable: expect_ident(&mut inner)? },
        Rule::drop_models => {
            let mut models = None;
            let mut btable = None;
            for p in inner {
                match p.as_rule() {
                    Rule::model_ids => models = Some(parse_model_ids(p)?),
                    Rule::ident => btable = Some(ident(p)),
                    _ => {}
                }
            }
            let btable = btable.ok_or_else(|| ParseError::Syntax("Missing btable".to_string()))?;
            Statement::DropModels { btable, models }
        }
        Rule::show_columns => {
            let names: Vec<String> = inner.filter(|p| p.as_rule() == Rule::ident).map(ident).collect();
            match names.as_slice() {
                [btable] => Statement::ShowColumns { btable: btable.clone(), list: None },
                [list, btable] => Statement::ShowColumns {
                    btable: btable.clone(),
                    list: Some(list.clone()),
                },
                _ => return Err(ParseError::Syntax("Malformed SHOW COLUMNS".to_string())),
            }
        }
        Rule::show_column_lists => Statement::ShowColumnLists { btable: expect_ident(&mut inner)? },
        Rule::label_columns => {
            let btable = expect_ident(&mut inner)?;
            let labels = inner.map(parse_assignment).collect::<Result<Vec<_>, _>>()?;
            Statement::LabelColumns { btable, labels }
        }
        Rule::show_labels => {
            let btable = expect_ident(&mut inner)?;
            let columns = inner.next().map(parse_ident_list);
            Statement::ShowLabels { btable, columns }
        }
        Rule::update_metadata => {
            let btable = expect_ident(&mut inner)?;
            let entries = inner.map(parse_assignment).collect::<Result<Vec<_>, _>>()?;
            Statement::UpdateMetadata { btable, entries }
        }
        Rule::show_metadata => {
            let btable = expect_ident(&mut inner)?;
            let keys = inner.next().map(parse_ident_list);
            Statement::ShowMetadata { btable, keys }
        }
        Rule::select_stmt => Statement::Select(parse_select(inner)?),
        Rule::infer_stmt => Statement::Infer(parse_infer(inner)?),
        Rule::simulate_stmt => Statement::Simulate(parse_simulate(inner)?),
        Rule::estimate_columns => Statement::EstimateColumns(parse_estimate_columns(inner)?),
        other => return Err(ParseError::Syntax(format!("Unknown statement: {other:?}"))),
    };
    Ok(stmt)
}

fn parse_select<'a>(mut inner: impl Iterator<Item = Pair<'a, Rule>>) -> Result<SelectQuery, ParseError> {
    let exprs = parse_expr_list(expect(&mut inner, Rule::select_list)?)?;
    let btable = expect_ident(&mut inner)?;
    let mut query = SelectQuery {
        btable,
        models: None,
        exprs,
        similar_to: None,
        conditions: vec![],
        order_by: vec![],
        limit: None,
    };
    for p in inner {
        match p.as_rule() {
            Rule::using_clause => query.models = Some(parse_using(p)?),
            Rule::similarity_clause => {
                let sim = expect(&mut significant(p), Rule::similarity)?;
                query.similar_to = Some(parse_similarity(sim)?);
            }
            Rule::where_clause => query.conditions = parse_where(p)?,
            Rule::order_clause => query.order_by = parse_order_by(p)?,
            Rule::limit_clause => query.limit = Some(parse_limit(p)?),
            other => return Err(ParseError::Syntax(format!("Unexpected clause: {other:?}"))),
        }
    }
    Ok(query)
}

fn parse_infer<'a>(mut inner: impl Iterator<Item = Pair<'a, Rule>>) -> Result<InferQuery, ParseError> {
    let exprs = parse_expr_list(expect(&mut inner, Rule::select_list)?)?;
    let btable = expect_ident(&mut inner)?;
    let mut query = InferQuery {
        btable,
        models: None,
        exprs,
        conditions: vec![],
        confidence: 0.0,
        samples: None,
        order_by: vec![],
        limit: None,
    };
    for p in inner {
        match p.as_rule() {
            Rule::using_clause => query.models = Some(parse_using(p)?),
            Rule::where_clause => query.conditions = parse_where(p)?,
            Rule::number => {
                let confidence: f64 = p
                    .as_str()
                    .parse()
                    .map_err(|_| ParseError::Syntax(format!("Invalid confidence: {}", p.as_str())))?;
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(ParseError::Syntax(format!(
                        "Confidence must be between 0 and 1, got {confidence}"
                    )));
                }
                query.confidence = confidence;
            }
            Rule::samples_clause => {
                query.samples = Some(parse_usize(expect(&mut significant(p), Rule::uint)?)?);
            }
            Rule::order_clause => query.order_by = parse_order_by(p)?,
            Rule::limit_clause => query.limit = Some(parse_limit(p)?),
            other => return Err(ParseError::Syntax(format!("Unexpected clause: {other:?}"))),
        }
    }
    Ok(query)
}

fn parse_simulate<'a>(mut inner: impl Iterator<Item = Pair<'a, Rule>>) -> Result<SimulateQuery, ParseError> {
    let exprs = parse_expr_list(expect(&mut inner, Rule::column_list)?)?;
    let btable = expect_ident(&mut inner)?;
    let mut models = None;
    let mut givens = Vec::new();
    let mut times = None;
    for p in inner {
        match p.as_rule() {
            Rule::using_clause => models = Some(parse_using(p)?),
            Rule::given_clause => {
                for given in significant(p).filter(|g| g.as_rule() == Rule::given) {
                    let mut parts = given.into_inner();
                    let column = expect_ident(&mut parts)?;
                    let value = parse_literal(expect(&mut parts, Rule::literal)?)?;
                    givens.push((column, value));
                }
            }
            Rule::uint => times = Some(parse_usize(p)?),
            other => return Err(ParseError::Syntax(format!("Unexpected clause: {other:?}"))),
        }
    }
    let times = times.ok_or_else(|| ParseError::Syntax("Missing TIMES".to_string()))?;
    Ok(SimulateQuery { btable, models, exprs, givens, times })
}

fn parse_estimate_columns<'a>(
    mut inner: impl Iterator<Item = Pair<'a, Rule>>,
) -> Result<EstimateColumnsQuery, ParseError> {
    let btable = expect_ident(&mut inner)?;
    let mut query = EstimateColumnsQuery {
        btable,
        models: None,
        conditions: vec![],
        order_by: vec![],
        limit: None,
        save_as: None,
    };
    for p in inner {
        match p.as_rule() {
            Rule::using_clause => query.models = Some(parse_using(p)?),
            Rule::where_clause => query.conditions = parse_where(p)?,
            Rule::order_clause => query.order_by = parse_order_by(p)?,
            Rule::limit_clause => query.limit = Some(parse_limit(p)?),
            Rule::as_clause => query.save_as = Some(expect_ident(&mut significant(p))?),
            other => return Err(ParseError::Syntax(format!("Unexpected clause: {other:?}"))),
        }
    }
    Ok(query)
}

fn parse_expr_list(pair: Pair<'_, Rule>) -> Result<Vec<Expr>, ParseError> {
    pair.into_inner().map(parse_expr).collect()
}

fn parse_expr(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    if pair.as_rule() == Rule::similarity {
        return parse_similarity(pair).map(Expr::Similarity);
    }
    let rule = pair.as_rule();
    let mut inner = significant(pair);
    let expr = match rule {
        Rule::wildcard => Expr::Wildcard,
        Rule::column => Expr::Column(expect_ident(&mut inner)?),
        Rule::typicality => Expr::Typicality,
        Rule::predictive_probability => Expr::PredictiveProbability { column: expect_ident(&mut inner)? },
        Rule::probability => {
            let column = expect_ident(&mut inner)?;
            let value = parse_literal(expect(&mut inner, Rule::literal)?)?;
            Expr::Probability { column, value }
        }
        Rule::dependence_probability => Expr::DependenceProbability { column: expect_ident(&mut inner)? },
        Rule::correlation => Expr::Correlation { column: expect_ident(&mut inner)? },
        other => return Err(ParseError::Syntax(format!("Invalid expression: {other:?}"))),
    };
    Ok(expr)
}

fn parse_similarity(pair: Pair<'_, Rule>) -> Result<SimilarityTo, ParseError> {
    let mut inner = significant(pair);
    let row_ref = expect(&mut inner, Rule::row_ref)?;
    let row_inner = row_ref
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::Syntax("Missing row reference".to_string()))?;
    let row = match row_inner.as_rule() {
        Rule::row_id_ref => RowRef::Id(parse_usize(row_inner)?),
        Rule::row_match => {
            let mut parts = row_inner.into_inner();
            let column = expect_ident(&mut parts)?;
            let value = parse_literal(expect(&mut parts, Rule::literal)?)?;
            RowRef::Matching { column, value }
        }
        other => return Err(ParseError::Syntax(format!("Invalid row reference: {other:?}"))),
    };
    let respect_to = inner.find(|p| p.as_rule() == Rule::ident).map(ident);
    Ok(SimilarityTo { row, respect_to })
}

fn parse_where(pair: Pair<'_, Rule>) -> Result<Vec<Condition>, ParseError> {
    significant(pair)
        .map(|cond| {
            let mut parts = cond.into_inner();
            let expr = parse_expr(next(&mut parts, "condition operand")?)?;
            let op = match expect(&mut parts, Rule::comparator)?.as_str() {
                "=" => CmpOp::Eq,
                "!=" | "<>" => CmpOp::Ne,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                ">=" => CmpOp::Ge,
                other => return Err(ParseError::Syntax(format!("Unknown comparator: {other}"))),
            };
            let value = parse_literal(expect(&mut parts, Rule::literal)?)?;
            Ok(Condition { expr, op, value })
        })
        .collect()
}

fn parse_order_by(pair: Pair<'_, Rule>) -> Result<Vec<SortKey>, ParseError> {
    significant(pair)
        .map(|key| {
            let mut parts = key.into_inner();
            let expr = parse_expr(next(&mut parts, "sort key")?)?;
            let desc = parts
                .next()
                .map(|dir| dir.as_str().trim().eq_ignore_ascii_case("desc"));
            Ok(SortKey { expr, desc })
        })
        .collect()
}

fn parse_limit(pair: Pair<'_, Rule>) -> Result<usize, ParseError> {
    parse_usize(expect(&mut significant(pair), Rule::uint)?)
}

fn parse_literal(pair: Pair<'_, Rule>) -> Result<Value, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::Syntax("Empty literal".to_string()))?;
    let text = inner.as_str();
    let value = match inner.as_rule() {
        Rule::int => text
            .parse()
            .map(Value::Int)
            .map_err(|_| ParseError::Syntax(format!("Integer out of range: {text}")))?,
        Rule::decimal => text
            .parse()
            .map(Value::Float)
            .map_err(|_| ParseError::Syntax(format!("Invalid number: {text}")))?,
        Rule::string => Value::String(string_contents(inner)),
        Rule::word => Value::String(text.to_string()),
        other => return Err(ParseError::Syntax(format!("Invalid literal: {other:?}"))),
    };
    Ok(value)
}

fn string_contents(pair: Pair<'_, Rule>) -> String {
    let Some(inner) = pair.into_inner().next() else {
        return String::new();
    };
    match inner.as_rule() {
        Rule::dq_inner => inner.as_str().replace("\"\"", "\""),
        _ => inner.as_str().replace("''", "'"),
    }
}

fn parse_path(pair: Pair<'_, Rule>) -> Result<String, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::Syntax("Missing path".to_string()))?;
    match inner.as_rule() {
        Rule::string => Ok(string_contents(inner)),
        _ => Ok(inner.as_str().to_string()),
    }
}

fn parse_type_assign(pair: Pair<'_, Rule>) -> Result<(String, ColumnType), ParseError> {
    let mut parts = pair.into_inner();
    let column = expect_ident(&mut parts)?;
    let ty = expect(&mut parts, Rule::column_type)?;
    let ty = ty
        .as_str()
        .parse::<ColumnType>()
        .map_err(ParseError::Syntax)?;
    Ok((column, ty))
}

fn parse_model_kind(pair: Pair<'_, Rule>) -> Result<ModelKind, ParseError> {
    let text = pair
        .as_str()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    text.parse::<ModelKind>().map_err(ParseError::Syntax)
}

fn parse_model_ids(pair: Pair<'_, Rule>) -> Result<Vec<ModelRange>, ParseError> {
    pair.into_inner()
        .map(|range| {
            let mut bounds = range.into_inner();
            let start = parse_usize(next(&mut bounds, "model id")?)?;
            let end = match bounds.next() {
                Some(end) => parse_usize(end)?,
                None => start,
            };
            if end < start {
                return Err(ParseError::Syntax(format!("Invalid model range {start}-{end}")));
            }
            Ok(ModelRange { start, end })
        })
        .collect()
}

fn parse_using(pair: Pair<'_, Rule>) -> Result<Vec<ModelRange>, ParseError> {
    parse_model_ids(expect(&mut significant(pair), Rule::model_ids)?)
}

fn parse_budget(pair: Pair<'_, Rule>) -> Result<AnalyzeBudget, ParseError> {
    let mut inner = significant(pair);
    let amount = expect(&mut inner, Rule::uint)?;
    let unit = next_significant(&mut inner, "budget unit")?;
    match unit.as_rule() {
        Rule::seconds_unit => amount
            .as_str()
            .parse()
            .map(AnalyzeBudget::Seconds)
            .map_err(|_| ParseError::Syntax(format!("Number out of range: {}", amount.as_str()))),
        _ => Ok(AnalyzeBudget::Iterations(parse_usize(amount)?)),
    }
}

fn next_significant<'a>(
    iter: &mut impl Iterator<Item = Pair<'a, Rule>>,
    what: &str,
) -> Result<Pair<'a, Rule>, ParseError> {
    iter.next()
        .ok_or_else(|| ParseError::Syntax(format!("Missing {what}")))
}

fn parse_assignment(pair: Pair<'_, Rule>) -> Result<(String, String), ParseError> {
    let mut parts = pair.into_inner();
    let key = expect_ident(&mut parts)?;
    let value = parse_literal(expect(&mut parts, Rule::literal)?)?;
    Ok((key, value.as_text()))
}

fn parse_ident_list(pair: Pair<'_, Rule>) -> Vec<String> {
    pair.into_inner().map(ident).collect()
}
