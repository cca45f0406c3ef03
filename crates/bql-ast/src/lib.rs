//! BQL AST - parser and AST types

pub mod ast;
mod parser;

pub use ast::*;
pub use parser::{parse, parse_script, BqlParser, ParseError, Rule};

#[cfg(test)]
mod tests {
    use super::*;

    const KIVA_SCRIPT: &str = include_str!("../../../demos/kiva.bql");

    #[test]
    fn test_demo_script_parses() {
        let statements = parse_script(KIVA_SCRIPT).unwrap();
        assert!(statements.len() >= 8);
        assert_eq!(statements[0], Statement::DropBtable { btable: "kiva".to_string() });
        assert!(statements.iter().any(|s| matches!(s, Statement::Infer(_))));
    }

    #[test]
    fn test_display_round_trips_demo_script() {
        for stmt in parse_script(KIVA_SCRIPT).unwrap() {
            let rendered = stmt.to_string();
            let reparsed = parse(&rendered)
                .unwrap_or_else(|e| panic!("failed to re-parse `{rendered}`: {e}"));
            assert_eq!(reparsed, stmt, "{rendered}");
        }
    }

    #[test]
    fn test_display_round_trips_quotes_and_model_ranges() {
        let stmt = Statement::UpdateMetadata {
            btable: "kiva".to_string(),
            entries: vec![("note".to_string(), r#"it's "fine""#.to_string())],
        };
        assert_eq!(parse(&stmt.to_string()).unwrap(), stmt);

        let stmt = parse(
            r#"INFER x FROM kiva USING MODELS 0-2, 4 WHERE name = 'O''Brien "Jr"' WITH CONFIDENCE 0.5 LIMIT 3"#,
        )
        .unwrap();
        let rendered = stmt.to_string();
        assert!(rendered.contains("USING MODELS 0-2, 4"), "{rendered}");
        assert_eq!(parse(&rendered).unwrap(), stmt);
    }

    #[test]
    fn test_script_skips_empty_statements_and_comments() {
        let script = "-- setup\n;; LIST BTABLES; # trailing comment\n SHOW MODELS FOR kiva;;";
        let statements = parse_script(script).unwrap();
        assert_eq!(
            statements,
            vec![
                Statement::ListBtables,
                Statement::ShowModels { btable: "kiva".to_string() },
            ]
        );
    }

    #[test]
    fn test_ast_serializes_to_json() {
        let stmt = parse("SHOW LABELS FOR kiva loan_amount, paid_date").unwrap();
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["ShowLabels"]["btable"], "kiva");
        assert_eq!(json["ShowLabels"]["columns"][1], "paid_date");
    }
}
