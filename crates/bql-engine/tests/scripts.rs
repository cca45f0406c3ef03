//! End-to-end tests that drive whole BQL scripts through the engine.

use std::path::Path;

use bql_engine::{Engine, EngineConfig, EngineError, FileStore, QueryResult};
use serde_json::{json, Value};

/// 40 rows in two well separated groups, with a few missing cells.
fn write_people_csv(dir: &Path) {
    let mut text = String::from("Name,Group,Height,Weight,Smoker\n");
    for i in 0..40 {
        let tall = i % 2 == 0;
        let height = if tall { 190.0 } else { 150.0 } + (i as f64) * 0.25;
        let weight = if i == 5 || i == 8 {
            "NA".to_string()
        } else {
            format!("{:.2}", height * 0.5 + (i % 3) as f64)
        };
        let smoker = if i == 11 { "" } else if tall { "yes" } else { "no" };
        let group = if tall { "tall" } else { "short" };
        text.push_str(&format!("p{i},{group},{height},{weight},{smoker}\n"));
    }
    std::fs::write(dir.join("people.csv"), text).unwrap();
}

fn engine_in(dir: &Path, seed: u64) -> Engine {
    Engine::in_memory(EngineConfig {
        seed: Some(seed),
        default_iterations: 10,
        default_samples: 30,
        base_dir: dir.to_path_buf(),
    })
}

fn run(engine: &mut Engine, script: &str) -> Vec<QueryResult> {
    engine
        .execute_script(script)
        .unwrap_or_else(|e| panic!("script failed: {e}\n{script}"))
}

fn last(engine: &mut Engine, script: &str) -> QueryResult {
    run(engine, script).pop().unwrap()
}

fn column<'a>(result: &'a QueryResult, name: &str) -> Vec<&'a Value> {
    let idx = result.column(name).unwrap();
    result.rows.iter().map(|r| &r[idx]).collect()
}

const SETUP: &str = "
    CREATE BTABLE people FROM people.csv;
    INITIALIZE 3 MODELS FOR people;
    ANALYZE people FOR 15 ITERATIONS;
";

#[test]
fn test_create_guesses_schema() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 1);

    let created = last(&mut engine, "CREATE BTABLE people FROM people.csv");
    assert_eq!(created.columns, ["name", "group", "height", "weight", "smoker"]);
    assert_eq!(
        created.rows[0],
        vec![json!("key"), json!("multinomial"), json!("continuous"), json!("continuous"), json!("multinomial")]
    );

    let schema = last(&mut engine, "SHOW SCHEMA FOR people");
    assert_eq!(schema.row_count, 5);
    let listed = last(&mut engine, "LIST BTABLES");
    assert_eq!(listed.rows, vec![vec![json!("people")]]);
}

#[test]
fn test_kiva_demo_script_runs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("kiva.csv"), include_str!("../../../demos/kiva.csv")).unwrap();
    let script = include_str!("../../../demos/kiva.bql");
    let mut engine = engine_in(dir.path(), 7);

    let results = run(&mut engine, script);
    assert_eq!(results.len(), bql_ast::parse_script(script).unwrap().len());
    assert!(dir.path().join("kiva_models.json").exists());

    let show_models = &results[8];
    assert_eq!(column(show_models, "model_id"), [&json!(0), &json!(1), &json!(2), &json!(3)]);

    let similar = &results[11];
    assert_eq!(similar.row_count, 10);
    assert_eq!(similar.columns[0], "row_id");
    assert_eq!(similar.rows[0][0], json!(0));

    let risk = results.last().unwrap();
    assert_eq!(risk.row_count, 3);
}

#[test]
fn test_fixed_seed_reproduces_analysis() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let query = format!("{SETUP}; SELECT SIMILARITY TO 0, TYPICALITY FROM people");

    let a = last(&mut engine_in(dir.path(), 99), &query);
    let b = last(&mut engine_in(dir.path(), 99), &query);
    assert_eq!(a.rows, b.rows);
}

#[test]
fn test_similarity_properties() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 3);
    run(&mut engine, SETUP);

    let result = last(&mut engine, "SELECT name, SIMILARITY TO 4 FROM people");
    let sims = column(&result, "SIMILARITY TO 4");
    assert_eq!(sims[4], &json!(1.0));
    assert!(sims.iter().all(|s| (0.0..=1.0).contains(&s.as_f64().unwrap())));

    // The WITH SIMILARITY clause ranks rows by similarity to the reference row.
    let ranked = last(
        &mut engine,
        "SELECT name, SIMILARITY TO 4 FROM people WITH SIMILARITY TO (name = 'p4') LIMIT 5",
    );
    assert_eq!(ranked.row_count, 5);
    let ranked: Vec<f64> = column(&ranked, "SIMILARITY TO 4")
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert_eq!(ranked[0], 1.0);
    assert!(ranked.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_where_order_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 4);
    run(&mut engine, "CREATE BTABLE people FROM people.csv");

    let result = last(
        &mut engine,
        "SELECT name, height FROM people WHERE group = 'short' AND height > 155 ORDER BY height DESC LIMIT 3",
    );
    assert_eq!(column(&result, "row_id"), [&json!(39), &json!(37), &json!(35)]);
    assert_eq!(result.columns, ["row_id", "name", "height"]);

    let star = last(&mut engine, "SELECT * FROM people WHERE name = 'p2'");
    assert_eq!(star.columns.len(), 6);
    assert_eq!(star.rows[0][0], json!(2));
}

#[test]
fn test_functions_need_models() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 5);
    run(&mut engine, "CREATE BTABLE people FROM people.csv");

    let err = engine.execute_script("SELECT TYPICALITY FROM people").unwrap_err();
    assert!(matches!(err, EngineError::NoModels(_)));
    let err = engine.execute_script("INFER weight FROM people WITH CONFIDENCE 0.5").unwrap_err();
    assert!(matches!(err, EngineError::NoModels(_)));
}

#[test]
fn test_infer_respects_confidence_and_observed_cells() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 6);
    run(&mut engine, SETUP);

    let observed = last(&mut engine, "SELECT weight, smoker FROM people");
    let filled = last(&mut engine, "INFER weight, smoker FROM people WITH CONFIDENCE 0.0");
    for (obs, inf) in observed.rows.iter().zip(&filled.rows) {
        for i in 0..obs.len() {
            if !obs[i].is_null() {
                assert_eq!(obs[i], inf[i]);
            } else {
                assert!(!inf[i].is_null());
            }
        }
    }
    // Row 11 has no smoker value in the file.
    let smoker = &filled.rows[11][2];
    assert!(smoker == &json!("yes") || smoker == &json!("no"));

    let strict = last(&mut engine, "INFER weight FROM people WITH CONFIDENCE 1.0 WITH 20 SAMPLES");
    assert_eq!(strict.rows[0][1], observed.rows[0][1]);
}

#[test]
fn test_infer_leaves_uncertain_cells_missing() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 15);
    run(&mut engine, SETUP);

    // A categorical draw disagrees with the mode often enough that 200
    // samples never reach full agreement.
    let strict = last(&mut engine, "INFER smoker FROM people WITH CONFIDENCE 1.0 WITH 200 SAMPLES");
    assert!(strict.rows[11][1].is_null());
    assert_eq!(strict.rows[10][1], json!("yes"));
}

#[test]
fn test_infer_fills_continuous_cells_across_models() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 16);
    run(
        &mut engine,
        "CREATE BTABLE people FROM people.csv;
         INITIALIZE 4 MODELS FOR people;
         ANALYZE people FOR 30 ITERATIONS",
    );

    let filled = last(&mut engine, "INFER weight FROM people WITH CONFIDENCE 0.3 WITH 200 SAMPLES");
    for row in [5, 8] {
        let weight = filled.rows[row][1]
            .as_f64()
            .unwrap_or_else(|| panic!("row {row} was not imputed: {:?}", filled.rows[row]));
        assert!((60.0..120.0).contains(&weight), "row {row} imputed {weight}");
    }
}

#[test]
fn test_order_by_mixed_categorical_column() {
    let dir = tempfile::tempdir().unwrap();
    let mut text = String::from("Name,Code\n");
    for (i, code) in ["10", "b", "9", "a", "2"].iter().cycle().take(10).enumerate() {
        text.push_str(&format!("r{i},{code}\n"));
    }
    std::fs::write(dir.path().join("lots.csv"), text).unwrap();
    let mut engine = engine_in(dir.path(), 17);
    run(&mut engine, "CREATE BTABLE lots FROM lots.csv");

    let ascending = last(&mut engine, "SELECT code FROM lots ORDER BY code");
    let codes: Vec<&str> = column(&ascending, "code").iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(codes, ["2", "2", "9", "9", "10", "10", "a", "a", "b", "b"]);
    assert_eq!(column(&ascending, "row_id")[..2], [&json!(4), &json!(9)]);

    let descending = last(&mut engine, "SELECT code FROM lots ORDER BY code DESC LIMIT 3");
    assert_eq!(column(&descending, "code"), [&json!("b"), &json!("b"), &json!("a")]);
}

#[test]
fn test_simulate_echoes_givens() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 8);
    run(&mut engine, SETUP);

    let sim = last(&mut engine, "SIMULATE group, height FROM people GIVEN group = 'tall' TIMES 7");
    assert_eq!(sim.columns, ["group", "height"]);
    assert_eq!(sim.row_count, 7);
    assert!(sim.rows.iter().all(|r| r[0] == json!("tall") && r[1].is_number()));

    let err = engine
        .execute_script("SIMULATE height FROM people GIVEN group = 'medium' TIMES 2")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuery(_)));
}

#[test]
fn test_estimate_columns_saves_a_list() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 9);
    run(&mut engine, SETUP);

    let estimate = last(
        &mut engine,
        "ESTIMATE COLUMNS FROM people WHERE TYPICALITY > 0.0 ORDER BY CORRELATION WITH height LIMIT 2 AS body",
    );
    assert_eq!(estimate.columns, ["column", "CORRELATION WITH height"]);
    // Height correlates perfectly with itself; weight nearly so; categorical columns sort last.
    assert_eq!(column(&estimate, "column"), [&json!("height"), &json!("weight")]);

    let lists = last(&mut engine, "SHOW COLUMN LISTS FOR people");
    assert_eq!(lists.rows, vec![vec![json!("body"), json!("height, weight")]]);
    let selected = last(&mut engine, "SELECT body FROM people LIMIT 1");
    assert_eq!(selected.columns, ["row_id", "height", "weight"]);
    let simulated = last(&mut engine, "SIMULATE body FROM people TIMES 3");
    assert_eq!(simulated.columns, ["height", "weight"]);
    assert_eq!(simulated.row_count, 3);
    assert!(simulated.rows.iter().flatten().all(|v| v.is_number()));
}

#[test]
fn test_model_management() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 10);
    run(&mut engine, SETUP);

    let err = engine
        .execute_script("UPDATE SCHEMA FOR people SET smoker = IGNORE")
        .unwrap_err();
    assert!(matches!(err, EngineError::ModelsExist(_)));
    let err = engine
        .execute_script("INITIALIZE 1 MODEL FOR people WITH CONFIG naive bayes")
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfigMismatch { .. }));

    run(&mut engine, "INITIALIZE 2 MODELS FOR people; ANALYZE people MODELS 3-4 FOR 2 ITERATIONS");
    let models = last(&mut engine, "SHOW MODELS FOR people");
    assert_eq!(
        models.rows,
        vec![
            vec![json!(0), json!(15)],
            vec![json!(1), json!(15)],
            vec![json!(2), json!(15)],
            vec![json!(3), json!(2)],
            vec![json!(4), json!(2)],
        ]
    );

    let diagnostics = last(&mut engine, "SHOW DIAGNOSTICS FOR people");
    assert_eq!(diagnostics.row_count, 5);

    let err = engine.execute_script("ANALYZE people MODEL 9").unwrap_err();
    assert!(matches!(err, EngineError::ModelNotFound { id: 9, .. }));

    let dropped = last(&mut engine, "DROP MODELS 0-1, 4 FROM people; SHOW MODELS FOR people");
    assert_eq!(column(&dropped, "model_id"), [&json!(2), &json!(3)]);
    let none = last(&mut engine, "DROP MODELS FROM people; SHOW MODELS FOR people");
    assert_eq!(none.message.as_deref(), Some("No models for people"));
}

#[test]
fn test_save_and_load_models() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 11);
    run(&mut engine, SETUP);
    let before = last(&mut engine, "SAVE MODELS FROM people TO ensemble.json; SHOW MODELS FOR people");

    run(
        &mut engine,
        "CREATE BTABLE copy FROM people.csv; LOAD MODELS ensemble.json INTO copy",
    );
    let after = last(&mut engine, "SHOW MODELS FOR copy");
    assert_eq!(before.rows, after.rows);

    // Same file with one column ignored no longer matches the bundle.
    run(
        &mut engine,
        "CREATE BTABLE other FROM people.csv; UPDATE SCHEMA FOR other SET smoker = IGNORE",
    );
    let err = engine
        .execute_script("LOAD MODELS ensemble.json INTO other")
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaMismatch { .. }));
}

#[test]
fn test_btable_lifecycle_errors() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 12);

    let dropped = last(&mut engine, "DROP BTABLE people");
    assert!(dropped.message.unwrap().contains("does not exist"));

    run(&mut engine, "CREATE BTABLE people FROM people.csv");
    let err = engine.execute_script("CREATE BTABLE people FROM people.csv").unwrap_err();
    assert!(matches!(err, EngineError::BtableExists(_)));
    let err = engine.execute_script("SHOW SCHEMA FOR nobody").unwrap_err();
    assert!(matches!(err, EngineError::BtableNotFound(_)));
    let err = engine.execute_script("CREATE BTABLE x FROM missing.csv").unwrap_err();
    assert!(matches!(err, EngineError::File { .. }));
}

#[test]
fn test_labels_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 13);
    run(
        &mut engine,
        "CREATE BTABLE people FROM people.csv;
         LABEL COLUMNS FOR people SET height = 'height in cm', weight = 'weight in kg';
         UPDATE METADATA FOR people SET source = 'synthetic', version = 2",
    );

    let labels = last(&mut engine, "SHOW LABELS FOR people height");
    assert_eq!(labels.rows, vec![vec![json!("height"), json!("height in cm")]]);
    let all = last(&mut engine, "SHOW LABELS FOR people");
    assert_eq!(all.row_count, 2);
    let metadata = last(&mut engine, "SHOW METADATA FOR people");
    assert_eq!(
        metadata.rows,
        vec![vec![json!("source"), json!("synthetic")], vec![json!("version"), json!("2")]]
    );
    let err = engine
        .execute_script("LABEL COLUMNS FOR people SET age = 'years'")
        .unwrap_err();
    assert!(matches!(err, EngineError::ColumnNotFound { .. }));
}

#[test]
fn test_file_store_persists_between_engines() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let config = EngineConfig {
        seed: Some(14),
        default_iterations: 3,
        default_samples: 10,
        base_dir: dir.path().to_path_buf(),
    };

    let store = FileStore::open(dir.path().join("data")).unwrap();
    let mut engine = Engine::new(Box::new(store), config.clone());
    run(&mut engine, "CREATE BTABLE people FROM people.csv; INITIALIZE 2 MODELS FOR people; ANALYZE people");

    let store = FileStore::open(dir.path().join("data")).unwrap();
    let mut reopened = Engine::new(Box::new(store), config);
    let models = last(&mut reopened, "SHOW MODELS FOR people");
    assert_eq!(column(&models, "iterations"), [&json!(3), &json!(3)]);
}

#[test]
fn test_queries_use_chosen_models() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let query = "SELECT SIMILARITY TO 0, TYPICALITY FROM people";

    let mut chosen = engine_in(dir.path(), 18);
    run(&mut chosen, SETUP);
    let using = last(&mut chosen, &format!("{query} USING MODELS 1"));

    // Same seed, same models; only model 1 is left to query.
    let mut dropped = engine_in(dir.path(), 18);
    run(&mut dropped, SETUP);
    let only = last(&mut dropped, &format!("DROP MODELS 0, 2 FROM people; {query}"));
    assert_eq!(using.rows, only.rows);

    let estimate = last(
        &mut chosen,
        "ESTIMATE COLUMNS FROM people USING MODEL 0 ORDER BY DEPENDENCE PROBABILITY WITH height",
    );
    for p in column(&estimate, "DEPENDENCE PROBABILITY WITH height") {
        let p = p.as_f64().unwrap();
        assert!(p == 0.0 || p == 1.0, "one model gives 0 or 1, got {p}");
    }
    let sim = last(&mut chosen, "SIMULATE height FROM people USING MODELS 0-1 TIMES 4");
    assert_eq!(sim.row_count, 4);
    run(&mut chosen, "INFER weight FROM people USING MODELS 2 WITH CONFIDENCE 0.5");

    let err = chosen
        .execute_script("SELECT TYPICALITY FROM people USING MODELS 1-7")
        .unwrap_err();
    assert!(matches!(err, EngineError::ModelNotFound { id: 3, .. }));
}

#[test]
fn test_oversized_budgets_and_counts_are_handled() {
    let dir = tempfile::tempdir().unwrap();
    write_people_csv(dir.path());
    let mut engine = engine_in(dir.path(), 19);
    run(&mut engine, SETUP);

    // A deadline beyond the clock still stops at the iteration cap.
    let analyzed = last(&mut engine, "ANALYZE people FOR 18446744073709551615 SECONDS");
    assert_eq!(column(&analyzed, "iterations"), [&json!(25), &json!(25), &json!(25)]);

    let err = engine
        .execute_script("INITIALIZE 18446744073709551615 MODELS FOR people")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuery(_)));
    let models = last(&mut engine, "SHOW MODELS FOR people");
    assert_eq!(models.row_count, 3);
}
