mod common;

use serde_json::json;

use common::*;
use querybridge::compiler::Pattern;
use querybridge::error::Stage;
use querybridge::intent::{Aggregation, ColumnRef, FilterOp, FilterValue, Intent};
use querybridge::pipeline::RunOptions;
use querybridge::{DivergenceCause, QueryBridgeError};

#[tokio::test]
async fn test_customers_per_country() {
    let harness = Harness::new(credit_fixture(), credit_llm());
    let outcome = harness.pipeline().run(COUNTRY_QUESTION, RunOptions::default()).await.unwrap();

    assert_eq!(outcome.query_pair.pattern_used, Pattern::RelationshipLookup);
    assert!(outcome.relational.is_success());
    assert!(outcome.multidimensional.is_success());
    assert_eq!(outcome.relational.row_count(), 9);

    let us = row_for(&outcome.relational.rows, "United States").unwrap();
    assert_eq!(us[1], json!(7));
    let singles = [
        "United Kingdom",
        "Germany",
        "France",
        "Japan",
        "India",
        "Brazil",
        "Canada",
        "Australia",
    ];
    for country in singles {
        let row = row_for(&outcome.relational.rows, country).unwrap();
        assert_eq!(row[1], json!(1), "{}", country);
    }

    let report = &outcome.reconciliation;
    assert!(report.is_match(), "{:?}", report);
    assert_eq!(report.rows, 9);
    assert_eq!(report.divergence_cause, DivergenceCause::None);
}

#[tokio::test]
async fn test_facility_limit_by_industry() {
    let harness = Harness::new(credit_fixture(), credit_llm());
    let outcome = harness.pipeline().run(INDUSTRY_QUESTION, RunOptions::default()).await.unwrap();

    assert_eq!(outcome.query_pair.pattern_used, Pattern::RelationshipLookup);
    assert!(outcome.query_pair.relational.text.contains("LEFT JOIN"));
    assert!(outcome.query_pair.multidimensional.text.contains("LOOKUPVALUE"));

    for (industry, total) in [
        ("Manufacturing", 5_000_000.0),
        ("Oil & Gas", 3_500_000.0),
        ("Real Estate", 2_500_000.0),
    ] {
        let rel = row_for(&outcome.relational.rows, industry).unwrap();
        assert_eq!(rel[1].as_f64(), Some(total), "relational {}", industry);
        let md = row_for(&outcome.multidimensional.rows, industry).unwrap();
        assert_eq!(md[1].as_f64(), Some(total), "model {}", industry);
    }
    assert!(outcome.reconciliation.is_match(), "{:?}", outcome.reconciliation);
    assert_eq!(outcome.reconciliation.rows, 3);
}

#[tokio::test]
async fn test_near_miss_column_name_resolves() {
    let llm = ScriptedLlm::new().answer(
        "limit by industy",
        json!({
            "measure": "facility.limit_amount",
            "aggregation": "sum",
            "group_by": ["customer.industy"]
        }),
    );
    let harness = Harness::new(credit_fixture(), llm);
    let outcome = harness
        .pipeline()
        .run("Total limit by industy", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.intent.group_by[0].column, "industry");
    assert!(outcome.reconciliation.is_match());
}

#[tokio::test]
async fn test_unknown_column_fails_before_any_query_runs() {
    let llm = ScriptedLlm::new().answer(
        "credit rating",
        json!({
            "measure": "facility.limit_amount",
            "aggregation": "sum",
            "group_by": ["customer.credit_rating"]
        }),
    );
    let harness = Harness::new(credit_fixture(), llm);
    let err = harness
        .pipeline()
        .run("Total limit by credit rating", RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Generation));
    match err.root() {
        QueryBridgeError::QueryGeneration(message) => {
            assert!(message.contains("customer.credit_rating"), "{}", message)
        }
        other => panic!("unexpected error {:?}", other),
    }
    // the failure names the question
    assert!(err.to_string().contains("credit rating"));
}

#[tokio::test]
async fn test_unparseable_reply_is_intent_parse_error() {
    let llm = ScriptedLlm::new().answer_text("limits", "Sure! Here are the limits you asked for.");
    let harness = Harness::new(credit_fixture(), llm);
    let err = harness
        .pipeline()
        .run("Show me the limits", RunOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Intent));
    assert!(matches!(err.root(), QueryBridgeError::IntentParse { .. }));
    // first attempt plus one corrective retry
    assert_eq!(harness.llm.calls(), 2);
}

#[tokio::test]
async fn test_repeated_question_uses_cached_intent() {
    let harness = Harness::new(credit_fixture(), credit_llm());
    let pipeline = harness.pipeline();

    let first = pipeline.run(COUNTRY_QUESTION, RunOptions::default()).await.unwrap();
    assert_eq!(harness.llm.calls(), 1);
    let second = pipeline
        .run("  how many customers are there in each COUNTRY? ", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(harness.llm.calls(), 1);
    assert_eq!(first.intent, second.intent);
    assert_eq!(first.query_pair.relational.text, second.query_pair.relational.text);
}

#[tokio::test]
async fn test_filter_matching_nothing_reconciles_empty() {
    let llm = ScriptedLlm::new().answer(
        "defaulted",
        json!({
            "measure": "facility.limit_amount",
            "aggregation": "sum",
            "group_by": ["customer.industry"],
            "filters": [{ "column": "facility.status", "op": "=", "value": "Defaulted" }]
        }),
    );
    let harness = Harness::new(credit_fixture(), llm);
    let outcome = harness
        .pipeline()
        .run("Total limit of defaulted facilities by industry", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.relational.row_count(), 0);
    assert_eq!(outcome.multidimensional.row_count(), 0);
    let report = &outcome.reconciliation;
    assert!(report.comparable);
    assert!(report.row_count_match);
    assert_eq!(report.rows, 0);
    assert!(report.is_match());
}

#[tokio::test]
async fn test_generation_is_deterministic() {
    let harness = Harness::new(credit_fixture(), credit_llm());
    let pipeline = harness.pipeline();
    let a = pipeline.run(INDUSTRY_QUESTION, RunOptions::default()).await.unwrap();
    let b = pipeline.run(INDUSTRY_QUESTION, RunOptions::default()).await.unwrap();
    assert_eq!(a.query_pair.pattern_used, b.query_pair.pattern_used);
    assert_eq!(a.query_pair.relational.text, b.query_pair.relational.text);
    assert_eq!(a.query_pair.multidimensional.text, b.query_pair.multidimensional.text);
    assert_ne!(a.run_id, b.run_id);
}

#[tokio::test]
async fn test_blank_measure_is_not_below_threshold() {
    let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
    let intent = Intent::count_rows("facility").group("facility", "status").filter(
        "facility",
        "limit_amount",
        FilterOp::Lt,
        FilterValue::Number(600_000.0),
    );
    let run = harness.run_intent(&intent).await;

    assert!(run.pair.multidimensional.text.contains("NOT ISBLANK"));
    assert_eq!(run.relational.rows, vec![vec![json!("Active"), json!(2)]]);
    assert_eq!(run.multidimensional.rows, vec![vec![json!("Active"), json!(2)]]);
    assert!(run.report.is_match(), "{:?}", run.report);
}

#[tokio::test]
async fn test_count_of_nothing_is_zero() {
    let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
    let intent = Intent::count_rows("facility").filter(
        "facility",
        "status",
        FilterOp::Eq,
        FilterValue::Text("Defaulted".to_string()),
    );
    let run = harness.run_intent(&intent).await;

    assert_eq!(run.relational.rows, vec![vec![json!(0)]]);
    assert_eq!(run.multidimensional.rows, vec![vec![json!(0)]]);
    assert!(run.report.is_match(), "{:?}", run.report);
}

#[tokio::test]
async fn test_text_filter_ignores_case() {
    let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
    let intent = Intent::count_rows("facility").filter(
        "facility",
        "status",
        FilterOp::Eq,
        FilterValue::Text("CLOSED".to_string()),
    );
    let run = harness.run_intent(&intent).await;

    assert_eq!(run.relational.rows, vec![vec![json!(2)]]);
    assert!(run.report.is_match(), "{:?}", run.report);
}

#[tokio::test]
async fn test_contains_matches_percent_literally() {
    let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
    let intent = Intent::count_rows("facility").group("customer", "industry").filter(
        "customer",
        "industry",
        FilterOp::Contains,
        FilterValue::Text("%".to_string()),
    );
    let run = harness.run_intent(&intent).await;

    assert!(run.relational.is_success(), "{:?}", run.relational.error_detail);
    assert_eq!(run.relational.row_count(), 0);
    assert!(run.report.is_match(), "{:?}", run.report);
}

#[tokio::test]
async fn test_all_blank_average_group_is_null_handling() {
    let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
    let intent = Intent::new(
        Aggregation::Avg,
        Some(ColumnRef::new("facility", "limit_amount")),
    )
    .group("facility", "status");
    let run = harness.run_intent(&intent).await;

    let pending = row_for(&run.relational.rows, "Pending").unwrap();
    assert!(pending[1].is_null());
    assert!(row_for(&run.multidimensional.rows, "Pending").is_none());
    assert!(!run.report.is_match());
    assert_eq!(run.report.divergence_cause, DivergenceCause::NullHandlingDifference);
}
