mod common;

use proptest::prelude::*;

use common::*;
use querybridge::intent::{FilterOp, FilterValue, Intent};

const STATUSES: [&str; 5] = ["Active", "Closed", "Pending", "Frozen", "active"];
const OPS: [FilterOp; 6] = [
    FilterOp::Gt,
    FilterOp::Ge,
    FilterOp::Lt,
    FilterOp::Le,
    FilterOp::Eq,
    FilterOp::Ne,
];

#[derive(Debug, Clone, Copy)]
enum Shape {
    Ungrouped,
    ByStatus,
    ByIndustry,
}

fn intent_for(
    sum: bool,
    shape: Shape,
    limit: (usize, i32),
    status: Option<(bool, usize)>,
) -> Intent {
    let mut intent = if sum {
        Intent::sum("facility", "limit_amount")
    } else {
        Intent::count_rows("facility")
    };
    intent = match shape {
        Shape::Ungrouped => intent,
        Shape::ByStatus => intent.group("facility", "status"),
        Shape::ByIndustry => intent.group("customer", "industry"),
    };
    let (op, threshold) = limit;
    intent = intent.filter(
        "facility",
        "limit_amount",
        OPS[op],
        FilterValue::Number(f64::from(threshold)),
    );
    if let Some((equal, i)) = status {
        let op = if equal { FilterOp::Eq } else { FilterOp::Ne };
        let value = FilterValue::Text(STATUSES[i].to_string());
        intent = intent.filter("facility", "status", op, value);
    }
    intent
}

/// The SQL text on SQLite and the DAX on the memory model agree for every
/// comparison, including thresholds at or below zero over a nullable measure.
/// The SQL text also agrees with the plan it was compiled from.
fn engines_agree(intent: &Intent) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let harness = Harness::new(credit_fixture(), ScriptedLlm::new());
        let run = harness.run_intent(intent).await;
        prop_assert!(run.relational.is_success(), "{:?}", run.relational.error_detail);
        // the SQL text computes what the plan says
        prop_assert_eq!(canonical(&run.relational.rows), canonical(&run.planned.rows));
        prop_assert!(run.multidimensional.is_success(), "{:?}", run.multidimensional.error_detail);
        prop_assert!(
            run.report.is_match(),
            "{:?}\n{}\n{}",
            run.report,
            run.pair.relational.text,
            run.pair.multidimensional.text
        );
        Ok(())
    })
}

fn shape() -> impl Strategy<Value = Shape> {
    prop_oneof![Just(Shape::Ungrouped), Just(Shape::ByStatus), Just(Shape::ByIndustry)]
}

fn threshold() -> impl Strategy<Value = i32> {
    prop_oneof![
        Just(0),
        Just(500_000),
        Just(1_000_000),
        -1_000_000i32..2_500_000,
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_filtered_aggregates_reconcile(
        sum in any::<bool>(),
        shape in shape(),
        op in 0usize..OPS.len(),
        threshold in threshold(),
        status in proptest::option::of((any::<bool>(), 0usize..STATUSES.len())),
    ) {
        engines_agree(&intent_for(sum, shape, (op, threshold), status))?;
    }
}
