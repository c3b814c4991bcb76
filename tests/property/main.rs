use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use runbridge::engine::{TestTarget, dedup_targets};
use runbridge::execution::{DeferredExecution, ExecutionState, Failure};
use runbridge::session::{EmissionPolicy, ProcessingOptions, TestEventProcessor};
use runbridge::types::{TargetKind, TestStatus};
use runbridge_test_utils::RecordingSink;
use runbridge_test_utils::builders::ResultBuilder;

#[derive(Debug, Clone)]
enum Op {
    Start(u8),
    End(u8),
    Fail,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u8>().prop_map(Op::Start),
        any::<u8>().prop_map(Op::End),
        Just(Op::Fail),
    ]
}

/// What the execution should look like after `ops`: each phase settles once,
/// and `end` is ignored until started.
fn model(ops: &[Op]) -> ExecutionState<u8, u8> {
    let mut state = ExecutionState::Pending;
    for op in ops {
        state = match (state, op) {
            (ExecutionState::Pending, Op::Start(v)) => ExecutionState::Started(*v),
            (ExecutionState::Pending, Op::Fail) => ExecutionState::StartFailed(Failure::error("x")),
            (ExecutionState::Started(s), Op::End(v)) => ExecutionState::Ended(s, *v),
            (ExecutionState::Started(s), Op::Fail) => ExecutionState::EndFailed(s, Failure::error("x")),
            (other, _) => other,
        };
    }
    state
}

// Small suite/test forest: suites "s0".."s3", tests "t0".."t7", each test
// optionally nested in one suite.
fn target_strategy() -> impl Strategy<Value = TestTarget> {
    prop_oneof![
        (0..4usize).prop_map(|i| TestTarget::suite(format!("s{i}"), format!("s{i}"))),
        (0..8usize, proptest::option::of(0..4usize)).prop_map(|(i, parent)| {
            let target = TestTarget::test(format!("t{i}"), format!("t{i}"));
            match parent {
                Some(p) => target.with_ancestors([format!("s{p}")]),
                None => target,
            }
        }),
    ]
}

proptest! {
    #[test]
    fn execution_phases_settle_once(ops in proptest::collection::vec(op_strategy(), 0..8)) {
        let deferred = DeferredExecution::<u8, u8>::new();
        let execution = deferred.execution();
        for op in &ops {
            match op {
                Op::Start(v) => { deferred.start(*v); }
                Op::End(v) => { deferred.end(*v); }
                Op::Fail => { deferred.fail(Failure::error("x")); }
            }
        }
        prop_assert_eq!(execution.state(), model(&ops));
    }

    #[test]
    fn dedup_keeps_only_uncovered_unique_targets(
        targets in proptest::collection::vec(target_strategy(), 0..12)
    ) {
        let requested_suites: HashSet<String> = targets
            .iter()
            .filter(|t| t.kind == TargetKind::Suite)
            .map(|t| t.id.clone())
            .collect();

        let kept = dedup_targets(&targets);

        let mut ids = HashSet::new();
        for target in &kept {
            prop_assert!(ids.insert(target.id.clone()), "duplicate {}", target.id);
            prop_assert!(!target.ancestor_ids.iter().any(|a| requested_suites.contains(a)));
        }
        // Every dropped target is covered by a suite or repeats a kept id.
        for target in &targets {
            let covered = target.ancestor_ids.iter().any(|a| requested_suites.contains(a));
            prop_assert!(covered || ids.contains(&target.id));
        }
    }

    #[test]
    fn session_records_only_requested_names(
        results in proptest::collection::vec((0..3usize, 0..6usize), 0..12),
        filter in proptest::collection::vec(0..3usize, 0..3),
    ) {
        let suites = ["Calc", "Parser", "Render"];
        let filter: Vec<String> = filter.iter().map(|i| suites[*i].to_string()).collect();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let snapshot = runtime.block_on(async {
            let sink = Arc::new(RecordingSink::default());
            let processor = TestEventProcessor::new(sink);
            let conclusion = processor.begin(
                filter.clone(),
                ProcessingOptions::new(EmissionPolicy::silent(), None),
            );
            for (suite, test) in &results {
                let id = format!("{suite}-{test}");
                processor.on_result(
                    ResultBuilder::new(&id, &[suites[*suite]], &format!("case {test}"))
                        .status(TestStatus::Passed)
                        .build(),
                );
            }
            processor.conclude();
            conclusion.await
        }).unwrap();

        let expected: HashSet<String> = results
            .iter()
            .filter(|(suite, _)| filter.is_empty() || filter.iter().any(|f| f == suites[*suite]))
            .map(|(suite, test)| format!("{suite}-{test}"))
            .collect();
        let recorded: HashSet<String> = snapshot.results.iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(recorded, expected);
        prop_assert!(snapshot.summary.is_none());
    }
}
