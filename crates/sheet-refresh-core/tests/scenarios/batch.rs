//! Batch behavior across mixed outcomes.

use std::sync::Arc;

use crate::{runner, FakeEngine, FileScript};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sheet_refresh_core::{
    BatchItem, CancelToken, Completion, ErrorKind, RefreshSettings, RefreshStatus,
};

#[test]
fn test_one_success_one_locked() {
    let engine = Arc::new(
        FakeEngine::new()
            .script("a.xlsx", FileScript::rows([100, 150, 150, 150, 150]))
            .script("b.xlsx", FileScript::locked()),
    );

    let batch = runner(&engine, RefreshSettings::default())
        .run(&["a.xlsx".into(), "b.xlsx".into()], &CancelToken::new());

    let summary: Vec<_> = batch
        .results
        .iter()
        .map(|r| (r.path.to_string_lossy().into_owned(), r.status, r.added_rows))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("a.xlsx".to_string(), RefreshStatus::Success, 50),
            ("b.xlsx".to_string(), RefreshStatus::Error, 0),
        ]
    );
    assert_eq!(batch.results[0].rows_before, 100);
    assert_eq!(batch.results[0].rows_after, 150);
    assert!(batch.results[1].message.contains("locked"));
    assert_eq!(batch.succeeded_count, 1);
    assert_eq!(batch.failed_count, 1);
    assert_eq!(engine.closed(), 2);
}

#[test]
fn test_empty_batch() {
    let engine = Arc::new(FakeEngine::new());
    let batch = runner(&engine, RefreshSettings::default()).run(&[], &CancelToken::new());

    assert!(batch.results.is_empty());
    assert_eq!((batch.succeeded_count, batch.failed_count, batch.skipped_count), (0, 0, 0));
    assert_eq!(engine.created(), 0);
    assert!(batch.finished_at >= batch.started_at);
}

#[test]
fn test_missing_file_reports_not_found() {
    let engine = Arc::new(FakeEngine::new().script("gone.xlsx", FileScript::missing()));
    let batch = runner(&engine, RefreshSettings::default())
        .run(&["/reports/gone.xlsx".into()], &CancelToken::new());

    assert_eq!(batch.results[0].status, RefreshStatus::Error);
    assert_eq!(batch.results[0].error_kind, Some(ErrorKind::FileNotFound));
    assert_eq!(engine.closed(), 1);
}

#[test]
fn test_timeout_is_never_success() {
    let engine = Arc::new(FakeEngine::new().script("slow.xlsx", FileScript::growing()));
    let settings = RefreshSettings {
        timeout_seconds: 60,
        ..Default::default()
    };

    let batch = runner(&engine, settings).run(&["slow.xlsx".into()], &CancelToken::new());

    let result = &batch.results[0];
    assert_eq!(result.status, RefreshStatus::TimedOut);
    assert_eq!(result.completion, Some(Completion::TimedOut));
    assert_eq!(result.added_rows, result.rows_after as i64 - result.rows_before as i64);
    assert_eq!(batch.failed_count, 1);
}

#[test]
fn test_batch_serializes_to_json() {
    let engine = Arc::new(FakeEngine::new().script("a.xlsx", FileScript::rows([3, 5])));
    let batch = runner(&engine, RefreshSettings::default()).run(
        &[BatchItem::excluded("old.xlt", "unsupported file type"), "a.xlsx".into()],
        &CancelToken::new(),
    );

    let json = serde_json::to_value(&batch).unwrap();
    assert_eq!(json["succeeded_count"], 1);
    assert_eq!(json["skipped_count"], 1);
    assert_eq!(json["results"][0]["status"], "skipped");
    assert_eq!(json["results"][1]["added_rows"], 2);
    assert_eq!(json["results"][1]["completion"], "stable");
}

#[derive(Debug, Clone)]
enum Outcome {
    Success { before: u64, after: u64 },
    Locked,
    SaveFails,
    TimesOut,
    Excluded,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        (0u64..500, 0u64..500).prop_map(|(before, after)| Outcome::Success { before, after }),
        Just(Outcome::Locked),
        Just(Outcome::SaveFails),
        Just(Outcome::TimesOut),
        Just(Outcome::Excluded),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_results_match_input_order_and_sessions_close(outcomes in proptest::collection::vec(outcome(), 0..8)) {
        let mut engine = FakeEngine::new();
        let mut items = Vec::new();
        for (i, outcome) in outcomes.iter().enumerate() {
            let name = format!("file{i}.xlsx");
            match outcome {
                Outcome::Success { before, after } => {
                    engine = engine.script(&name, FileScript::rows([*before, *after]));
                }
                Outcome::Locked => engine = engine.script(&name, FileScript::locked()),
                Outcome::SaveFails => {
                    engine = engine.script(&name, FileScript::rows([1]).save_fails());
                }
                Outcome::TimesOut => engine = engine.script(&name, FileScript::growing()),
                Outcome::Excluded => {
                    items.push(BatchItem::excluded(&name, "disabled"));
                    continue;
                }
            }
            items.push(BatchItem::new(&name).with_timeout(20));
        }
        let engine = Arc::new(engine);

        let batch = runner(&engine, RefreshSettings::default()).run(&items, &CancelToken::new());

        prop_assert_eq!(batch.results.len(), outcomes.len());
        for (item, result) in items.iter().zip(&batch.results) {
            prop_assert_eq!(&item.path, &result.path);
            prop_assert_eq!(result.added_rows, result.rows_after as i64 - result.rows_before as i64);
        }
        for (outcome, result) in outcomes.iter().zip(&batch.results) {
            let expected = match outcome {
                Outcome::Success { .. } => RefreshStatus::Success,
                Outcome::Locked | Outcome::SaveFails => RefreshStatus::Error,
                Outcome::TimesOut => RefreshStatus::TimedOut,
                Outcome::Excluded => RefreshStatus::Skipped,
            };
            prop_assert_eq!(result.status, expected);
            if let Outcome::Success { before, after } = outcome {
                prop_assert_eq!(result.added_rows, *after as i64 - *before as i64);
            }
        }
        prop_assert_eq!(
            batch.succeeded_count + batch.failed_count + batch.skipped_count,
            outcomes.len()
        );
        prop_assert_eq!(engine.created(), engine.closed());
        prop_assert_eq!(engine.opened().len(), engine.created());
    }
}
