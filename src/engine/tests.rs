use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::GzDecoder;

use super::*;
use crate::config::StoreConfig;
use crate::error::TransientJudgeError;
use crate::judge::RetryPolicy;
use crate::model::{Candidate, QueryInput, QueryKind, VerdictLabel, expected_hashes};
use crate::normalize::normalize;

/// Answers `True` for prompts containing `match_marker` and logs every prompt.
struct MarkerClient {
    match_marker: String,
    prompts: Mutex<Vec<String>>,
    cancel_after_call: Option<Arc<AtomicBool>>,
}

impl MarkerClient {
    fn new(match_marker: &str) -> Self {
        Self {
            match_marker: match_marker.to_string(),
            prompts: Mutex::new(Vec::new()),
            cancel_after_call: None,
        }
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl CompletionClient for MarkerClient {
    fn complete(&self, prompt: &str) -> Result<String, TransientJudgeError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(cancel) = &self.cancel_after_call {
            cancel.store(true, Ordering::SeqCst);
        }
        if prompt.contains(&self.match_marker) {
            Ok("True".to_string())
        } else {
            Ok("False".to_string())
        }
    }
}

fn engine(client: MarkerClient, concurrency: usize) -> VerificationEngine<MarkerClient> {
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };
    VerificationEngine::new(
        LlmJudge::new(client, retry),
        PromptBuilder::new(true).unwrap(),
        AdjacencyTieBreak::MostRecent,
        concurrency,
    )
}

fn candidate(source_id: &str, text: &str, rank: u32) -> Candidate {
    Candidate {
        source_id: source_id.to_string(),
        text: text.to_string(),
        rank,
        sequence_key: None,
    }
}

fn query(id: &str, text: &str, candidates: Vec<Candidate>) -> Query {
    Query::from_input(
        QueryInput {
            query_id: id.to_string(),
            query_text: text.to_string(),
            kind: QueryKind::Ayah,
            candidates,
        },
        true,
    )
}

fn numbered_queries(count: usize) -> Vec<Query> {
    (1..=count)
        .map(|index| {
            query(
                &format!("q{index:02}"),
                &format!("query {index}"),
                vec![
                    candidate(&format!("{index}:1"), "first", 1),
                    candidate(&format!("{index}:9"), "second", 2),
                ],
            )
        })
        .collect()
}

fn open_store(root: &Path) -> ResultStore {
    ResultStore::open(StoreConfig::resolve(root, "mock-model", true, "results.json.gz").unwrap())
        .unwrap()
}

/// Artifact JSON without the fields that depend on wall-clock time.
fn artifact_without_timestamps(path: &Path) -> serde_json::Value {
    let mut decoder = GzDecoder::new(std::fs::File::open(path).unwrap());
    let mut json = String::new();
    decoder.read_to_string(&mut json).unwrap();
    let mut artifact: serde_json::Value = serde_json::from_str(&json).unwrap();

    artifact.as_object_mut().unwrap().remove("generated_at");
    for record in artifact["records"].as_array_mut().unwrap() {
        record.as_object_mut().unwrap().remove("updated_at");
    }
    artifact
}

#[test]
fn groups_are_judged_in_rank_order_and_stop_at_first_match() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let queries = vec![query(
        "q1",
        "beta",
        vec![
            candidate("2:10", "alpha", 1),
            candidate("3:1", "beta", 2),
            candidate("4:1", "gamma", 3),
        ],
    )];
    let engine = engine(MarkerClient::new("The candidate is 3:1."), 1);

    let summary = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(engine.judge_client().calls(), 2);
    let prompts = engine.judge_client().prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("The candidate is 2:10."));
    assert!(prompts[1].contains("The candidate is 3:1."));

    let results = store.load().unwrap();
    let record = results.get("q1").unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.evaluations.len(), 2);
    assert_eq!(record.evaluations[0].verdict.label, VerdictLabel::NoMatch);
    assert_eq!(record.best_match.as_ref().unwrap().label, "3:1");
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.matched, 1);
    assert!(summary.fatal.is_none());
}

#[test]
fn consecutive_verses_are_judged_as_one_merged_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let queries = vec![query(
        "q1",
        "قل هو الله أحد الله الصمد",
        vec![
            candidate("113:1", "قل أعوذ برب الفلق", 1),
            candidate("112:1", "قل هو الله أحد", 2),
            candidate("112:2", "الله الصمد", 3),
        ],
    )];
    let engine = engine(MarkerClient::new("verses 112:1-2"), 1);

    engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    let results = store.load().unwrap();
    let record = results.get("q1").unwrap();
    let best = record.best_match.as_ref().unwrap();
    assert_eq!(best.label, "112:1-2");
    assert_eq!(best.text, "قل هو الله أحد الله الصمد");
    assert_eq!(best.members.len(), 2);
    assert_eq!(record.evaluations.len(), 2);
    assert_eq!(record.evaluations[0].group.label, "113:1");
    let expected = format!(
        "candidate_text: {}\n",
        normalize("قل هو الله أحد الله الصمد", true)
    );
    assert!(engine.judge_client().prompts.lock().unwrap()[1].contains(&expected));
}

#[test]
fn no_match_with_an_undecided_verdict_counts_as_uncertain() {
    struct Hesitant;

    impl CompletionClient for Hesitant {
        fn complete(&self, _prompt: &str) -> Result<String, TransientJudgeError> {
            Ok("I am not sure".to_string())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let engine = VerificationEngine::new(
        LlmJudge::new(
            Hesitant,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        ),
        PromptBuilder::new(true).unwrap(),
        AdjacencyTieBreak::MostRecent,
        1,
    );

    let summary = engine
        .run(&numbered_queries(1), &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.uncertain, 1);
    assert_eq!(summary.counts.matched, 0);
    let results = store.load().unwrap();
    let record = results.get("q01").unwrap();
    assert!(record.best_match.is_none());
    assert_eq!(record.evaluations.len(), 2);
}

#[test]
fn failing_query_is_recorded_and_the_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let mut queries = numbered_queries(2);
    queries.insert(
        1,
        query(
            "q01b",
            "broken",
            vec![candidate("5:1", "a", 1), candidate("6:1", "b", 1)],
        ),
    );
    let engine = engine(MarkerClient::new("never"), 1);

    let summary = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.counts.failed, 1);
    let results = store.load().unwrap();
    let failed = results.get("q01b").unwrap();
    assert_eq!(failed.status, RecordStatus::Failed);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.last_successful_stage, Stage::Normalized);
    assert!(failure.message.contains("rank 1"));

    let rerun = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();
    assert_eq!(rerun.counts.skipped, 2);
    assert_eq!(rerun.counts.failed, 1);
}

#[test]
fn restart_processes_only_unpersisted_queries() {
    let queries = numbered_queries(5);
    let persisted = 2;

    let resumed_dir = tempfile::tempdir().unwrap();
    {
        let mut store = open_store(resumed_dir.path());
        let first = engine(MarkerClient::new("The candidate is 1:9."), 1);
        first
            .run(&queries[..persisted], &mut store, &AtomicBool::new(false))
            .unwrap();
    }

    let mut store = open_store(resumed_dir.path());
    let second = engine(MarkerClient::new("The candidate is 1:9."), 1);
    let summary = second
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(summary.counts.skipped, persisted);
    assert_eq!(summary.counts.completed, queries.len() - persisted);
    let prompts = second.judge_client().prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2 * (queries.len() - persisted));
    assert!(prompts.iter().all(|prompt| !prompt.contains("query 1\n")));
    let resumed_artifact = store
        .finalize(&expected_hashes(&queries, second.settings()))
        .unwrap()
        .path;

    let fresh_dir = tempfile::tempdir().unwrap();
    let mut fresh_store = open_store(fresh_dir.path());
    let fresh = engine(MarkerClient::new("The candidate is 1:9."), 1);
    fresh
        .run(&queries, &mut fresh_store, &AtomicBool::new(false))
        .unwrap();
    let fresh_artifact = fresh_store
        .finalize(&expected_hashes(&queries, fresh.settings()))
        .unwrap()
        .path;

    assert_eq!(
        artifact_without_timestamps(&resumed_artifact),
        artifact_without_timestamps(&fresh_artifact)
    );
}

#[test]
fn changed_input_makes_a_completed_record_stale() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let mut queries = numbered_queries(3);
    engine(MarkerClient::new("never"), 1)
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    queries[1].candidates[0].text = "edited".to_string();
    let again = engine(MarkerClient::new("never"), 1);
    let summary = again
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(summary.counts.skipped, 2);
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.reused_verdicts, 1);
    let prompts = again.judge_client().prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("The candidate is 2:1."));
}

#[test]
fn unchanged_groups_reuse_earlier_verdicts() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let mut queries = vec![query(
        "q1",
        "delta",
        vec![
            candidate("2:1", "alpha", 1),
            candidate("3:1", "beta", 2),
            candidate("4:1", "gamma", 3),
        ],
    )];
    let first = engine(MarkerClient::new("never"), 1);
    first
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();
    assert_eq!(first.judge_client().calls(), 3);

    queries[0].candidates[1].text = "beta revised".to_string();
    let again = engine(MarkerClient::new("never"), 1);
    let summary = again
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    let prompts = again.judge_client().prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("candidate_text: beta revised\n"));
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.reused_verdicts, 2);

    let results = store.load().unwrap();
    let record = results.get("q1").unwrap();
    assert_eq!(record.input_hash, queries[0].input_hash(again.settings()));
    assert_eq!(
        record
            .evaluations
            .iter()
            .map(|evaluation| (evaluation.group.label.as_str(), evaluation.reused))
            .collect::<Vec<(&str, bool)>>(),
        vec![("2:1", true), ("3:1", false), ("4:1", true)]
    );
}

#[test]
fn undecided_verdicts_are_asked_again() {
    struct HesitantOnce {
        calls: Mutex<usize>,
    }

    impl CompletionClient for HesitantOnce {
        fn complete(&self, _prompt: &str) -> Result<String, TransientJudgeError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok("maybe".to_string())
            } else {
                Ok("True".to_string())
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let mut queries = vec![query("q1", "alpha", vec![candidate("2:1", "alpha", 1)])];
    let retry = RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };
    let engine = VerificationEngine::new(
        LlmJudge::new(HesitantOnce { calls: Mutex::new(0) }, retry),
        PromptBuilder::new(true).unwrap(),
        AdjacencyTieBreak::MostRecent,
        1,
    );
    engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    queries[0].candidates.push(candidate("5:1", "omega", 2));
    let summary = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(*engine.judge_client().calls.lock().unwrap(), 2);
    assert_eq!(summary.counts.reused_verdicts, 0);
    assert_eq!(summary.counts.matched, 1);
    let results = store.load().unwrap();
    assert_eq!(results.get("q1").unwrap().best_match.as_ref().unwrap().label, "2:1");
}

#[test]
fn artifact_holds_only_current_records_of_the_latest_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let queries = numbered_queries(3);
    engine(MarkerClient::new("never"), 1)
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    let mut latest = vec![queries[0].clone()];
    latest[0].candidates[0].text = "edited".to_string();
    let again = engine(MarkerClient::new("never"), 1);
    let summary = again
        .run(&latest, &mut store, &AtomicBool::new(true))
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.counts.abandoned, 1);
    assert_eq!(again.judge_client().calls(), 0);

    let artifact = store
        .finalize(&expected_hashes(&latest, again.settings()))
        .unwrap();

    assert_eq!(artifact.exported, 0);
    assert_eq!(artifact.pending, 1);
    assert_eq!(artifact.excluded, 2);
    let json = artifact_without_timestamps(&artifact.path);
    assert_eq!(json["record_count"], 0);
    assert_eq!(json["records"], serde_json::json!([]));
    assert_eq!(json["pending_query_ids"], serde_json::json!(["q01"]));
    assert_eq!(store.load().unwrap().len(), 3);
}

#[test]
fn changed_tie_break_or_template_makes_records_stale() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let queries = numbered_queries(2);
    let first = engine(MarkerClient::new("never"), 1);
    first
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    let earliest = VerificationEngine::new(
        LlmJudge::new(
            MarkerClient::new("never"),
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        ),
        PromptBuilder::new(true).unwrap(),
        AdjacencyTieBreak::Earliest,
        1,
    );
    assert_ne!(earliest.settings(), first.settings());
    let summary = earliest
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();
    assert_eq!(summary.counts.skipped, 0);
    assert_eq!(summary.counts.completed, 2);

    let template = "custom {query} {candidate} {source}";
    let custom = VerificationEngine::new(
        LlmJudge::new(
            MarkerClient::new("never"),
            RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        ),
        PromptBuilder::with_override(true, template).unwrap(),
        AdjacencyTieBreak::Earliest,
        1,
    );
    let summary = custom
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();
    assert_eq!(summary.counts.skipped, 0);
    assert_eq!(custom.judge_client().calls(), 4);
}

#[test]
fn rolled_back_save_is_counted_and_the_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    rusqlite::Connection::open(store.checkpoint_path())
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_q02 BEFORE INSERT ON verification_records
             WHEN NEW.query_id = 'q02'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
    let engine = engine(MarkerClient::new("never"), 1);

    let summary = engine
        .run(&numbered_queries(3), &mut store, &AtomicBool::new(false))
        .unwrap();

    assert!(summary.fatal.is_none());
    assert!(!summary.cancelled);
    assert_eq!(summary.counts.persist_errors, 1);
    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.counts.abandoned, 0);
    assert_eq!(engine.judge_client().calls(), 6);
    let results = store.load().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.get("q02").is_none());
}

#[test]
fn lost_checkpoint_stops_workers_and_reports_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    store
        .connection()
        .pragma_update(None, "query_only", true)
        .unwrap();
    let queries = numbered_queries(40);
    let engine = engine(MarkerClient::new("never"), 2);

    let summary = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    let fatal = summary.fatal.as_ref().unwrap();
    assert!(!fatal.integrity_intact());
    assert!(matches!(fatal, PersistenceError::Checkpoint { .. }));
    assert!(!summary.cancelled);
    assert_eq!(summary.counts.completed, 0);
    assert_eq!(summary.counts.persist_errors, 0);
    assert_eq!(summary.counts.abandoned, queries.len());
    assert!(engine.judge_client().calls() < 2 * queries.len());
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn cancellation_abandons_in_flight_query_without_saving_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let cancel = Arc::new(AtomicBool::new(false));
    let mut client = MarkerClient::new("never");
    client.cancel_after_call = Some(Arc::clone(&cancel));
    let engine = engine(client, 1);

    let summary = engine.run(&numbered_queries(3), &mut store, &cancel).unwrap();

    assert!(summary.cancelled);
    assert_eq!(engine.judge_client().calls(), 1);
    assert_eq!(summary.counts.completed, 0);
    assert_eq!(summary.counts.abandoned, 3);
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn worker_pool_verifies_every_query_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open_store(dir.path());
    let queries = numbered_queries(12);
    let engine = engine(MarkerClient::new(":1."), 4);

    let summary = engine
        .run(&queries, &mut store, &AtomicBool::new(false))
        .unwrap();

    assert_eq!(summary.counts.completed, 12);
    assert_eq!(summary.counts.matched, 12);
    assert_eq!(summary.counts.abandoned, 0);
    assert_eq!(engine.judge_client().calls(), 12);
    let results = store.load().unwrap();
    assert_eq!(results.len(), 12);
    assert!(
        results
            .records()
            .all(|record| record.best_match.as_ref().is_some_and(|group| group.label.ends_with(":1")))
    );
}
