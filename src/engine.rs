use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, error, info, warn};

use crate::cli::AdjacencyTieBreak;
use crate::error::PersistenceError;
use crate::judge::{CompletionClient, LlmJudge};
use crate::merge::merge_candidates;
use crate::model::{
    CandidateGroup, Evaluation, FailureDetail, Query, RecordStatus, RunCounts, Stage, Verdict,
    VerdictLabel, VerificationRecord,
};
use crate::prompt::PromptBuilder;
use crate::store::ResultStore;
use crate::util::{now_utc_string, sha256_hex};

pub struct VerificationEngine<C> {
    judge: LlmJudge<C>,
    prompts: PromptBuilder,
    tie_break: AdjacencyTieBreak,
    settings: String,
    concurrency: usize,
}

#[derive(Debug)]
pub struct RunSummary {
    pub counts: RunCounts,
    pub cancelled: bool,
    /// Set when the checkpoint stopped accepting writes and the run was cut short.
    pub fatal: Option<PersistenceError>,
}

struct StopFlags<'a> {
    cancel: &'a AtomicBool,
    abort: AtomicBool,
}

impl StopFlags<'_> {
    fn raised(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abort.load(Ordering::SeqCst)
    }
}

impl<C: CompletionClient> VerificationEngine<C> {
    pub fn new(
        judge: LlmJudge<C>,
        prompts: PromptBuilder,
        tie_break: AdjacencyTieBreak,
        concurrency: usize,
    ) -> Self {
        Self {
            settings: settings_fingerprint(tie_break, &prompts),
            judge,
            prompts,
            tie_break,
            concurrency: concurrency.max(1),
        }
    }

    /// Run-wide part of every query's `input_hash`.
    pub fn settings(&self) -> &str {
        &self.settings
    }

    /// Verifies every query that has no up-to-date completed record in `store`.
    ///
    /// Workers judge queries in parallel; this thread is the only one writing to the
    /// store. Raising `cancel` stops new work and abandons queries mid-flight.
    pub fn run(
        &self,
        queries: &[Query],
        store: &mut ResultStore,
        cancel: &AtomicBool,
    ) -> Result<RunSummary, PersistenceError> {
        let existing = store.load()?;
        let mut counts = RunCounts {
            total_queries: queries.len(),
            ..RunCounts::default()
        };

        let mut pending = Vec::<Job<'_>>::new();
        for query in queries {
            let input_hash = query.input_hash(&self.settings);
            if existing.is_done(query, &input_hash) {
                counts.skipped += 1;
                continue;
            }
            let previous = existing.get(&query.id);
            if let Some(previous) = previous {
                debug!(
                    query_id = %query.id,
                    previous_status = previous.status.as_str(),
                    stale = previous.input_hash != input_hash,
                    "query will be verified again"
                );
            }
            pending.push(Job {
                query,
                input_hash,
                previous,
            });
        }

        info!(
            total = counts.total_queries,
            skipped = counts.skipped,
            pending = pending.len(),
            workers = self.concurrency,
            "starting verification"
        );

        let flags = StopFlags {
            cancel,
            abort: AtomicBool::new(false),
        };
        let mut fatal = None::<PersistenceError>;
        let pending_count = pending.len();

        thread::scope(|scope| {
            let (job_tx, job_rx) = bounded::<Job<'_>>(self.concurrency * 2);
            let (record_tx, record_rx) = bounded::<VerificationRecord>(self.concurrency * 2);

            let flags = &flags;
            scope.spawn(move || {
                for job in pending {
                    if flags.raised() || job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            for worker in 0..self.concurrency {
                let job_rx = job_rx.clone();
                let record_tx = record_tx.clone();
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        if flags.raised() {
                            break;
                        }
                        let query = job.query;
                        match self.verify_query(job, flags) {
                            Some(record) => {
                                if record_tx.send(record).is_err() {
                                    break;
                                }
                            }
                            None => debug!(worker, query_id = %query.id, "query abandoned"),
                        }
                    }
                });
            }
            drop(job_rx);
            drop(record_tx);

            for record in record_rx.iter() {
                if fatal.is_some() {
                    continue;
                }

                match store.save(&record) {
                    Ok(()) => {
                        tally(&mut counts, &record);
                        info!(
                            query_id = %record.query_id,
                            status = record.status.as_str(),
                            best_match = record
                                .best_match
                                .as_ref()
                                .map(|group| group.label.as_str())
                                .unwrap_or("-"),
                            judged = record.evaluations.len(),
                            reused = record
                                .evaluations
                                .iter()
                                .filter(|evaluation| evaluation.reused)
                                .count(),
                            "query verified"
                        );
                    }
                    Err(err) if err.integrity_intact() => {
                        counts.persist_errors += 1;
                        warn!(
                            query_id = %record.query_id,
                            error = %err,
                            "record not persisted, query will be retried on the next run"
                        );
                    }
                    Err(err) => {
                        error!(
                            query_id = %record.query_id,
                            error = %err,
                            "checkpoint unusable, stopping run"
                        );
                        flags.abort.store(true, Ordering::SeqCst);
                        fatal = Some(err);
                    }
                }
            }
        });

        counts.abandoned =
            pending_count - (counts.completed + counts.failed + counts.persist_errors);

        Ok(RunSummary {
            counts,
            cancelled: cancel.load(Ordering::SeqCst),
            fatal,
        })
    }

    #[cfg(test)]
    fn judge_client(&self) -> &C {
        self.judge.client()
    }

    /// Returns `None` when the run was stopped before the query finished.
    ///
    /// Match and no-match verdicts from the previous record are taken over for any
    /// group whose prompt is unchanged; the judge is asked only about the rest.
    fn verify_query(&self, job: Job<'_>, flags: &StopFlags<'_>) -> Option<VerificationRecord> {
        let Job {
            query,
            input_hash,
            previous,
        } = job;
        let mut record = VerificationRecord::pending(query, input_hash);

        let groups = match merge_candidates(query.kind, &query.candidates, self.tie_break) {
            Ok(groups) => groups,
            Err(err) => return Some(fail(record, Stage::Normalized, err.to_string())),
        };

        for group in groups {
            if flags.raised() {
                return None;
            }

            let prompt = match self.prompts.build(query, &group) {
                Ok(prompt) => prompt,
                Err(err) => {
                    let stage = if record.evaluations.is_empty() {
                        Stage::Merged
                    } else {
                        Stage::Judged
                    };
                    return Some(fail(record, stage, err.to_string()));
                }
            };

            let prompt_sha256 = sha256_hex(prompt.as_bytes());
            let reused = previous.and_then(|previous| reusable(previous, &group, &prompt_sha256));
            let evaluation = match reused {
                Some(verdict) => {
                    debug!(
                        query_id = %query.id,
                        candidate = %group.label,
                        verdict = ?verdict.label,
                        "verdict reused"
                    );
                    Evaluation {
                        group,
                        verdict,
                        prompt_sha256,
                        reused: true,
                    }
                }
                None => {
                    let verdict = self.judge.judge(&prompt);
                    debug!(
                        query_id = %query.id,
                        candidate = %group.label,
                        verdict = ?verdict.label,
                        attempts = verdict.attempt_count,
                        "candidate judged"
                    );
                    Evaluation {
                        group,
                        verdict,
                        prompt_sha256,
                        reused: false,
                    }
                }
            };

            let matched = evaluation.verdict.label == VerdictLabel::Match;
            record.evaluations.push(evaluation);
            if matched {
                record.best_match = record
                    .evaluations
                    .last()
                    .map(|evaluation| evaluation.group.clone());
                break;
            }
        }

        record.status = RecordStatus::Completed;
        record.updated_at = now_utc_string();
        Some(record)
    }
}

struct Job<'a> {
    query: &'a Query,
    input_hash: String,
    previous: Option<&'a VerificationRecord>,
}

/// Fingerprint of the run settings that shape prompts: grouping and templates.
pub fn settings_fingerprint(tie_break: AdjacencyTieBreak, prompts: &PromptBuilder) -> String {
    format!(
        "tie_break={};prompts={}",
        tie_break.as_str(),
        prompts.fingerprint()
    )
}

fn reusable(
    previous: &VerificationRecord,
    group: &CandidateGroup,
    prompt_sha256: &str,
) -> Option<Verdict> {
    previous
        .evaluations
        .iter()
        .find(|evaluation| {
            !evaluation.prompt_sha256.is_empty()
                && evaluation.prompt_sha256 == prompt_sha256
                && evaluation.group == *group
                && evaluation.verdict.label != VerdictLabel::Uncertain
        })
        .map(|evaluation| evaluation.verdict.clone())
}

fn fail(mut record: VerificationRecord, stage: Stage, message: String) -> VerificationRecord {
    warn!(query_id = %record.query_id, stage = ?stage, error = %message, "query failed");
    record.status = RecordStatus::Failed;
    record.failure = Some(FailureDetail {
        last_successful_stage: stage,
        message,
    });
    record.updated_at = now_utc_string();
    record
}

fn tally(counts: &mut RunCounts, record: &VerificationRecord) {
    match record.status {
        RecordStatus::Completed => counts.completed += 1,
        RecordStatus::Failed => counts.failed += 1,
        RecordStatus::Pending => {}
    }
    if record.is_uncertain() {
        counts.uncertain += 1;
    }
    if record.best_match.is_some() {
        counts.matched += 1;
    }
    counts.reused_verdicts += record
        .evaluations
        .iter()
        .filter(|evaluation| evaluation.reused)
        .count();
}

#[cfg(test)]
mod tests;
