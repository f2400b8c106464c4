use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::VerifyArgs;
use crate::config::RunConfig;
use crate::dataset::load_queries;
use crate::engine::VerificationEngine;
use crate::error::PersistenceError;
use crate::judge::{LlmJudge, OllamaClient};
use crate::model::{VerifyRunManifest, expected_hashes};
use crate::prompt::PromptBuilder;
use crate::signal;
use crate::store::{ArtifactSummary, ResultStore};
use crate::util::{now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

pub fn run(args: VerifyArgs, cancel: &AtomicBool) -> Result<()> {
    let started = Instant::now();
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("verify-{}", utc_compact_string(started_ts));

    let config = RunConfig::from_args(&args).context("invalid verify configuration")?;
    let strip_diacritics = config.store.strip_diacritics;

    let prompts = PromptBuilder::load(strip_diacritics, config.prompt_template.as_deref())?;

    let mut queries = load_queries(&config.input_path, strip_diacritics)?;
    if let Some(limit) = config.limit {
        queries.truncate(limit);
    }
    let input_sha256 = sha256_file(&config.input_path)?;

    info!(
        run_id = %run_id,
        input = %config.input_path.display(),
        model = %config.judge.model_name,
        base_url = %config.judge.base_url,
        strip_diacritics,
        results_dir = %config.store.results_dir.display(),
        "starting verify"
    );

    let mut store = ResultStore::open(config.store.clone())?;
    let client = OllamaClient::new(&config.judge)?;
    let engine = VerificationEngine::new(
        LlmJudge::new(client, config.judge.retry.clone()),
        prompts,
        config.tie_break,
        config.concurrency,
    );

    let summary = engine.run(&queries, &mut store, cancel)?;
    let counts = summary.counts;
    if summary.cancelled {
        signal::report_shutdown();
    }

    let expected = expected_hashes(&queries, engine.settings());
    let artifact = finalize_unless_aborted(&store, summary.fatal.as_ref(), &expected)?;

    let mut warnings = Vec::<String>::new();
    if counts.failed > 0 {
        warnings.push(format!("{} queries failed and will be retried on the next run", counts.failed));
    }
    if counts.persist_errors > 0 {
        warnings.push(format!(
            "{} records could not be persisted and will be retried on the next run",
            counts.persist_errors
        ));
    }
    if counts.abandoned > 0 {
        warnings.push(format!("{} queries were abandoned", counts.abandoned));
    }
    if let Some(err) = &summary.fatal {
        warnings.push(format!("run aborted: {err}"));
    }
    if let Some(artifact) = &artifact {
        if artifact.pending > 0 {
            warnings.push(format!(
                "{} input queries have no current record and are missing from the artifact",
                artifact.pending
            ));
        }
        if artifact.excluded > 0 {
            warnings.push(format!(
                "{} checkpoint records are not part of this input and were not exported",
                artifact.excluded
            ));
        }
    }

    let status = if summary.fatal.is_some() {
        "aborted"
    } else if summary.cancelled {
        "cancelled"
    } else {
        "completed"
    };

    let manifest_path = config
        .store
        .results_dir
        .join(format!("verify_run_{}.json", utc_compact_string(started_ts)));
    let manifest = VerifyRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        started_at,
        finished_at: now_utc_string(),
        status: status.to_string(),
        model_name: config.judge.model_name.clone(),
        base_url: config.judge.base_url.to_string(),
        strip_diacritics,
        max_retries: config.judge.retry.max_attempts,
        concurrency: config.concurrency,
        tie_break: config.tie_break.as_str().to_string(),
        input_path: config.input_path.display().to_string(),
        input_sha256,
        checkpoint_path: store.checkpoint_path().display().to_string(),
        artifact_path: artifact
            .as_ref()
            .map(|artifact| artifact.path.display().to_string()),
        counts,
        duration_ms: started.elapsed().as_millis(),
        warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote verify run manifest");

    info!(
        run_id = %run_id,
        status,
        total = counts.total_queries,
        skipped = counts.skipped,
        completed = counts.completed,
        failed = counts.failed,
        uncertain = counts.uncertain,
        matched = counts.matched,
        abandoned = counts.abandoned,
        reused_verdicts = counts.reused_verdicts,
        "verify finished"
    );

    if let Some(err) = summary.fatal {
        return Err(anyhow::Error::new(err).context("verification run aborted"));
    }
    if summary.cancelled {
        warn!("rerun verify to continue from the checkpoint");
        bail!("verification interrupted before all queries finished");
    }

    Ok(())
}

/// An aborted run leaves the previous artifact in place rather than exporting
/// from a checkpoint that can no longer be trusted.
fn finalize_unless_aborted(
    store: &ResultStore,
    fatal: Option<&PersistenceError>,
    expected: &BTreeMap<String, String>,
) -> Result<Option<ArtifactSummary>> {
    if let Some(err) = fatal {
        warn!(error = %err, "skipping artifact export after checkpoint failure");
        return Ok(None);
    }
    Ok(Some(store.finalize(expected)?))
}
