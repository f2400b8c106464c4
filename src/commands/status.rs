use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::config::StoreConfig;
use crate::model::VerifyRunManifest;
use crate::store::ResultStore;

pub fn run(args: StatusArgs) -> Result<()> {
    let config = StoreConfig::from_args(&args.store)?;
    let checkpoint_path = config.checkpoint_path();
    let artifact_path = config.artifact_path();

    info!(results_dir = %config.results_dir.display(), "status requested");

    if let Some(manifest_path) = latest_run_manifest(&config.results_dir)? {
        let raw = fs::read(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let manifest: VerifyRunManifest = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            started_at = %manifest.started_at,
            finished_at = %manifest.finished_at,
            completed = manifest.counts.completed,
            failed = manifest.counts.failed,
            abandoned = manifest.counts.abandoned,
            duration_ms = manifest.duration_ms as u64,
            "loaded latest verify run manifest"
        );
    } else {
        warn!(results_dir = %config.results_dir.display(), "no verify run manifest found");
    }

    if checkpoint_path.exists() {
        let store = ResultStore::open(config)?;
        let results = store.load()?;
        if results.is_empty() {
            warn!(path = %checkpoint_path.display(), "checkpoint holds no records yet");
        }
        let counts = results.status_counts();

        info!(
            path = %checkpoint_path.display(),
            records = results.len(),
            completed = counts.completed,
            failed = counts.failed,
            pending = counts.pending,
            uncertain = counts.uncertain,
            matched = counts.matched,
            "checkpoint status"
        );
    } else {
        warn!(path = %checkpoint_path.display(), "checkpoint database missing");
    }

    if artifact_path.exists() {
        info!(path = %artifact_path.display(), "result artifact present");
    } else {
        warn!(path = %artifact_path.display(), "result artifact missing");
    }

    Ok(())
}

/// Run manifests carry a compact UTC timestamp, so name order is start order.
fn latest_run_manifest(results_dir: &Path) -> Result<Option<PathBuf>> {
    if !results_dir.exists() {
        return Ok(None);
    }

    let mut latest = None::<PathBuf>;
    for entry in fs::read_dir(results_dir)
        .with_context(|| format!("failed to list {}", results_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to list {}", results_dir.display()))?
            .path();
        let is_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("verify_run_") && name.ends_with(".json"));
        if is_manifest && latest.as_ref().is_none_or(|current| path > *current) {
            latest = Some(path);
        }
    }

    Ok(latest)
}
