use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::ExportArgs;
use crate::config::StoreConfig;
use crate::dataset::load_queries;
use crate::engine::settings_fingerprint;
use crate::model::expected_hashes;
use crate::prompt::PromptBuilder;
use crate::store::ResultStore;

pub fn run(args: ExportArgs) -> Result<()> {
    let config = StoreConfig::from_args(&args.store)?;
    let checkpoint_path = config.checkpoint_path();
    if !checkpoint_path.exists() {
        bail!("no checkpoint found at {}", checkpoint_path.display());
    }

    let strip_diacritics = config.strip_diacritics;
    let prompts = PromptBuilder::load(strip_diacritics, args.input.prompt_template.as_deref())?;
    let mut queries = load_queries(&args.input.input, strip_diacritics)?;
    if let Some(limit) = args.input.limit {
        queries.truncate(limit);
    }
    let expected = expected_hashes(
        &queries,
        &settings_fingerprint(args.input.tie_break, &prompts),
    );

    let store = ResultStore::open(config)?;
    let artifact = store.finalize(&expected)?;

    if artifact.excluded > 0 {
        warn!(
            excluded = artifact.excluded,
            input = %args.input.input.display(),
            "checkpoint holds records for queries outside the input"
        );
    }
    info!(
        path = %artifact.path.display(),
        exported = artifact.exported,
        pending = artifact.pending,
        model = %store.config().model_name,
        strip_diacritics = store.config().strip_diacritics,
        "exported result artifact"
    );
    Ok(())
}
