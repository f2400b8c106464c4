use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::model::{MAX_CANDIDATES_PER_QUERY, Query, QueryInput};

pub fn load_queries(path: &Path, strip_diacritics: bool) -> Result<Vec<Query>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let inputs: Vec<QueryInput> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let queries = parse_inputs(inputs, strip_diacritics)
        .with_context(|| format!("invalid input artifact {}", path.display()))?;

    info!(
        path = %path.display(),
        queries = queries.len(),
        candidates = queries.iter().map(|query| query.candidates.len()).sum::<usize>(),
        "loaded input queries"
    );

    Ok(queries)
}

fn parse_inputs(inputs: Vec<QueryInput>, strip_diacritics: bool) -> Result<Vec<Query>> {
    let mut seen = HashSet::<String>::new();
    let mut queries = Vec::with_capacity(inputs.len());

    for input in inputs {
        if input.query_id.trim().is_empty() {
            bail!("query with empty query_id");
        }
        if !seen.insert(input.query_id.clone()) {
            bail!("duplicate query_id '{}'", input.query_id);
        }
        if input.candidates.len() > MAX_CANDIDATES_PER_QUERY {
            bail!(
                "query '{}' has {} candidates, at most {} are allowed",
                input.query_id,
                input.candidates.len(),
                MAX_CANDIDATES_PER_QUERY
            );
        }
        if let Some(candidate) = input.candidates.iter().find(|candidate| {
            candidate.rank == 0 || candidate.rank as usize > MAX_CANDIDATES_PER_QUERY
        }) {
            bail!(
                "query '{}' candidate '{}' has rank {}, ranks must be within 1..={}",
                input.query_id,
                candidate.source_id,
                candidate.rank,
                MAX_CANDIDATES_PER_QUERY
            );
        }

        queries.push(Query::from_input(input, strip_diacritics));
    }

    Ok(queries)
}
