use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize::normalize;

pub const MAX_CANDIDATES_PER_QUERY: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    #[default]
    Ayah,
    Hadith,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ayah => "ayah",
            Self::Hadith => "hadith",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub source_id: String,
    pub text: String,
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_key: Option<i64>,
}

impl Candidate {
    /// Chapter (or collection) part of `source_id`, e.g. `112` for `112:2`.
    pub fn source(&self) -> &str {
        self.source_id
            .split_once(':')
            .map(|(source, _)| source.trim())
            .unwrap_or_else(|| self.source_id.trim())
    }

    pub fn resolved_sequence_key(&self) -> Option<i64> {
        self.sequence_key.or_else(|| {
            self.source_id
                .split_once(':')
                .and_then(|(_, number)| number.trim().parse::<i64>().ok())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryInput {
    pub query_id: String,
    pub query_text: String,
    #[serde(default)]
    pub kind: QueryKind,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: String,
    pub text: String,
    pub normalized_text: String,
    pub kind: QueryKind,
    pub candidates: Vec<Candidate>,
}

impl Query {
    pub fn from_input(input: QueryInput, strip_diacritics: bool) -> Self {
        let normalized_text = normalize(&input.query_text, strip_diacritics);
        Self {
            id: input.query_id,
            text: input.query_text,
            normalized_text,
            kind: input.kind,
            candidates: input.candidates,
        }
    }

    /// Fingerprint of everything that influences the verdicts for this query.
    ///
    /// `settings` covers run-wide inputs such as grouping and prompt templates.
    pub fn input_hash(&self, settings: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(settings.as_bytes());
        hasher.update([0_u8]);
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0_u8]);
        hasher.update(self.text.as_bytes());
        for candidate in &self.candidates {
            hasher.update([0_u8]);
            hasher.update(candidate.rank.to_le_bytes());
            hasher.update(candidate.source_id.as_bytes());
            hasher.update([0_u8]);
            hasher.update(candidate.sequence_key.unwrap_or(i64::MIN).to_le_bytes());
            hasher.update(candidate.text.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateGroup {
    pub label: String,
    pub source: String,
    pub best_rank: u32,
    pub text: String,
    pub members: Vec<Candidate>,
}

impl CandidateGroup {
    pub fn singleton(candidate: Candidate) -> Self {
        Self {
            label: candidate.source_id.clone(),
            source: candidate.source().to_string(),
            best_rank: candidate.rank,
            text: candidate.text.clone(),
            members: vec![candidate],
        }
    }

    pub fn is_merged(&self) -> bool {
        self.members.len() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictLabel {
    Match,
    NoMatch,
    Uncertain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: VerdictLabel,
    pub raw_response: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub group: CandidateGroup,
    pub verdict: Verdict,
    /// SHA-256 of the exact prompt the verdict answers.
    #[serde(default)]
    pub prompt_sha256: String,
    /// Taken over from an earlier run instead of asking the judge again.
    #[serde(default)]
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Last pipeline stage a query got through before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalized,
    Merged,
    Judged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub last_successful_stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub query_id: String,
    pub query_text: String,
    pub kind: QueryKind,
    pub input_hash: String,
    pub status: RecordStatus,
    pub evaluations: Vec<Evaluation>,
    pub best_match: Option<CandidateGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    pub updated_at: String,
}

impl VerificationRecord {
    pub fn pending(query: &Query, input_hash: String) -> Self {
        Self {
            query_id: query.id.clone(),
            query_text: query.text.clone(),
            kind: query.kind,
            input_hash,
            status: RecordStatus::Pending,
            evaluations: Vec::new(),
            best_match: None,
            failure: None,
            updated_at: String::new(),
        }
    }

    /// Completed without a match while at least one verdict stayed undecided.
    pub fn is_uncertain(&self) -> bool {
        self.status == RecordStatus::Completed
            && self.best_match.is_none()
            && self
                .evaluations
                .iter()
                .any(|evaluation| evaluation.verdict.label == VerdictLabel::Uncertain)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    records: BTreeMap<String, VerificationRecord>,
}

impl ResultSet {
    pub fn insert(&mut self, record: VerificationRecord) {
        self.records.insert(record.query_id.clone(), record);
    }

    pub fn get(&self, query_id: &str) -> Option<&VerificationRecord> {
        self.records.get(query_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in query id order.
    pub fn records(&self) -> impl Iterator<Item = &VerificationRecord> {
        self.records.values()
    }

    /// True when the query already has a completed record built from identical input.
    pub fn is_done(&self, query: &Query, input_hash: &str) -> bool {
        self.records
            .get(&query.id)
            .map(|record| record.status == RecordStatus::Completed && record.input_hash == input_hash)
            .unwrap_or(false)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            match record.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::Completed => counts.completed += 1,
                RecordStatus::Failed => counts.failed += 1,
            }
            if record.is_uncertain() {
                counts.uncertain += 1;
            }
            if record.best_match.is_some() {
                counts.matched += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub uncertain: usize,
    pub matched: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total_queries: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub uncertain: usize,
    pub matched: usize,
    pub abandoned: usize,
    pub persist_errors: usize,
    #[serde(default)]
    pub reused_verdicts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub model_name: String,
    pub base_url: String,
    pub strip_diacritics: bool,
    pub max_retries: u32,
    pub concurrency: usize,
    pub tie_break: String,
    pub input_path: String,
    pub input_sha256: String,
    pub checkpoint_path: String,
    pub artifact_path: Option<String>,
    pub counts: RunCounts,
    pub duration_ms: u128,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultArtifact<'a> {
    pub artifact_version: u32,
    pub generated_at: String,
    pub model_name: &'a str,
    pub strip_diacritics: bool,
    pub record_count: usize,
    pub records: Vec<&'a VerificationRecord>,
    /// Input queries without a record that matches the current input.
    pub pending_query_ids: Vec<&'a str>,
}

/// Expected `input_hash` for every query of one input under one settings fingerprint.
pub fn expected_hashes(queries: &[Query], settings: &str) -> BTreeMap<String, String> {
    queries
        .iter()
        .map(|query| (query.id.clone(), query.input_hash(settings)))
        .collect()
}
