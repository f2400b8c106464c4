use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientJudgeError {
    #[error("connection to llm service failed: {0}")]
    Connection(String),

    #[error("llm request timed out: {0}")]
    Timeout(String),

    #[error("llm service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed llm response: {0}")]
    Malformed(String),

    #[error("llm returned an empty response")]
    Empty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("template '{template}' references unknown variable '{{{variable}}}'")]
    UnknownTemplateVariable { template: String, variable: String },

    #[error("template '{template}' is missing required variable '{{{variable}}}'")]
    MissingTemplateVariable { template: String, variable: String },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("checkpoint write for query {query_id} was rolled back")]
    RolledBack {
        query_id: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to serialize record for query {query_id}")]
    Serialize {
        query_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("refusing to persist record for query {query_id} while it is still pending")]
    PendingRecord { query_id: String },

    #[error("checkpoint database {path} is unusable")]
    Checkpoint {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create results directory {path}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode result artifact {path}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write result artifact {path}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PersistenceError {
    /// Whether everything saved before this error is still durable and readable.
    pub fn integrity_intact(&self) -> bool {
        match self {
            Self::RolledBack { .. }
            | Self::Serialize { .. }
            | Self::PendingRecord { .. }
            | Self::Encode { .. } => true,
            Self::Checkpoint { .. } | Self::Directory { .. } | Self::Artifact { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeInvariantViolation {
    #[error("rank {rank} appears more than once in the candidate list")]
    DuplicateRank { rank: u32 },

    #[error("candidate {source_id} (rank {rank}) is missing from the merged groups")]
    Dropped { source_id: String, rank: u32 },

    #[error("candidate {source_id} (rank {rank}) appears in more than one merged group")]
    Duplicated { source_id: String, rank: u32 },

    #[error("merged group {label} contains a candidate not present in the input (rank {rank})")]
    Untraceable { label: String, rank: u32 },

    #[error("merged group {label} is not contiguous within a single source")]
    NonContiguous { label: String },

    #[error("merged group {label} text does not contain every member text")]
    Truncated { label: String },
}
