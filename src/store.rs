use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use rusqlite::{Connection, ErrorCode, params};
use tracing::{info, warn};

use crate::config::{StoreConfig, diacritic_setting};
use crate::error::PersistenceError;
use crate::model::{RecordStatus, ResultArtifact, ResultSet, VerificationRecord};
use crate::util::{atomic_write, now_utc_string};

const CHECKPOINT_SCHEMA_VERSION: &str = "1";
const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub path: PathBuf,
    pub exported: usize,
    /// Input queries with no record matching their current input.
    pub pending: usize,
    /// Checkpoint records for queries that are not part of the input.
    pub excluded: usize,
}

/// Durable, resumable home of verification records for one model/diacritic setting.
///
/// Every `save` is its own SQLite transaction, so a crash never loses a record that
/// was already saved and never leaves a half-written one behind. `finalize` renders
/// the consolidated gzip artifact and swaps it into place atomically.
pub struct ResultStore {
    config: StoreConfig,
    checkpoint_path: PathBuf,
    connection: Connection,
}

impl ResultStore {
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        fs::create_dir_all(&config.results_dir).map_err(|source| PersistenceError::Directory {
            path: config.results_dir.display().to_string(),
            source,
        })?;

        let checkpoint_path = config.checkpoint_path();
        let connection = Connection::open(&checkpoint_path)
            .map_err(|source| checkpoint_error(&checkpoint_path, source))?;
        configure_connection(&connection)
            .map_err(|source| checkpoint_error(&checkpoint_path, source))?;
        ensure_schema(&connection, &config)
            .map_err(|source| checkpoint_error(&checkpoint_path, source))?;

        info!(
            path = %checkpoint_path.display(),
            model = %config.model_name,
            setting = diacritic_setting(config.strip_diacritics),
            "opened result checkpoint"
        );

        Ok(Self {
            config,
            checkpoint_path,
            connection,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn load(&self) -> Result<ResultSet, PersistenceError> {
        let rows = self
            .read_rows()
            .map_err(|source| checkpoint_error(&self.checkpoint_path, source))?;

        let mut results = ResultSet::default();
        for (query_id, record_json) in rows {
            match serde_json::from_str::<VerificationRecord>(&record_json) {
                Ok(record) => results.insert(record),
                Err(err) => warn!(
                    query_id = %query_id,
                    error = %err,
                    "unreadable checkpoint row, query will be verified again"
                ),
            }
        }

        Ok(results)
    }

    pub fn save(&mut self, record: &VerificationRecord) -> Result<(), PersistenceError> {
        if record.status == RecordStatus::Pending {
            return Err(PersistenceError::PendingRecord {
                query_id: record.query_id.clone(),
            });
        }

        let record_json =
            serde_json::to_string(record).map_err(|source| PersistenceError::Serialize {
                query_id: record.query_id.clone(),
                source,
            })?;
        let best_match = record.best_match.as_ref().map(|group| group.label.as_str());

        let tx = self
            .connection
            .transaction()
            .map_err(|source| write_error(&self.checkpoint_path, &record.query_id, source))?;
        tx.execute(
            "
            INSERT INTO verification_records(query_id, status, input_hash, best_match, record_json, updated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(query_id) DO UPDATE SET
              status=excluded.status,
              input_hash=excluded.input_hash,
              best_match=excluded.best_match,
              record_json=excluded.record_json,
              updated_at=excluded.updated_at
            ",
            params![
                record.query_id,
                record.status.as_str(),
                record.input_hash,
                best_match,
                record_json,
                now_utc_string(),
            ],
        )
        .map_err(|source| write_error(&self.checkpoint_path, &record.query_id, source))?;
        tx.commit()
            .map_err(|source| write_error(&self.checkpoint_path, &record.query_id, source))?;

        Ok(())
    }

    /// Writes the gzip artifact for one input, records in query id order.
    ///
    /// `expected` maps every input query id to its current `input_hash`. Only records
    /// built from exactly that input are exported; rows for other queries stay in the
    /// checkpoint, and queries without a current record are listed as pending.
    pub fn finalize(
        &self,
        expected: &BTreeMap<String, String>,
    ) -> Result<ArtifactSummary, PersistenceError> {
        let results = self.load()?;
        let artifact_path = self.config.artifact_path();

        let records = results
            .records()
            .filter(|record| expected.get(&record.query_id) == Some(&record.input_hash))
            .collect::<Vec<&VerificationRecord>>();
        let pending_query_ids = expected
            .iter()
            .filter(|(query_id, input_hash)| {
                results
                    .get(query_id.as_str())
                    .is_none_or(|record| record.input_hash != **input_hash)
            })
            .map(|(query_id, _)| query_id.as_str())
            .collect::<Vec<&str>>();
        let excluded = results
            .records()
            .filter(|record| !expected.contains_key(&record.query_id))
            .count();

        let artifact = ResultArtifact {
            artifact_version: ARTIFACT_VERSION,
            generated_at: now_utc_string(),
            model_name: &self.config.model_name,
            strip_diacritics: self.config.strip_diacritics,
            record_count: records.len(),
            records,
            pending_query_ids,
        };

        let json = serde_json::to_vec(&artifact).map_err(|source| PersistenceError::Encode {
            path: artifact_path.display().to_string(),
            source,
        })?;
        let artifact_io_error = |source| PersistenceError::Artifact {
            path: artifact_path.display().to_string(),
            source,
        };

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::best());
        encoder.write_all(&json).map_err(artifact_io_error)?;
        let compressed = encoder.finish().map_err(artifact_io_error)?;
        atomic_write(&artifact_path, &compressed).map_err(artifact_io_error)?;

        let summary = ArtifactSummary {
            exported: artifact.record_count,
            pending: artifact.pending_query_ids.len(),
            excluded,
            path: artifact_path,
        };
        if summary.pending > 0 {
            warn!(
                pending = summary.pending,
                "some input queries have no up-to-date record in the artifact"
            );
        }
        info!(
            path = %summary.path.display(),
            records = summary.exported,
            excluded = summary.excluded,
            bytes = compressed.len(),
            "wrote result artifact"
        );

        Ok(summary)
    }

    fn read_rows(&self) -> rusqlite::Result<Vec<(String, String)>> {
        let mut statement = self.connection.prepare(
            "
            SELECT query_id, record_json
            FROM verification_records
            ORDER BY query_id ASC
            ",
        )?;

        let mut rows = statement.query([])?;
        let mut out = Vec::<(String, String)>::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }

        Ok(out)
    }
}

fn configure_connection(connection: &Connection) -> rusqlite::Result<()> {
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "FULL")?;
    connection.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn ensure_schema(connection: &Connection, config: &StoreConfig) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verification_records (
          query_id TEXT PRIMARY KEY,
          status TEXT NOT NULL,
          input_hash TEXT NOT NULL,
          best_match TEXT,
          record_json TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_verification_records_status
          ON verification_records(status);
        ",
    )?;

    let created_at = now_utc_string();
    for (key, value) in [
        ("schema_version", CHECKPOINT_SCHEMA_VERSION),
        ("model_name", config.model_name.as_str()),
        ("diacritic_setting", diacritic_setting(config.strip_diacritics)),
        ("created_at", created_at.as_str()),
    ] {
        connection.execute(
            "INSERT OR IGNORE INTO metadata(key, value) VALUES(?1, ?2)",
            params![key, value],
        )?;
    }

    Ok(())
}

/// Corruption, I/O and capacity failures mean earlier records may be at risk.
fn is_integrity_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
        )
    )
}

fn checkpoint_error(path: &Path, source: rusqlite::Error) -> PersistenceError {
    PersistenceError::Checkpoint {
        path: path.display().to_string(),
        source,
    }
}

fn write_error(path: &Path, query_id: &str, source: rusqlite::Error) -> PersistenceError {
    if is_integrity_failure(&source) {
        checkpoint_error(path, source)
    } else {
        PersistenceError::RolledBack {
            query_id: query_id.to_string(),
            source,
        }
    }
}
