use crate::{sql, SqliteCoordinator, StorageError};
use rfs_core::{CoordinationError, EntryStore, IndexWorkEntry, IndexWorkStatus, Phase, PhaseEntry};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

const PHASE_ENTRY_TYPE: &str = "PHASE";

fn encode<T: Serialize>(value: &T) -> Result<String, CoordinationError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()).into())
}

fn decode<T: DeserializeOwned>(entry_id: &str, raw: &str) -> Result<T, CoordinationError> {
    serde_json::from_str(raw).map_err(|err| {
        StorageError::Serialization(format!("entry {entry_id}: {err}")).into()
    })
}

impl SqliteCoordinator {
    fn read_entry<T: DeserializeOwned>(&self, entry_id: &str) -> Result<Option<T>, CoordinationError> {
        let raw: Option<String> = self
            .lock()?
            .query_row(
                "SELECT doc_json FROM migration_entries WHERE entry_id = ?1",
                [entry_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql)?;
        raw.map(|raw| decode(entry_id, &raw)).transpose()
    }

    fn insert_entry<T: Serialize>(
        &self,
        entry_id: &str,
        entry_type: &str,
        status: &str,
        entry: &T,
    ) -> Result<bool, CoordinationError> {
        let doc = encode(entry)?;
        let changes = self
            .lock()?
            .execute(
                "
                INSERT OR IGNORE INTO migration_entries (entry_id, entry_type, status, doc_json)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![entry_id, entry_type, status, doc],
            )
            .map_err(sql)?;
        Ok(changes > 0)
    }

    /// Writes `updated` only while the stored document still equals `expected`.
    fn swap_entry<T: Serialize>(
        &self,
        entry_id: &str,
        status: &str,
        updated: &T,
        expected: &T,
    ) -> Result<bool, CoordinationError> {
        let doc = encode(updated)?;
        let previous = encode(expected)?;
        let changes = self
            .lock()?
            .execute(
                "
                UPDATE migration_entries
                SET status = ?1,
                    doc_json = ?2
                WHERE entry_id = ?3 AND doc_json = ?4
                ",
                params![status, doc, entry_id, previous],
            )
            .map_err(sql)?;
        Ok(changes > 0)
    }
}

impl EntryStore for SqliteCoordinator {
    fn get_phase_entry(&self, phase: Phase) -> Result<Option<PhaseEntry>, CoordinationError> {
        self.read_entry(phase.entry_id())
    }

    fn create_phase_entry(
        &self,
        entry: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError> {
        if self.insert_entry(entry.id(), PHASE_ENTRY_TYPE, entry.status.as_str(), entry)? {
            debug!(event = "phase_entry_created", phase = %entry.phase, status = %entry.status);
            Ok(Some(entry.clone()))
        } else {
            Ok(None)
        }
    }

    fn update_phase_entry(
        &self,
        updated: &PhaseEntry,
        expected: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError> {
        if updated.phase != expected.phase {
            return Err(CoordinationError::InvalidArgument(format!(
                "cannot replace {} entry with {} entry",
                expected.phase, updated.phase
            )));
        }
        if self.swap_entry(updated.id(), updated.status.as_str(), updated, expected)? {
            debug!(
                event = "phase_entry_updated",
                phase = %updated.phase,
                status = %updated.status,
                num_attempts = updated.num_attempts
            );
            Ok(Some(updated.clone()))
        } else {
            debug!(event = "phase_entry_update_dropped", phase = %updated.phase);
            Ok(None)
        }
    }

    fn create_index_work_entry(&self, entry: &IndexWorkEntry) -> Result<bool, CoordinationError> {
        self.insert_entry(
            &entry.id(),
            IndexWorkEntry::ENTRY_TYPE,
            entry.status.as_str(),
            entry,
        )
    }

    fn get_index_work_entry(
        &self,
        index_name: &str,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError> {
        self.read_entry(&IndexWorkEntry::id_for(index_name))
    }

    fn index_work_entries_to_migrate(
        &self,
        limit: usize,
    ) -> Result<Vec<IndexWorkEntry>, CoordinationError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT entry_id, doc_json
                FROM migration_entries
                WHERE entry_type = ?1 AND status = ?2
                ORDER BY entry_id ASC
                LIMIT ?3
                ",
            )
            .map_err(sql)?;
        let rows = stmt
            .query_map(
                params![
                    IndexWorkEntry::ENTRY_TYPE,
                    IndexWorkStatus::NotStarted.as_str(),
                    limit.min(i64::MAX as usize) as i64
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(sql)?;

        let mut entries = Vec::new();
        for row in rows {
            let (entry_id, raw) = row.map_err(sql)?;
            entries.push(decode(&entry_id, &raw)?);
        }
        Ok(entries)
    }

    fn update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
        expected: &IndexWorkEntry,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError> {
        if updated.name != expected.name {
            return Err(CoordinationError::InvalidArgument(format!(
                "cannot replace index entry {} with {}",
                expected.name, updated.name
            )));
        }
        if self.swap_entry(&updated.id(), updated.status.as_str(), updated, expected)? {
            Ok(Some(updated.clone()))
        } else {
            debug!(event = "index_entry_update_dropped", index = %updated.name);
            Ok(None)
        }
    }

    fn force_update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
    ) -> Result<IndexWorkEntry, CoordinationError> {
        let doc = encode(updated)?;
        self.lock()?
            .execute(
                "
                INSERT INTO migration_entries (entry_id, entry_type, status, doc_json)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(entry_id) DO UPDATE SET
                    status = excluded.status,
                    doc_json = excluded.doc_json
                ",
                params![
                    updated.id(),
                    IndexWorkEntry::ENTRY_TYPE,
                    updated.status.as_str(),
                    doc
                ],
            )
            .map_err(sql)?;
        info!(
            event = "index_entry_forced",
            index = %updated.name,
            status = %updated.status
        );
        Ok(updated.clone())
    }
}
