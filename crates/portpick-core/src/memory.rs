use std::cell::Cell;
use std::collections::BTreeMap;

use crate::{normalize_note, LedgerError, PortRecord, PortStore, RecordId};

/// Volatile [`PortStore`] kept entirely in memory.
///
/// Enforces the same uniqueness rules as the persistent store and counts
/// `list_all` calls so callers can observe snapshot reads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<RecordId, PortRecord>,
    list_calls: Cell<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from existing records.
    ///
    /// # Errors
    /// Returns the first uniqueness violation among `records`.
    pub fn with_records(records: impl IntoIterator<Item = PortRecord>) -> Result<Self, LedgerError> {
        let mut store = Self::new();
        for record in records {
            store.commit(&record)?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.get()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PortStore for MemoryStore {
    fn commit(&mut self, record: &PortRecord) -> Result<(), LedgerError> {
        record.validate()?;
        if self.records.values().any(|existing| existing.port == record.port) {
            return Err(LedgerError::DuplicatePort(record.port));
        }
        if self.records.contains_key(&record.id) {
            return Err(LedgerError::DuplicateId(record.id.clone()));
        }
        let mut stored = record.clone();
        stored.note = normalize_note(stored.note);
        self.records.insert(record.id.clone(), stored);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<PortRecord>, LedgerError> {
        self.list_calls.set(self.list_calls.get() + 1);
        Ok(self.records.values().cloned().collect())
    }

    fn release(&mut self, id: &RecordId) -> Result<(), LedgerError> {
        self.records.remove(id).map(|_| ()).ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    fn clear_all(&mut self) -> Result<usize, LedgerError> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }

    fn is_used(&self, port: u16) -> Result<bool, LedgerError> {
        Ok(self.records.values().any(|record| record.port == port))
    }

    fn update_note(&mut self, id: &RecordId, note: Option<&str>) -> Result<(), LedgerError> {
        let record = self.records.get_mut(id).ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        record.note = normalize_note(note.map(str::to_string));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BatchId;

    #[test]
    fn release_twice_reports_not_found() -> Result<(), LedgerError> {
        let record = PortRecord::new(5000, BatchId::new(), None)?;
        let mut store = MemoryStore::with_records([record.clone()])?;

        store.release(&record.id)?;
        assert_eq!(store.release(&record.id), Err(LedgerError::NotFound(record.id.clone())));
        assert!(!store.is_used(5000)?);
        Ok(())
    }

    #[test]
    fn duplicate_port_is_rejected_before_duplicate_id() -> Result<(), LedgerError> {
        let record = PortRecord::new(5001, BatchId::new(), None)?;
        let mut store = MemoryStore::with_records([record.clone()])?;

        assert_eq!(store.commit(&record), Err(LedgerError::DuplicatePort(5001)));

        let mut same_id = record.clone();
        same_id.port = 5002;
        assert_eq!(store.commit(&same_id), Err(LedgerError::DuplicateId(record.id)));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn blank_notes_are_stored_as_absent() -> Result<(), LedgerError> {
        let mut record = PortRecord::new(5003, BatchId::new(), None)?;
        record.note = Some("   ".to_string());
        let mut store = MemoryStore::new();
        store.commit(&record)?;

        let stored = store.list_all()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].note, None);
        Ok(())
    }
}
