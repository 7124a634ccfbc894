use serde::{Deserialize, Serialize};

use crate::{validate_port, BatchId, LedgerError, PortRecord, PortStore};

/// Outcome of a batch save. Partial success is normal, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitResult {
    pub batch_id: BatchId,
    pub committed: Vec<PortRecord>,
    /// Ports another writer committed after the batch was generated.
    pub conflicts: Vec<u16>,
}

impl CommitResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty()
    }

    #[must_use]
    pub fn committed_ports(&self) -> Vec<u16> {
        self.committed.iter().map(|record| record.port).collect()
    }
}

/// Commit every port in `ports` as its own record under `batch_id`.
///
/// Each commit is attempted independently: a [`LedgerError::DuplicatePort`]
/// is recorded in [`CommitResult::conflicts`] and the remaining ports still commit.
///
/// # Errors
/// Returns [`LedgerError::Validation`] before any write when a port is zero.
/// Any other store failure stops the batch; records written before it stay committed.
pub fn commit_batch<S>(
    store: &mut S,
    ports: &[u16],
    batch_id: &BatchId,
    note: Option<&str>,
) -> Result<CommitResult, LedgerError>
where
    S: PortStore + ?Sized,
{
    for port in ports {
        validate_port(*port)?;
    }

    let mut result =
        CommitResult { batch_id: batch_id.clone(), committed: Vec::new(), conflicts: Vec::new() };

    for port in ports {
        let record = PortRecord::new(*port, batch_id.clone(), note.map(str::to_string))?;
        match store.commit(&record) {
            Ok(()) => result.committed.push(record),
            Err(LedgerError::DuplicatePort(port)) => {
                tracing::warn!(port, batch_id = %batch_id, "port lost commit race; reporting conflict");
                result.conflicts.push(port);
            }
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        batch_id = %batch_id,
        committed = result.committed.len(),
        conflicts = result.conflicts.len(),
        "batch commit finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::{generate, MemoryStore, PortRange};

    // Test IDs: TBATCH-001
    #[test]
    fn overlapping_batches_commit_shared_port_once() -> Result<(), LedgerError> {
        let mut store = MemoryStore::new();
        let first = BatchId::new();
        let second = BatchId::new();

        let a = commit_batch(&mut store, &[5, 7, 9], &first, None)?;
        let b = commit_batch(&mut store, &[6, 7, 8], &second, Some("late writer"))?;

        assert!(a.is_complete());
        assert_eq!(a.committed_ports(), vec![5, 7, 9]);
        assert_eq!(b.committed_ports(), vec![6, 8]);
        assert_eq!(b.conflicts, vec![7]);
        assert!(b.committed.iter().all(|record| record.note.as_deref() == Some("late writer")));

        let ports = store.list_all()?.into_iter().map(|record| record.port).collect::<Vec<_>>();
        let unique = ports.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(ports.len(), 5);
        assert_eq!(unique.len(), 5);
        Ok(())
    }

    // Test IDs: TBATCH-002
    #[test]
    fn stale_snapshots_from_two_generators_resolve_to_single_owner() -> Result<(), LedgerError> {
        let mut store = MemoryStore::new();
        let span = PortRange::new(7, 7)?;

        // Both flows snapshot the empty store before either commits.
        let a = generate(&store, span, 1, &mut StdRng::seed_from_u64(1))?;
        let b = generate(&store, span, 1, &mut StdRng::seed_from_u64(2))?;
        assert_eq!(a.ports, vec![7]);
        assert_eq!(b.ports, vec![7]);

        let first = commit_batch(&mut store, &a.ports, &a.batch_id, None)?;
        let second = commit_batch(&mut store, &b.ports, &b.batch_id, None)?;
        assert_eq!(first.committed_ports(), vec![7]);
        assert!(second.committed.is_empty());
        assert_eq!(second.conflicts, vec![7]);
        Ok(())
    }

    #[test]
    fn repeated_port_within_one_call_reports_conflict() -> Result<(), LedgerError> {
        let mut store = MemoryStore::new();
        let result = commit_batch(&mut store, &[42, 42], &BatchId::new(), None)?;
        assert_eq!(result.committed_ports(), vec![42]);
        assert_eq!(result.conflicts, vec![42]);
        Ok(())
    }

    #[test]
    fn invalid_port_fails_before_any_write() {
        let mut store = MemoryStore::new();
        let result = commit_batch(&mut store, &[10, 0, 11], &BatchId::new(), None);
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert!(store.is_empty());
    }
}
