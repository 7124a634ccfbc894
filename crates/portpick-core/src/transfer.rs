use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LedgerError, PortRecord, PortStore};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped_malformed: usize,
    pub skipped_conflict: usize,
}

/// Read every live record, ordered by commit time then port.
///
/// # Errors
/// Propagates store read failures.
pub fn export<S>(store: &S) -> Result<Vec<PortRecord>, LedgerError>
where
    S: PortStore + ?Sized,
{
    let mut records = store.list_all()?;
    records.sort_by(|lhs, rhs| {
        lhs.used_at
            .cmp(&rhs.used_at)
            .then_with(|| lhs.port.cmp(&rhs.port))
            .then_with(|| lhs.id.cmp(&rhs.id))
    });
    Ok(records)
}

/// Serialize records as the pretty-printed JSON array used for archival.
///
/// # Errors
/// Returns [`LedgerError::Validation`] if serialization fails.
pub fn export_json(records: &[PortRecord]) -> Result<String, LedgerError> {
    serde_json::to_string_pretty(records)
        .map_err(|err| LedgerError::Validation(format!("failed to serialize port records: {err}")))
}

/// Decode and validate one import element.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when a required field is missing,
/// mistyped, or violates record invariants.
pub fn decode_record(value: Value) -> Result<PortRecord, LedgerError> {
    let record: PortRecord = serde_json::from_value(value)
        .map_err(|err| LedgerError::Validation(format!("malformed port record: {err}")))?;
    record.validate()?;
    Ok(record)
}

/// Import a JSON array of records.
///
/// # Errors
/// Returns [`LedgerError::ImportFormat`] when `payload` is not a JSON array.
/// Malformed elements and uniqueness conflicts are counted, not raised.
pub fn import<S>(store: &mut S, payload: &str) -> Result<ImportSummary, LedgerError>
where
    S: PortStore + ?Sized,
{
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| LedgerError::ImportFormat(format!("payload is not valid JSON: {err}")))?;
    let Value::Array(items) = value else {
        return Err(LedgerError::ImportFormat(
            "payload MUST be a JSON array of port records".to_string(),
        ));
    };
    import_values(store, items)
}

/// Commit already-parsed import elements one by one.
///
/// # Errors
/// Propagates store failures other than uniqueness conflicts.
pub fn import_values<S>(store: &mut S, items: Vec<Value>) -> Result<ImportSummary, LedgerError>
where
    S: PortStore + ?Sized,
{
    let mut summary = ImportSummary::default();

    for (index, item) in items.into_iter().enumerate() {
        let record = match decode_record(item) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping malformed import element");
                summary.skipped_malformed += 1;
                continue;
            }
        };

        match store.commit(&record) {
            Ok(()) => summary.imported += 1,
            Err(LedgerError::DuplicatePort(_) | LedgerError::DuplicateId(_)) => {
                tracing::warn!(index, port = record.port, id = %record.id, "skipping conflicting import element");
                summary.skipped_conflict += 1;
            }
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        imported = summary.imported,
        skipped_malformed = summary.skipped_malformed,
        skipped_conflict = summary.skipped_conflict,
        "import finished"
    );
    Ok(summary)
}
