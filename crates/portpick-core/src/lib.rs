use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod allocator;
mod batch;
mod memory;
mod query;
mod transfer;

pub use allocator::{generate, generate_with_strategy, SelectionStrategy, RESERVOIR_THRESHOLD};
pub use batch::{commit_batch, CommitResult};
pub use memory::MemoryStore;
pub use query::{select_records, RecordFilter, RecordSort, SortDirection, SortField};
pub use transfer::{decode_record, export, export_json, import, import_values, ImportSummary};

pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = u16::MAX;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient range: requested {requested} ports, only {available} available")]
    InsufficientRange { requested: usize, available: usize },
    #[error("port {0} is already in use")]
    DuplicatePort(u16),
    #[error("record id already exists: {0}")]
    DuplicateId(RecordId),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("import format error: {0}")]
    ImportFormat(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an externally supplied identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        if raw.trim().is_empty() {
            return Err(LedgerError::Validation("record id MUST NOT be blank".to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an externally supplied batch identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        if raw.trim().is_empty() {
            return Err(LedgerError::Validation("batch id MUST NOT be blank".to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive port interval with `1 <= min <= max <= 65535`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    min: u16,
    max: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    min: i64,
    max: i64,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = LedgerError;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        Self::new(raw.min, raw.max)
    }
}

impl PortRange {
    /// Build a range from raw integers, as supplied by configuration or CLI flags.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when either bound falls outside
    /// `[1, 65535]` or `min > max`.
    pub fn new(min: i64, max: i64) -> Result<Self, LedgerError> {
        let min = port_from_i64(min, "min")?;
        let max = port_from_i64(max, "max")?;
        if min > max {
            return Err(LedgerError::Validation(format!(
                "range min ({min}) MUST be <= max ({max})"
            )));
        }
        Ok(Self { min, max })
    }

    #[must_use]
    pub fn full() -> Self {
        Self { min: MIN_PORT, max: MAX_PORT }
    }

    #[must_use]
    pub fn min(self) -> u16 {
        self.min
    }

    #[must_use]
    pub fn max(self) -> u16 {
        self.max
    }

    /// Number of ports in the range. Never zero.
    #[must_use]
    pub fn len(self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn iter(self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }

    /// Re-check the range invariant.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the bounds are out of order or zero.
    pub fn validate(self) -> Result<(), LedgerError> {
        Self::new(i64::from(self.min), i64::from(self.max)).map(|_| ())
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

fn port_from_i64(value: i64, field: &str) -> Result<u16, LedgerError> {
    u16::try_from(value).ok().filter(|port| *port >= MIN_PORT).ok_or_else(|| {
        LedgerError::Validation(format!(
            "range {field} ({value}) MUST lie within [{MIN_PORT}, {MAX_PORT}]"
        ))
    })
}

/// Reject port zero; every other `u16` is a valid port.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for port `0`.
pub fn validate_port(port: u16) -> Result<(), LedgerError> {
    if port < MIN_PORT {
        return Err(LedgerError::Validation(format!(
            "port ({port}) MUST lie within [{MIN_PORT}, {MAX_PORT}]"
        )));
    }
    Ok(())
}

/// Convert a raw requested count into a `usize`.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for negative counts.
pub fn parse_count(value: i64) -> Result<usize, LedgerError> {
    usize::try_from(value)
        .map_err(|_| LedgerError::Validation(format!("count ({value}) MUST be >= 0")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRecord {
    pub id: RecordId,
    pub port: u16,
    #[serde(alias = "actionId")]
    pub batch_id: BatchId,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
    #[serde(default)]
    pub note: Option<String>,
}

impl PortRecord {
    /// Build a fresh record stamped with the current time.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `port` is zero.
    pub fn new(port: u16, batch_id: BatchId, note: Option<String>) -> Result<Self, LedgerError> {
        let record = Self {
            id: RecordId::new(),
            port,
            batch_id,
            used_at: OffsetDateTime::now_utc(),
            note: normalize_note(note),
        };
        record.validate()?;
        Ok(record)
    }

    /// Validate a record before it crosses the persistence boundary.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the port is out of range or an
    /// identifier is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_port(self.port)?;
        if self.id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation("record id MUST NOT be blank".to_string()));
        }
        if self.batch_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation("batch id MUST NOT be blank".to_string()));
        }
        Ok(())
    }
}

/// Blank notes are stored as absent.
#[must_use]
pub fn normalize_note(note: Option<String>) -> Option<String> {
    note.filter(|value| !value.trim().is_empty())
}

/// Ports proposed by one allocation call. Nothing here is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposedBatch {
    pub batch_id: BatchId,
    pub range: PortRange,
    pub ports: Vec<u16>,
}

impl ProposedBatch {
    #[must_use]
    pub fn empty(range: PortRange) -> Self {
        Self { batch_id: BatchId::new(), range, ports: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Persistence seam for committed port records.
///
/// Implementations MUST make `commit` an atomic check-and-insert on `port`.
pub trait PortStore {
    /// Insert one record.
    ///
    /// # Errors
    /// [`LedgerError::DuplicatePort`] when a live record already holds the port,
    /// [`LedgerError::DuplicateId`] when the id is taken, and
    /// [`LedgerError::StorageUnavailable`] on I/O failure.
    fn commit(&mut self, record: &PortRecord) -> Result<(), LedgerError>;

    /// Every live record, in no particular order.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the store cannot be read.
    fn list_all(&self) -> Result<Vec<PortRecord>, LedgerError>;

    /// Delete one record by id.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no record has that id.
    fn release(&mut self, id: &RecordId) -> Result<(), LedgerError>;

    /// Delete every record and return how many were removed.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the store cannot be written.
    fn clear_all(&mut self) -> Result<usize, LedgerError>;

    /// Point lookup on a port value.
    ///
    /// # Errors
    /// Returns [`LedgerError::StorageUnavailable`] when the store cannot be read.
    fn is_used(&self, port: u16) -> Result<bool, LedgerError>;

    /// Replace the note on one record; `None` clears it.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no record has that id.
    fn update_note(&mut self, id: &RecordId, note: Option<&str>) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_rejects_out_of_bounds_and_inverted_bounds() {
        for (min, max) in [(0, 10), (1, 65_536), (-5, 10), (100, 99)] {
            let Err(LedgerError::Validation(message)) = PortRange::new(min, max) else {
                panic!("range {min}-{max} should be rejected");
            };
            assert!(message.contains("MUST"), "unexpected message: {message}");
        }
    }

    #[test]
    fn port_range_accepts_single_port_and_full_span() -> Result<(), LedgerError> {
        let single = PortRange::new(8080, 8080)?;
        assert_eq!(single.len(), 1);
        assert!(single.contains(8080));
        assert!(!single.contains(8081));

        let full = PortRange::new(1, 65_535)?;
        assert_eq!(full, PortRange::full());
        assert_eq!(full.len(), 65_535);
        Ok(())
    }

    #[test]
    fn port_range_deserialization_runs_validation() {
        let parsed = serde_json::from_str::<PortRange>(r#"{"min":10,"max":20}"#);
        assert!(matches!(parsed, Ok(range) if range.min() == 10 && range.max() == 20));

        let rejected = serde_json::from_str::<PortRange>(r#"{"min":20,"max":10}"#);
        assert!(rejected.is_err());
    }

    #[test]
    fn parse_count_rejects_negative_values() {
        assert_eq!(parse_count(0), Ok(0));
        assert_eq!(parse_count(12), Ok(12));
        assert!(matches!(parse_count(-1), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn record_validation_rejects_port_zero_and_blank_ids() -> Result<(), LedgerError> {
        assert!(matches!(
            PortRecord::new(0, BatchId::new(), None),
            Err(LedgerError::Validation(_))
        ));

        let mut record = PortRecord::new(4000, BatchId::new(), Some("  ".to_string()))?;
        assert_eq!(record.note, None);

        record.batch_id = BatchId(String::new());
        assert!(matches!(record.validate(), Err(LedgerError::Validation(_))));
        Ok(())
    }

    #[test]
    fn record_wire_format_uses_camel_case_and_accepts_legacy_action_id() -> Result<(), String> {
        let legacy = r#"{
            "id": "3f0c9f5e-7b7d-4c4b-9a53-0d6f6e0f2a11",
            "port": 4321,
            "actionId": "batch-1",
            "usedAt": "2024-05-01T10:20:30.123Z",
            "note": ""
        }"#;
        let record: PortRecord = serde_json::from_str(legacy).map_err(|err| err.to_string())?;
        assert_eq!(record.port, 4321);
        assert_eq!(record.batch_id.as_str(), "batch-1");

        let encoded = serde_json::to_value(&record).map_err(|err| err.to_string())?;
        assert!(encoded.get("batchId").is_some());
        assert!(encoded.get("usedAt").is_some());
        assert!(encoded.get("batch_id").is_none());
        Ok(())
    }
}
