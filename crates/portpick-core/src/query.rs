use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{PortRange, PortRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub port_range: Option<PortRange>,
    /// Case-insensitive substring of the port number or the batch id.
    pub keyword: Option<String>,
    pub used_from: Option<OffsetDateTime>,
    pub used_until: Option<OffsetDateTime>,
}

impl RecordFilter {
    #[must_use]
    pub fn matches(&self, record: &PortRecord) -> bool {
        if let Some(range) = self.port_range {
            if !range.contains(record.port) {
                return false;
            }
        }

        if let Some(keyword) = self.keyword.as_deref().map(str::trim).filter(|kw| !kw.is_empty()) {
            let keyword = keyword.to_lowercase();
            let port_hit = record.port.to_string().contains(&keyword);
            let batch_hit = record.batch_id.as_str().to_lowercase().contains(&keyword);
            if !port_hit && !batch_hit {
                return false;
            }
        }

        if self.used_from.is_some_and(|from| record.used_at < from) {
            return false;
        }
        if self.used_until.is_some_and(|until| record.used_at > until) {
            return false;
        }

        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Port,
    #[default]
    UsedAt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RecordSort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl RecordSort {
    fn cmp(self, lhs: &PortRecord, rhs: &PortRecord) -> Ordering {
        let primary = match self.field {
            SortField::Port => lhs.port.cmp(&rhs.port),
            SortField::UsedAt => lhs.used_at.cmp(&rhs.used_at),
        };
        let ordered = match self.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        ordered.then_with(|| lhs.id.cmp(&rhs.id))
    }
}

/// Filter then sort records. Ties fall back to record id so output is stable.
#[must_use]
pub fn select_records(
    records: &[PortRecord],
    filter: &RecordFilter,
    sort: RecordSort,
) -> Vec<PortRecord> {
    let mut selected =
        records.iter().filter(|record| filter.matches(record)).cloned().collect::<Vec<_>>();
    selected.sort_by(|lhs, rhs| sort.cmp(lhs, rhs));
    selected
}
