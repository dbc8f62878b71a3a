//! Folding of repeated flow observations into summarized intervals.
//!
//! Records are grouped by a tuple of field values (the 5-tuple by default).
//! Each group keeps the earliest start, the latest end and the summed packet
//! and byte counters. Memory grows with the number of distinct keys, not the
//! number of records, so unbounded inputs can be folded.

use crate::error::{ReaderError, Result};
use crate::record::{FieldValue, FlowField, FlowRecord};
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use tracing::trace;

/// Group by the classic 5-tuple
pub const DEFAULT_KEY_FIELDS: [FlowField; 5] = [
    FlowField::Srcaddr,
    FlowField::Dstaddr,
    FlowField::Srcport,
    FlowField::Dstport,
    FlowField::Protocol,
];

/// Aggregate of every record sharing one key tuple
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSummary {
    /// Key fields with their values, in key order
    pub key: Vec<(FlowField, FieldValue)>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub packets: Option<u64>,
    pub bytes: Option<u64>,
    /// First record seen for this key. Its non-key fields (action,
    /// interface_id, ...) stand in for the whole group.
    pub representative: FlowRecord,
}

impl FlowSummary {
    fn seed(key: Vec<(FlowField, FieldValue)>, record: FlowRecord) -> Self {
        Self {
            key,
            start: record.start,
            end: record.end,
            packets: record.packets,
            bytes: record.bytes,
            representative: record,
        }
    }

    fn absorb(&mut self, record: &FlowRecord) {
        self.start = self.start.min(record.start);
        self.end = self.end.max(record.end);
        self.packets = add_counter(self.packets, record.packets);
        self.bytes = add_counter(self.bytes, record.bytes);
    }

    /// Value of a key field, if it is part of the key
    pub fn key_value(&self, field: FlowField) -> Option<&FieldValue> {
        self.key
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, value)| value)
    }
}

fn add_counter(total: Option<u64>, delta: Option<u64>) -> Option<u64> {
    match (total, delta) {
        (Some(total), Some(delta)) => Some(total.saturating_add(delta)),
        (total, None) => total,
        (None, delta) => delta,
    }
}

fn is_folded(field: FlowField) -> bool {
    matches!(
        field,
        FlowField::Start | FlowField::End | FlowField::Packets | FlowField::Bytes
    )
}

impl Serialize for FlowSummary {
    /// Flat map of the key fields plus `start`, `end`, `packets`, `bytes`
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let key_entries: Vec<_> = self.key.iter().filter(|(f, _)| !is_folded(*f)).collect();

        let mut map = serializer.serialize_map(Some(key_entries.len() + 4))?;
        for (field, value) in key_entries {
            map.serialize_entry(field.as_str(), value)?;
        }
        map.serialize_entry("start", &self.start)?;
        map.serialize_entry("end", &self.end)?;
        map.serialize_entry("packets", &self.packets)?;
        map.serialize_entry("bytes", &self.bytes)?;
        map.end()
    }
}

/// Single-pass group-by-and-fold over flow records
#[derive(Debug)]
pub struct Aggregator {
    key_fields: Vec<FlowField>,
    groups: HashMap<Vec<FieldValue>, FlowSummary>,
}

impl Aggregator {
    pub fn new(key_fields: impl Into<Vec<FlowField>>) -> Self {
        Self {
            key_fields: key_fields.into(),
            groups: HashMap::new(),
        }
    }

    pub fn key_fields(&self) -> &[FlowField] {
        &self.key_fields
    }

    /// Fold one record into its group.
    ///
    /// Returns `false` when the record was left out because one of its key
    /// fields is missing (e.g. `NODATA` records under the 5-tuple key).
    pub fn push(&mut self, record: FlowRecord) -> bool {
        let values: Vec<FieldValue> = self.key_fields.iter().map(|f| record.field(*f)).collect();
        if values.iter().any(FieldValue::is_null) {
            trace!(interface_id = %record.interface_id, "Skipping record with missing key fields");
            return false;
        }

        match self.groups.get_mut(&values) {
            Some(summary) => summary.absorb(&record),
            None => {
                let key = self.key_fields.iter().copied().zip(values.iter().cloned()).collect();
                self.groups.insert(values, FlowSummary::seed(key, record));
            }
        }
        true
    }

    /// Number of distinct keys seen so far
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// One summary per distinct key, in no particular order
    pub fn finish(self) -> Vec<FlowSummary> {
        self.groups.into_values().collect()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELDS.to_vec())
    }
}

impl Extend<FlowRecord> for Aggregator {
    fn extend<T: IntoIterator<Item = FlowRecord>>(&mut self, iter: T) {
        for record in iter {
            self.push(record);
        }
    }
}

/// Aggregate an iterator of records by `key_fields`
pub fn aggregated_records<I>(records: I, key_fields: &[FlowField]) -> Vec<FlowSummary>
where
    I: IntoIterator<Item = FlowRecord>,
{
    let mut aggregator = Aggregator::new(key_fields);
    aggregator.extend(records);
    aggregator.finish()
}

/// Aggregate a record stream, stopping at the first error it yields
pub async fn aggregate_stream<S>(records: S, key_fields: &[FlowField]) -> Result<Vec<FlowSummary>>
where
    S: Stream<Item = Result<FlowRecord>>,
{
    let aggregator = records
        .try_fold(Aggregator::new(key_fields), |mut aggregator, record| async move {
            aggregator.push(record);
            Ok::<_, ReaderError>(aggregator)
        })
        .await?;

    Ok(aggregator.finish())
}
