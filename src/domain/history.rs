//! # Observation History
//!
//! A `History<T>` is a time-ordered array of `{date, value}` entries with at
//! most one entry per timestamp. Writing at an existing timestamp replaces
//! that entry; any other write is inserted at its time position.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
    pub value: T,
}

impl<T> HistoryEntry<T> {
    pub const fn new(timestamp: DateTime<Utc>, value: T) -> Self {
        Self { timestamp, value }
    }
}

pub type PriceHistoryEntry = HistoryEntry<f64>;
pub type AvailabilityHistoryEntry = HistoryEntry<String>;

/// What a single `record` call did to the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWrite {
    Inserted,
    Overwritten,
}

#[derive(Debug, Clone, PartialEq)]
pub struct History<T> {
    entries: Vec<HistoryEntry<T>>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> History<T> {
    #[must_use]
    pub fn seeded(timestamp: DateTime<Utc>, value: T) -> Self {
        Self {
            entries: vec![HistoryEntry::new(timestamp, value)],
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry<T>] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&HistoryEntry<T>> {
        self.entries.last()
    }

    #[must_use]
    pub fn contains_timestamp(&self, timestamp: DateTime<Utc>) -> bool {
        self.position(timestamp).is_ok()
    }

    fn position(&self, timestamp: DateTime<Utc>) -> Result<usize, usize> {
        self.entries.binary_search_by(|entry| entry.timestamp.cmp(&timestamp))
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, value: T) -> HistoryWrite {
        match self.position(timestamp) {
            Ok(index) => {
                self.entries[index].value = value;
                HistoryWrite::Overwritten
            }
            Err(index) => {
                self.entries.insert(index, HistoryEntry::new(timestamp, value));
                HistoryWrite::Inserted
            }
        }
    }

    /// Adds entries whose timestamp is not present yet; existing entries win.
    /// Returns the entries that were actually added.
    pub fn merge_missing<I>(&mut self, incoming: I) -> Vec<HistoryEntry<T>>
    where
        I: IntoIterator<Item = HistoryEntry<T>>,
        T: Clone,
    {
        let mut added = Vec::new();
        for entry in incoming {
            if let Err(index) = self.position(entry.timestamp) {
                added.push(entry.clone());
                self.entries.insert(index, entry);
            }
        }
        added
    }
}

impl<T> From<Vec<HistoryEntry<T>>> for History<T> {
    /// Sorts by timestamp; for duplicate timestamps the later element wins.
    fn from(mut entries: Vec<HistoryEntry<T>>) -> Self {
        entries.sort_by_key(|entry| entry.timestamp);
        let mut normalized: Vec<HistoryEntry<T>> = Vec::with_capacity(entries.len());
        for entry in entries {
            match normalized.last_mut() {
                Some(last) if last.timestamp == entry.timestamp => *last = entry,
                _ => normalized.push(entry),
            }
        }
        Self { entries: normalized }
    }
}

impl<T: Serialize> Serialize for History<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for History<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<HistoryEntry<T>>::deserialize(deserializer).map(Self::from)
    }
}

/// Parses the date formats seen in source price tables.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]`
/// (read as UTC) and a bare `YYYY-MM-DD` (midnight UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn record_keeps_time_order_and_overwrites_collisions() {
        let mut history = History::seeded(at(10), 100.0);
        assert_eq!(history.record(at(30), 120.0), HistoryWrite::Inserted);
        assert_eq!(history.record(at(20), 110.0), HistoryWrite::Inserted);
        assert_eq!(history.record(at(20), 115.0), HistoryWrite::Overwritten);

        let values: Vec<f64> = history.entries().iter().map(|e| e.value).collect();
        assert_eq!(values, vec![100.0, 115.0, 120.0]);
        assert_eq!(history.latest().unwrap().value, 120.0);
    }

    #[test]
    fn merge_missing_never_replaces_existing_entries() {
        let mut history = History::seeded(at(10), "in_stock".to_string());
        let added = history.merge_missing(vec![
            HistoryEntry::new(at(10), "out_of_stock".to_string()),
            HistoryEntry::new(at(5), "on_order".to_string()),
        ]);

        assert_eq!(added.len(), 1);
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[0].value, "on_order");
        assert_eq!(history.entries()[1].value, "in_stock");
    }

    #[test]
    fn deserialization_normalizes_order_and_duplicates() {
        let json = r#"[
            {"date": "2024-03-02T00:00:00Z", "value": 2.0},
            {"date": "2024-03-01T00:00:00Z", "value": 1.0},
            {"date": "2024-03-02T00:00:00Z", "value": 3.0}
        ]"#;
        let history: History<f64> = serde_json::from_str(json).unwrap();
        let values: Vec<f64> = history.entries().iter().map(|e| e.value).collect();
        assert_eq!(values, vec![1.0, 3.0]);
    }

    #[rstest]
    #[case("2024-03-01T10:00:00Z", Some((2024, 3, 1, 10)))]
    #[case("2024-03-01 10:00:00", Some((2024, 3, 1, 10)))]
    #[case("2024-03-01T10:00:00.250", Some((2024, 3, 1, 10)))]
    #[case("2024-03-01", Some((2024, 3, 1, 0)))]
    #[case("yesterday", None)]
    #[case("", None)]
    fn parses_source_date_formats(#[case] raw: &str, #[case] expected: Option<(i32, u32, u32, u32)>) {
        use chrono::{Datelike, Timelike};
        let parsed = parse_timestamp(raw).map(|ts| (ts.year(), ts.month(), ts.day(), ts.hour()));
        assert_eq!(parsed, expected);
    }
}
