//! Storage of records with per-key aggregation.
use super::{Record, RecordValue};
use itertools::Itertools;
use std::collections::HashSet;
use xxhash_rust::xxh3::Xxh3Builder;

/// Stores records and aggregates them per key.
///
/// Scalars pushed more than once are summarized as `{key}_avg`, `{key}_std`,
/// `{key}_min` and `{key}_max`; a scalar pushed once is kept as is.
/// For the other value types the most recent value is kept.
#[derive(Default)]
pub struct RecordStorage {
    data: Vec<Record>,
}

fn min(vs: &[f32]) -> RecordValue {
    RecordValue::Scalar(vs.iter().copied().fold(f32::INFINITY, f32::min))
}

fn max(vs: &[f32]) -> RecordValue {
    RecordValue::Scalar(vs.iter().copied().fold(f32::NEG_INFINITY, f32::max))
}

fn mean(vs: &[f32]) -> f32 {
    vs.iter().sum::<f32>() / vs.len() as f32
}

/// Population standard deviation.
fn std(vs: &[f32]) -> f32 {
    let m = mean(vs);
    (vs.iter().map(|v| (v - m).powi(2)).sum::<f32>() / vs.len() as f32).sqrt()
}

impl RecordStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self { data: vec![] }
    }

    /// Stores a record.
    pub fn store(&mut self, record: Record) {
        self.data.push(record);
    }

    /// Returns `true` if nothing has been stored since the last aggregation.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn get_keys(&self) -> HashSet<String, Xxh3Builder> {
        let mut keys = HashSet::<String, Xxh3Builder>::default();
        for record in self.data.iter() {
            for k in record.keys() {
                keys.insert(k.clone());
            }
        }
        keys
    }

    /// Most recent value of the given key.
    fn latest(&self, key: &str) -> Option<&RecordValue> {
        self.data.iter().rev().find_map(|record| record.get(key))
    }

    fn scalar(&self, key: &str) -> Record {
        let vs: Vec<f32> = self
            .data
            .iter()
            .filter_map(|record| match record.get(key) {
                Some(RecordValue::Scalar(v)) => Some(*v),
                _ => None,
            })
            .collect();

        if vs.len() == 1 {
            Record::from_scalar(key, vs[0])
        } else {
            Record::from_slice(&[
                (format!("{}_avg", key), RecordValue::Scalar(mean(&vs))),
                (format!("{}_std", key), RecordValue::Scalar(std(&vs))),
                (format!("{}_min", key), min(&vs)),
                (format!("{}_max", key), max(&vs)),
            ])
        }
    }

    /// Aggregates all stored records and clears the storage.
    pub fn aggregate(&mut self) -> Record {
        let mut record = Record::empty();

        for key in self.get_keys().iter().sorted() {
            let r = match self.latest(key) {
                Some(RecordValue::Scalar(..)) => self.scalar(key),
                Some(value) => Record::from_slice(&[(key.clone(), value.clone())]),
                None => continue,
            };
            record.merge_inplace(r);
        }

        self.data = vec![];

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_scalars() {
        let mut storage = RecordStorage::new();
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            storage.store(Record::from_scalar("loss", v));
        }
        storage.store(Record::from_scalar("epoch", 7.0));

        let record = storage.aggregate();

        assert_eq!(record.get_scalar("loss_avg").unwrap(), 2.5);
        assert_eq!(record.get_scalar("loss_min").unwrap(), 1.0);
        assert_eq!(record.get_scalar("loss_max").unwrap(), 4.0);
        assert!((record.get_scalar("loss_std").unwrap() - 1.25f32.sqrt()).abs() < 1e-6);
        assert_eq!(record.get_scalar("epoch").unwrap(), 7.0);
        assert!(record.get("loss").is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_aggregate_keeps_latest_non_scalar() {
        let mut storage = RecordStorage::new();
        storage.store(Record::from_slice(&[("tag", RecordValue::String("a".into()))]));
        storage.store(Record::from_slice(&[("tag", RecordValue::String("b".into()))]));

        let record = storage.aggregate();
        assert_eq!(record.get_string("tag").unwrap(), "b");
    }
}
