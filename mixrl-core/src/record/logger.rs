use super::{Record, RecordStorage, RecordValue};
use itertools::Itertools;
use log::info;

/// Accumulates records pushed during training and summarizes them on [`Logger::flush`].
#[derive(Default)]
pub struct Logger {
    storage: RecordStorage,
    history: Vec<Record>,
}

impl Logger {
    /// Constructs an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record of metrics.
    pub fn push(&mut self, record: Record) {
        self.storage.store(record);
    }

    /// Aggregates the records pushed since the last flush, logs them and
    /// appends the result to the history.
    pub fn flush(&mut self, step: i64) -> Record {
        let record = self.storage.aggregate();
        let line = record
            .iter()
            .sorted_by(|(k1, _), (k2, _)| k1.cmp(k2))
            .filter_map(|(k, v)| match v {
                RecordValue::Scalar(v) => Some(format!("{}: {:.4}", k, v)),
                RecordValue::String(s) => Some(format!("{}: {}", k, s)),
                _ => None,
            })
            .join(", ");
        info!("{} | {}", step, line);

        self.history.push(record.clone());
        record
    }

    /// Records returned by previous flushes, oldest first.
    pub fn history(&self) -> &[Record] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_resets_and_keeps_history() {
        let mut logger = Logger::new();
        logger.push(Record::from_scalar("actor_loss", 1.0));
        logger.push(Record::from_scalar("actor_loss", 3.0));
        let r = logger.flush(0);
        assert_eq!(r.get_scalar("actor_loss_avg").unwrap(), 2.0);

        logger.push(Record::from_scalar("actor_loss", 5.0));
        let r = logger.flush(1);
        assert_eq!(r.get_scalar("actor_loss").unwrap(), 5.0);

        assert_eq!(logger.history().len(), 2);
    }
}
