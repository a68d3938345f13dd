//! Types for recording and aggregating training metrics.
//!
//! * [`Record`] - a key-value container of [`RecordValue`]s
//! * [`RecordStorage`] - stores records and aggregates them per key
//! * [`Logger`] - the push target of the trainer; aggregates, logs and keeps
//!   a history on every flush
//!
//! ```rust
//! use mixrl_core::record::{Logger, Record, RecordValue};
//!
//! let mut logger = Logger::new();
//! logger.push(Record::from_scalar("critic_loss", 0.5));
//! logger.push(Record::from_scalar("critic_loss", 0.3));
//! logger.push(Record::from_scalar("epoch", 1.0));
//!
//! let stats = logger.flush(1);
//! assert!((stats.get_scalar("critic_loss_avg").unwrap() - 0.4).abs() < 1e-6);
//! assert_eq!(stats.get_scalar("epoch").unwrap(), 1.0);
//! ```
mod base;
mod logger;
mod storage;

pub use base::{Record, RecordValue};
pub use logger::Logger;
pub use storage::RecordStorage;
