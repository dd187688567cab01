//! Result Sink.
//!
//! One JSON file per job under the campaign's result directory. A record's
//! existence is the authoritative "already done" signal for its job id, so
//! the sink doubles as the idempotency check of the worker loop.

pub mod record;
pub mod sink;

pub use record::{Outcome, ResultRecord, FAILED_PREFIX};
pub use sink::{ResultSink, ResultSummary};
