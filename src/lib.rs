//! match-forge: distributed dispatch of bot-vs-bot match campaigns.
//!
//! A producer expands bot and map rosters into a campaign of jobs and
//! publishes them to a shared queue. A pool of worker processes consumes
//! them one at a time, runs each game as an external process, and records
//! one result file per job. The result file doubles as the idempotency
//! check that makes at-least-once delivery safe.

pub mod campaign;
pub mod cli;
pub mod error;
pub mod results;
pub mod runner;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{CampaignError, CodecError, ReservationError, ResultError, RunnerError};
