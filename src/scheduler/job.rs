//! Job definitions for the scheduler.
//!
//! A `Job` is one match between two or more bots on a single map. Jobs are
//! minted once by the campaign producer and are immutable afterwards; the
//! only field a worker ever touches is the requeue counter carried by the
//! fresh copy it publishes on a reservation conflict.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Minimum number of participants in a match.
pub const MIN_PARTICIPANTS: usize = 2;

/// A unit of dispatched work.
///
/// Accepts the legacy wire names (`bots`, `map`, `game_name`) on decode so
/// messages from older producers stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Ordered bot identifiers; player index `i` is `participants[i]`.
    #[serde(alias = "bots")]
    pub participants: Vec<String>,
    /// Map identifier.
    #[serde(alias = "map")]
    pub scenario: String,
    /// Campaign-unique identity, also the result-file key.
    #[serde(alias = "game_name")]
    pub job_id: String,
    /// How many times this job was requeued on a reservation conflict.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub requeues: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Job {
    /// Creates a new job that has never been requeued.
    pub fn new(
        participants: impl IntoIterator<Item = impl Into<String>>,
        scenario: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            participants: participants.into_iter().map(Into::into).collect(),
            scenario: scenario.into(),
            job_id: job_id.into(),
            requeues: 0,
        }
    }

    /// Checks the structural invariants of a job.
    ///
    /// The job id doubles as a file name, so it is restricted to
    /// `[A-Za-z0-9_.-]` and may not start with a dot.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.participants.len() < MIN_PARTICIPANTS {
            return Err(CodecError::malformed(format!(
                "job '{}' needs at least {} participants, got {}",
                self.job_id,
                MIN_PARTICIPANTS,
                self.participants.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.participants.len());
        for bot in &self.participants {
            if bot.trim().is_empty() {
                return Err(CodecError::malformed("empty participant identifier"));
            }
            if !seen.insert(bot.as_str()) {
                return Err(CodecError::malformed(format!(
                    "duplicate participant '{}'",
                    bot
                )));
            }
        }

        if self.scenario.trim().is_empty() {
            return Err(CodecError::malformed("empty scenario"));
        }

        if !is_valid_job_id(&self.job_id) {
            return Err(CodecError::malformed(format!(
                "invalid job id '{}'",
                self.job_id
            )));
        }

        Ok(())
    }

    /// Returns a copy of this job with the requeue counter incremented.
    pub fn requeued(&self) -> Self {
        Self {
            requeues: self.requeues.saturating_add(1),
            ..self.clone()
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] on {}",
            self.job_id,
            self.participants.join(" vs "),
            self.scenario
        )
    }
}

fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
