//! Error types shared across match-forge subsystems.
//!
//! Defines the error taxonomy of the dispatch protocol:
//! - Message decoding (malformed payloads are dead-lettered, never retried)
//! - Campaign generation preconditions
//! - Game Runner failures (recorded as failed outcomes)
//! - Result persistence
//! - Bot reservations
//!
//! Queue and pool errors live next to their modules
//! (`scheduler::queue::QueueError`, `scheduler::worker_pool::PoolError`).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::QueueError;

/// Errors raised while decoding a job message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload could not be parsed into a valid job.
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// The job could not be serialized.
    #[error("Failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while generating or publishing a campaign.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("Result directory '{}' is not empty; refusing to mix two campaigns", .0.display())]
    CampaignConflict(PathBuf),

    #[error("Missing {kind} asset '{name}' (looked in '{}')", .path.display())]
    MissingAsset {
        kind: &'static str,
        name: String,
        path: PathBuf,
    },

    #[error("Invalid roster: {0}")]
    InvalidRoster(String),

    #[error("Failed to read roster file '{}': {source}", .path.display())]
    RosterFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode job: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to publish job: {0}")]
    Publish(#[from] QueueError),

    #[error("Result directory error: {0}")]
    Results(#[from] ResultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a Game Runner invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The game process crashed or reported an unusable result.
    #[error("Game runner crashed: {0}")]
    Crashed(String),

    /// The game exceeded its deadline and was killed.
    #[error("Game runner timed out after {0:?}")]
    TimedOut(Duration),

    /// The game was stopped because the worker no longer holds its bots.
    #[error("Game aborted: {0}")]
    Aborted(String),

    /// The runner could not be started at all.
    #[error("Failed to launch game runner: {0}")]
    Launch(String),
}

impl RunnerError {
    /// Returns whether this failure is a terminal, recordable game outcome.
    ///
    /// Launch failures are not: nothing was attempted, so they are treated as
    /// unclassified worker errors.
    pub fn is_recordable(&self) -> bool {
        matches!(
            self,
            RunnerError::Crashed(_) | RunnerError::TimedOut(_) | RunnerError::Aborted(_)
        )
    }
}

/// Errors that can occur while persisting or reading result records.
#[derive(Debug, Error)]
pub enum ResultError {
    /// A record for this job already exists.
    #[error("Result for job '{0}' is already recorded")]
    AlreadyRecorded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while taking bot reservations.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// Another in-flight job holds the bot.
    #[error("Bot '{bot}' is reserved by {holder}")]
    Conflict { bot: String, holder: String },

    /// A held lease expired and was taken over before it could be refreshed.
    #[error("Lease on bot '{bot}' held by {holder} was lost")]
    Lost { bot: String, holder: String },

    #[error("Lease IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lease JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_error_classification() {
        assert!(RunnerError::Crashed("segfault".into()).is_recordable());
        assert!(RunnerError::TimedOut(Duration::from_secs(600)).is_recordable());
        assert!(RunnerError::Aborted("lease lost".into()).is_recordable());
        assert!(!RunnerError::Launch("no such file".into()).is_recordable());
    }

    #[test]
    fn test_campaign_conflict_display() {
        let err = CampaignError::CampaignConflict(PathBuf::from("/tmp/results"));
        assert!(err.to_string().contains("/tmp/results"));
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn test_malformed_message_display() {
        let err = CodecError::malformed("missing field `scenario`");
        assert!(err.to_string().contains("scenario"));
    }
}
