//! Game Runner boundary.
//!
//! A game is opaque to the dispatcher: it is handed participants, a map, a
//! job identity and an [`ExecutionMode`], and it either reports a
//! [`GameOutcome`] or fails with a [`RunnerError`].
//!
//! ```text
//! Worker ──MatchRequest──▶ GameRunner ──spawn──▶ game process
//!    ▲                         │
//!    └──── LivenessPump ◀──────┘  (every pump period until exit or deadline)
//! ```
//!
//! Runners must call the pump on a bounded period for the whole game, so a
//! worker blocked inside a multi-minute match keeps its broker heartbeat and
//! bot leases alive.

pub mod command;
pub mod config;
pub mod result;

use async_trait::async_trait;

use crate::scheduler::Job;

pub use crate::error::RunnerError;
pub use command::CommandRunner;
pub use config::{CommandRunnerConfig, ExecutionMode, GameType};
pub use result::GameOutcome;

/// Everything a runner needs to play one game.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRequest {
    pub job_id: String,
    pub bots: Vec<String>,
    pub map: String,
    pub mode: ExecutionMode,
}

impl MatchRequest {
    pub fn from_job(job: &Job, mode: &ExecutionMode) -> Self {
        Self {
            job_id: job.job_id.clone(),
            bots: job.participants.clone(),
            map: job.scenario.clone(),
            mode: mode.clone(),
        }
    }
}

/// Callback serviced periodically while a game runs.
///
/// An error stops the game: the runner kills it and returns the error.
#[async_trait]
pub trait LivenessPump: Send + Sync {
    async fn pump(&self) -> Result<(), RunnerError>;
}

/// Pump that does nothing.
pub struct NoopPump;

#[async_trait]
impl LivenessPump for NoopPump {
    async fn pump(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Plays one game to completion or deadline.
#[async_trait]
pub trait GameRunner: Send + Sync {
    async fn run(
        &self,
        request: &MatchRequest,
        pump: &dyn LivenessPump,
    ) -> Result<GameOutcome, RunnerError>;
}
