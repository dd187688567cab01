//! Result Record: the durable outcome of one job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;
use crate::runner::{ExecutionMode, GameOutcome, GameType};
use crate::scheduler::Job;

/// File name prefix of records for jobs that did not finish.
pub const FAILED_PREFIX: &str = "failed_";

/// How a job ended.
///
/// Every game that returns an outcome is `Finished`, draws and in-game time
/// limits included. `Crashed` and `TimedOut` come from runner failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Finished,
    Crashed,
    TimedOut,
}

/// One persisted record per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub bots: Vec<String>,
    pub map: String,
    pub game_type: GameType,
    pub game_speed: i32,
    /// Game deadline in seconds.
    pub timeout: u64,
    pub read_overwrite: bool,
    pub is_finished: bool,
    pub outcome: Outcome,
    pub winner: Option<String>,
    pub loser: Option<String>,
    pub winner_player: Option<usize>,
    pub races: Option<Vec<String>>,
    pub game_time: Option<f64>,
    /// Flags reported by the game itself.
    #[serde(default)]
    pub is_crashed: bool,
    #[serde(default)]
    pub is_gametime_outed: bool,
    #[serde(default)]
    pub is_realtime_outed: bool,
    #[serde(default)]
    pub replay_files: Vec<String>,
    #[serde(default)]
    pub log_files: Vec<String>,
    pub error: Option<String>,
    pub worker_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRecord {
    fn base(job: &Job, mode: &ExecutionMode, worker_id: &str, outcome: Outcome) -> Self {
        Self {
            job_id: job.job_id.clone(),
            bots: job.participants.clone(),
            map: job.scenario.clone(),
            game_type: mode.game_type,
            game_speed: mode.game_speed,
            timeout: mode.timeout.as_secs(),
            read_overwrite: mode.read_overwrite,
            is_finished: outcome == Outcome::Finished,
            outcome,
            winner: None,
            loser: None,
            winner_player: None,
            races: None,
            game_time: None,
            is_crashed: false,
            is_gametime_outed: false,
            is_realtime_outed: false,
            replay_files: Vec::new(),
            log_files: Vec::new(),
            error: None,
            worker_id: worker_id.to_string(),
            recorded_at: Utc::now(),
        }
    }

    /// Record for a game that ran to the end and reported an outcome.
    ///
    /// Winner and loser are resolved from the participant list; a loser is
    /// only named for two-player games. A game without a winner still
    /// counts as finished.
    pub fn from_outcome(
        job: &Job,
        mode: &ExecutionMode,
        game: &GameOutcome,
        worker_id: &str,
    ) -> Self {
        let mut record = Self::base(job, mode, worker_id, Outcome::Finished);

        record.winner_player = game.winner_player;
        record.races = game.races.clone();
        record.game_time = game.game_time;
        record.is_crashed = game.is_crashed;
        record.is_gametime_outed = game.is_gametime_outed;
        record.is_realtime_outed = game.is_realtime_outed;
        record.replay_files = game.replay_files.clone();
        record.log_files = game.log_files.clone();

        if let Some(idx) = game.winner_player {
            record.winner = job.participants.get(idx).cloned();
            if job.participants.len() == 2 && idx < 2 {
                record.loser = job.participants.get(1 - idx).cloned();
            }
        }

        record
    }

    /// Record for a runner failure.
    pub fn from_failure(
        job: &Job,
        mode: &ExecutionMode,
        err: &RunnerError,
        worker_id: &str,
    ) -> Self {
        let outcome = match err {
            RunnerError::TimedOut(_) => Outcome::TimedOut,
            _ => Outcome::Crashed,
        };
        let mut record = Self::base(job, mode, worker_id, outcome);
        record.error = Some(err.to_string());
        record
    }

    /// File name under the result directory.
    pub fn file_name(&self) -> String {
        if self.is_finished {
            format!("{}.json", self.job_id)
        } else {
            format!("{}{}.json", FAILED_PREFIX, self.job_id)
        }
    }
}
