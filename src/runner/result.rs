//! Structured outcome reported by a finished game.

use serde::{Deserialize, Serialize};

/// What the game process reports on stdout when it exits cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    /// Index into the job's participants of the winning player.
    #[serde(default)]
    pub winner_player: Option<usize>,
    /// In-game time in seconds.
    #[serde(default)]
    pub game_time: Option<f64>,
    /// Race played by each participant, in participant order.
    #[serde(default)]
    pub races: Option<Vec<String>>,
    #[serde(default)]
    pub replay_files: Vec<String>,
    #[serde(default)]
    pub log_files: Vec<String>,
    /// A bot or the game client crashed during play.
    #[serde(default)]
    pub is_crashed: bool,
    /// The game hit its in-game time limit.
    #[serde(default)]
    pub is_gametime_outed: bool,
    /// The game hit its wall-clock limit.
    #[serde(default)]
    pub is_realtime_outed: bool,
}

impl GameOutcome {
    /// A clean win for the given player.
    pub fn won_by(player: usize, game_time: f64) -> Self {
        Self {
            winner_player: Some(player),
            game_time: Some(game_time),
            ..Default::default()
        }
    }
}
