//! Configuration for game runs.
//!
//! [`ExecutionMode`] is chosen once at worker startup and applies to every
//! game that worker plays. [`CommandRunnerConfig`] describes how the external
//! game process is launched.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default game timeout.
pub const DEFAULT_GAME_TIMEOUT: Duration = Duration::from_secs(600);

/// Default liveness pump period while a game runs.
pub const DEFAULT_PUMP_PERIOD: Duration = Duration::from_secs(5);

/// Minimum number of pumps within every TTL the pump keeps alive.
pub const PUMPS_PER_TTL: u32 = 3;

/// Game type passed to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    #[default]
    FreeForAll,
    Melee,
    OneOnOne,
    UseMapSettings,
    TopVsBottom,
    TeamMelee,
    TeamFreeForAll,
}

impl GameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::FreeForAll => "FREE_FOR_ALL",
            GameType::Melee => "MELEE",
            GameType::OneOnOne => "ONE_ON_ONE",
            GameType::UseMapSettings => "USE_MAP_SETTINGS",
            GameType::TopVsBottom => "TOP_VS_BOTTOM",
            GameType::TeamMelee => "TEAM_MELEE",
            GameType::TeamFreeForAll => "TEAM_FREE_FOR_ALL",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "FREE_FOR_ALL" => Ok(GameType::FreeForAll),
            "MELEE" => Ok(GameType::Melee),
            "ONE_ON_ONE" => Ok(GameType::OneOnOne),
            "USE_MAP_SETTINGS" => Ok(GameType::UseMapSettings),
            "TOP_VS_BOTTOM" => Ok(GameType::TopVsBottom),
            "TEAM_MELEE" => Ok(GameType::TeamMelee),
            "TEAM_FREE_FOR_ALL" => Ok(GameType::TeamFreeForAll),
            other => Err(format!("Unknown game type: {}", other)),
        }
    }
}

/// Execution options shared by every game a worker runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMode {
    pub game_type: GameType,
    /// Pause between frames in ms; -1 keeps the game default.
    pub game_speed: i32,
    /// Deadline for one game.
    pub timeout: Duration,
    /// Bots keep learning state between games. Requires bot reservations.
    pub read_overwrite: bool,
    /// Randomize player names.
    pub random_names: bool,
    /// Run without a display.
    pub headless: bool,
    /// Image the runner launches the game in.
    pub docker_image: Option<String>,
    /// Extra options passed through to the runner verbatim.
    pub opt: Option<String>,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self {
            game_type: GameType::default(),
            game_speed: 0,
            timeout: DEFAULT_GAME_TIMEOUT,
            read_overwrite: false,
            random_names: false,
            headless: true,
            docker_image: None,
            opt: None,
        }
    }
}

impl ExecutionMode {
    pub fn with_game_type(mut self, game_type: GameType) -> Self {
        self.game_type = game_type;
        self
    }

    pub fn with_game_speed(mut self, speed: i32) -> Self {
        self.game_speed = speed;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_overwrite(mut self, enabled: bool) -> Self {
        self.read_overwrite = enabled;
        self
    }

    pub fn with_random_names(mut self, enabled: bool) -> Self {
        self.random_names = enabled;
        self
    }

    pub fn with_docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = Some(image.into());
        self
    }

    pub fn with_opt(mut self, opt: impl Into<String>) -> Self {
        self.opt = Some(opt.into());
        self
    }

    /// Whether games mutate shared bot state, so two games touching the same
    /// bot must never overlap.
    pub fn requires_reservation(&self) -> bool {
        self.read_overwrite
    }
}

/// How the external game process is launched.
///
/// Argument templates may contain `{bots}` (as a whole argument it expands to
/// one argument per bot, elsewhere to a comma-separated list), `{map}`,
/// `{game_name}`, `{timeout}`, `{game_type}` and `{game_speed}`. A whole
/// `{mode_flags}` argument expands to the execution-mode switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the game process.
    pub working_dir: Option<PathBuf>,
    /// How often liveness is pumped while waiting for the process.
    pub pump_period: Duration,
    /// Extra environment variables.
    pub env_vars: Vec<(String, String)>,
}

impl Default for CommandRunnerConfig {
    fn default() -> Self {
        Self {
            program: "scbw-match".to_string(),
            args: default_args(),
            working_dir: None,
            pump_period: DEFAULT_PUMP_PERIOD,
            env_vars: Vec::new(),
        }
    }
}

fn default_args() -> Vec<String> {
    [
        "--bots",
        "{bots}",
        "--map",
        "{map}",
        "--game-name",
        "{game_name}",
        "--timeout",
        "{timeout}",
        "--game-type",
        "{game_type}",
        "--game-speed",
        "{game_speed}",
        "{mode_flags}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl CommandRunnerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Replaces the argument templates.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_pump_period(mut self, period: Duration) -> Self {
        self.pump_period = period;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}
