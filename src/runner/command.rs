//! External-process game runner.
//!
//! A game is one child process. The runner starts it, then waits in a
//! poll-and-pump loop: every pump period it services liveness for the
//! caller, and at the deadline it kills the child. The structured outcome
//! is read from the child's stdout as JSON.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::RunnerError;

use super::config::CommandRunnerConfig;
use super::result::GameOutcome;
use super::{GameRunner, LivenessPump, MatchRequest};

/// Bytes of stderr kept in crash reports.
const STDERR_TAIL: usize = 2048;

/// Runs each game as an external command.
pub struct CommandRunner {
    config: CommandRunnerConfig,
}

impl CommandRunner {
    pub fn new(config: CommandRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandRunnerConfig {
        &self.config
    }

    /// Expands the argument templates for one game.
    pub fn render_args(&self, request: &MatchRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(self.config.args.len() + request.bots.len());

        for template in &self.config.args {
            match template.as_str() {
                "{bots}" => args.extend(request.bots.iter().cloned()),
                "{mode_flags}" => args.extend(mode_flags(request)),
                _ => args.push(render(template, request)),
            }
        }

        args
    }
}

fn render(template: &str, request: &MatchRequest) -> String {
    template
        .replace("{bots}", &request.bots.join(","))
        .replace("{map}", &request.map)
        .replace("{game_name}", &request.job_id)
        .replace("{timeout}", &request.mode.timeout.as_secs().to_string())
        .replace("{game_type}", request.mode.game_type.as_str())
        .replace("{game_speed}", &request.mode.game_speed.to_string())
}

fn mode_flags(request: &MatchRequest) -> Vec<String> {
    let mode = &request.mode;
    let mut flags = Vec::new();

    if mode.headless {
        flags.push("--headless".to_string());
    }
    if mode.read_overwrite {
        flags.push("--read-overwrite".to_string());
    }
    if mode.random_names {
        flags.push("--random-names".to_string());
    }
    if let Some(ref image) = mode.docker_image {
        flags.push("--docker-image".to_string());
        flags.push(image.clone());
    }
    if let Some(ref opt) = mode.opt {
        flags.push("--opt".to_string());
        flags.push(opt.clone());
    }

    flags
}

fn spawn_reader<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Parses the outcome from stdout: either the whole output is one JSON
/// object, or the last line that looks like one is.
fn parse_outcome(stdout: &str) -> Result<GameOutcome, RunnerError> {
    let trimmed = stdout.trim();
    if let Ok(outcome) = serde_json::from_str::<GameOutcome>(trimmed) {
        return Ok(outcome);
    }

    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .and_then(|line| serde_json::from_str::<GameOutcome>(line).ok())
        .ok_or_else(|| RunnerError::Crashed("game exited without a readable outcome".to_string()))
}

/// Kills a game that will not be waited for and drops its output.
async fn abandon(child: &mut Child, readers: [&JoinHandle<String>; 2], job_id: &str) {
    if let Err(e) = child.kill().await {
        warn!(job_id = %job_id, error = %e, "Failed to kill game process");
    }
    for reader in readers {
        reader.abort();
    }
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl GameRunner for CommandRunner {
    async fn run(
        &self,
        request: &MatchRequest,
        pump: &dyn LivenessPump,
    ) -> Result<GameOutcome, RunnerError> {
        let start = Instant::now();
        let args = self.render_args(request);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        info!(
            job_id = %request.job_id,
            program = %self.config.program,
            "Starting game"
        );
        debug!(args = ?args, "Game arguments");

        let mut child = cmd.spawn().map_err(|e| {
            RunnerError::Launch(format!("Failed to spawn {}: {}", self.config.program, e))
        })?;

        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        let deadline = tokio::time::Instant::now() + request.mode.timeout;
        let mut ticker = tokio::time::interval(self.config.pump_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| RunnerError::Crashed(format!("Process error: {}", e)))?;
                }
                _ = ticker.tick() => {
                    if let Err(e) = pump.pump().await {
                        warn!(job_id = %request.job_id, error = %e, "Liveness pump failed, killing game");
                        abandon(&mut child, [&stdout_task, &stderr_task], &request.job_id).await;
                        return Err(e);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        job_id = %request.job_id,
                        timeout_secs = request.mode.timeout.as_secs(),
                        "Game exceeded its deadline, killing it"
                    );
                    abandon(&mut child, [&stdout_task, &stderr_task], &request.job_id).await;
                    return Err(RunnerError::TimedOut(request.mode.timeout));
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        debug!(
            job_id = %request.job_id,
            duration_ms = start.elapsed().as_millis() as u64,
            exit = ?status.code(),
            "Game process exited"
        );

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(RunnerError::Crashed(format!(
                "exit status {}: {}",
                code,
                tail(&stderr, STDERR_TAIL)
            )));
        }

        parse_outcome(&stdout)
    }
}
