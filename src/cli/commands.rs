//! CLI command definitions for match-forge.
//!
//! `produce` publishes a campaign, `consume` starts a pool of worker
//! processes, and `status` / `dead-letters` inspect the queue. The hidden
//! `worker` command is what each pool process runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::campaign::{publish_campaign, read_lines, AssetDirs, CampaignConfig};
use crate::results::ResultSink;
use crate::runner::config::PUMPS_PER_TTL;
use crate::runner::{CommandRunner, CommandRunnerConfig, ExecutionMode, GameType};
use crate::scheduler::{
    JobQueue, LeaseArena, QueueStats, Transport, Worker, WorkerConfig, WorkerPool,
    WorkerPoolConfig, DEFAULT_HEARTBEAT_TTL, DEFAULT_LEASE_TTL,
};

/// Default Redis URL.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default queue name.
const DEFAULT_QUEUE: &str = "play";

/// Distributed bot-vs-bot match dispatcher.
#[derive(Parser, Debug)]
#[command(name = "match-forge")]
#[command(about = "Distribute bot match campaigns across a pool of workers")]
#[command(version)]
#[command(
    long_about = "match-forge expands bot and map rosters into a campaign of match jobs, publishes them to a Redis queue, and runs them on a pool of worker processes that record one result file per job.\n\nExample usage:\n  match-forge produce --bot-file bots.txt --map-file maps.txt --result-dir ./results\n  match-forge consume --result-dir ./results --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Generate a campaign and publish every job.
    #[command(alias = "prod")]
    Produce(ProduceArgs),

    /// Run a pool of worker processes against the queue.
    Consume(ConsumeArgs),

    /// Run a single worker loop (started by `consume`).
    #[command(hide = true)]
    Worker(WorkerCommandArgs),

    /// Show queue and result-directory counts.
    Status(StatusArgs),

    /// Print dead-lettered messages without removing them.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),
}

/// Queue connection settings.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct QueueArgs {
    /// Redis connection URL.
    #[arg(long, env = "MATCH_FORGE_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Name of the job queue.
    #[arg(long, env = "MATCH_FORGE_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,
}

impl QueueArgs {
    fn to_args(&self) -> Vec<String> {
        vec![
            format!("--redis-url={}", self.redis_url),
            format!("--queue={}", self.queue),
        ]
    }
}

/// Arguments for `match-forge produce`.
#[derive(Args, Debug)]
pub struct ProduceArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Newline-separated list of bots.
    #[arg(long)]
    pub bot_file: PathBuf,

    /// Newline-separated list of maps.
    #[arg(long)]
    pub map_file: PathBuf,

    /// Play this bot against every bot in the roster instead of all-vs-all.
    #[arg(long)]
    pub test_bot: Option<String>,

    /// Number of rounds over the whole pairing.
    #[arg(long, default_value = "10")]
    pub repeat_games: usize,

    /// Directory holding one sub-directory per bot. Checked before publishing.
    #[arg(long, requires = "map_dir")]
    pub bot_dir: Option<PathBuf>,

    /// Directory holding the map files. Checked before publishing.
    #[arg(long, requires = "bot_dir")]
    pub map_dir: Option<PathBuf>,

    /// Result directory of the campaign. Must be empty.
    #[arg(long)]
    pub result_dir: PathBuf,

    /// Seed for the pair shuffle and job ids.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Settings shared by every worker process.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    /// Directory receiving one result file per job.
    #[arg(long)]
    pub result_dir: PathBuf,

    /// Bot lease directory shared by all workers (used with --read-overwrite).
    #[arg(long, default_value = "leases")]
    pub lease_dir: PathBuf,

    /// Program that plays one game.
    #[arg(long, default_value = "scbw-match")]
    pub runner: String,

    /// Replaces the runner's argument templates. Repeat for each argument.
    #[arg(long = "runner-arg", allow_hyphen_values = true)]
    pub runner_args: Vec<String>,

    /// Working directory of the game process.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Game type passed to the runner.
    #[arg(long, default_value = "FREE_FOR_ALL")]
    pub game_type: GameType,

    /// Pause between frames in ms; -1 keeps the game default.
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub game_speed: i32,

    /// Game deadline in seconds.
    #[arg(long, default_value = "600")]
    pub timeout: u64,

    /// Bots keep learning state between games; enables bot reservations.
    #[arg(long)]
    pub read_overwrite: bool,

    /// Randomize player names.
    #[arg(long)]
    pub random_names: bool,

    /// Image the runner launches games in.
    #[arg(long)]
    pub docker_image: Option<String>,

    /// Extra options passed to the runner verbatim.
    #[arg(long, allow_hyphen_values = true)]
    pub opt: Option<String>,

    /// Seconds between liveness pumps while a game runs.
    #[arg(long, default_value = "5")]
    pub pump_period: u64,

    /// Conflict requeues allowed before a job is dead-lettered.
    #[arg(long, default_value = "1000")]
    pub max_requeues: u32,

    /// Stop once the queue is empty.
    #[arg(long)]
    pub exit_when_idle: bool,
}

impl WorkerArgs {
    /// Rejects a pump period that cannot keep the broker heartbeat, and the
    /// bot leases when reservations are on, alive through a long game.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ttl = DEFAULT_HEARTBEAT_TTL;
        if self.read_overwrite {
            ttl = ttl.min(DEFAULT_LEASE_TTL);
        }
        let max = ttl / PUMPS_PER_TTL;
        let pump = Duration::from_secs(self.pump_period);

        if pump.is_zero() || pump > max {
            anyhow::bail!(
                "--pump-period must be between 1 and {} seconds (a third of the {} s liveness TTL), got {}",
                max.as_secs(),
                ttl.as_secs(),
                self.pump_period
            );
        }
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        let mut mode = ExecutionMode::default()
            .with_game_type(self.game_type)
            .with_game_speed(self.game_speed)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_read_overwrite(self.read_overwrite)
            .with_random_names(self.random_names);
        if let Some(ref image) = self.docker_image {
            mode = mode.with_docker_image(image.clone());
        }
        if let Some(ref opt) = self.opt {
            mode = mode.with_opt(opt.clone());
        }
        mode
    }

    pub fn runner_config(&self) -> CommandRunnerConfig {
        let mut config = CommandRunnerConfig::new(self.runner.clone())
            .with_pump_period(Duration::from_secs(self.pump_period));
        if !self.runner_args.is_empty() {
            config = config.with_args(self.runner_args.clone());
        }
        if let Some(ref dir) = self.working_dir {
            config = config.with_working_dir(dir.clone());
        }
        config
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_max_requeues(self.max_requeues)
            .with_exit_when_idle(self.exit_when_idle)
    }

    /// Re-renders these settings as command-line arguments for a child.
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--result-dir={}", self.result_dir.display()),
            format!("--lease-dir={}", self.lease_dir.display()),
            format!("--runner={}", self.runner),
            format!("--game-type={}", self.game_type),
            format!("--game-speed={}", self.game_speed),
            format!("--timeout={}", self.timeout),
            format!("--pump-period={}", self.pump_period),
            format!("--max-requeues={}", self.max_requeues),
        ];
        args.extend(self.runner_args.iter().map(|a| format!("--runner-arg={}", a)));
        if let Some(ref dir) = self.working_dir {
            args.push(format!("--working-dir={}", dir.display()));
        }
        if let Some(ref image) = self.docker_image {
            args.push(format!("--docker-image={}", image));
        }
        if let Some(ref opt) = self.opt {
            args.push(format!("--opt={}", opt));
        }
        for (enabled, flag) in [
            (self.read_overwrite, "--read-overwrite"),
            (self.random_names, "--random-names"),
            (self.exit_when_idle, "--exit-when-idle"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }
        args
    }
}

/// Arguments for `match-forge consume`.
#[derive(Args, Debug)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Number of worker processes.
    #[arg(short = 'n', long, default_value = "4")]
    pub workers: usize,
}

/// Arguments for the hidden `match-forge worker` command.
#[derive(Args, Debug)]
pub struct WorkerCommandArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Worker name; a random suffix is added for the consumer id.
    #[arg(long, default_value = "worker")]
    pub name: String,

    /// Stop after the current game once stdin is closed.
    #[arg(long)]
    pub stop_on_stdin_eof: bool,
}

/// Arguments for `match-forge status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Also summarize this result directory.
    #[arg(long)]
    pub result_dir: Option<PathBuf>,

    /// Keep polling until the queue is drained.
    #[arg(long)]
    pub wait: bool,

    /// Seconds between polls with --wait.
    #[arg(long, default_value = "1")]
    pub poll_interval: u64,
}

/// Arguments for `match-forge dead-letters`.
#[derive(Args, Debug)]
pub struct DeadLettersArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Maximum number of entries to print, newest first.
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments.
///
/// Call this first to get access to CLI args (e.g., log_level) before
/// initializing logging.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let log_level = cli.log_level;
    match cli.command {
        Commands::Produce(args) => run_produce_command(args).await,
        Commands::Consume(args) => run_consume_command(args, &log_level).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(args).await,
    }
}

async fn connect(queue: &QueueArgs) -> anyhow::Result<JobQueue> {
    JobQueue::connect(&queue.redis_url, &queue.queue)
        .await
        .with_context(|| format!("Failed to connect to {}", queue.redis_url))
}

async fn run_produce_command(args: ProduceArgs) -> anyhow::Result<()> {
    let bots = read_lines(&args.bot_file)?;
    let maps = read_lines(&args.map_file)?;

    let mut config = CampaignConfig::new(bots, maps).with_repeat_games(args.repeat_games);
    if let Some(test_bot) = args.test_bot {
        config = config.with_test_bot(test_bot);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let assets = match (args.bot_dir, args.map_dir) {
        (Some(bot_dir), Some(map_dir)) => Some(AssetDirs::new(bot_dir, map_dir)),
        _ => None,
    };
    if assets.is_none() {
        warn!("No --bot-dir/--map-dir given, skipping asset checks");
    }

    let queue = connect(&args.queue).await?;
    let results = ResultSink::new(&args.result_dir);

    let report = publish_campaign(&queue, &config, assets.as_ref(), &results)
        .await
        .context("Campaign was not published")?;

    println!(
        "Published {} jobs to queue '{}' ({})",
        report.published,
        args.queue.queue,
        if report.one_vs_all {
            "one-vs-all"
        } else {
            "all-vs-all"
        }
    );
    Ok(())
}

async fn run_consume_command(args: ConsumeArgs, log_level: &str) -> anyhow::Result<()> {
    args.worker.validate()?;
    let program = std::env::current_exe().context("Cannot locate the match-forge executable")?;

    let mut worker_args = vec!["worker".to_string(), format!("--log-level={}", log_level)];
    worker_args.extend(args.queue.to_args());
    worker_args.extend(args.worker.to_args());

    let queue = connect(&args.queue).await?;
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(args.workers)
            .with_program(program)
            .with_worker_args(worker_args),
    );

    let started = pool.start(&queue).await;
    let stats = pool
        .wait(async {
            if started.is_ok() {
                let _ = tokio::signal::ctrl_c().await;
            }
        })
        .await;
    started?;
    let stats = stats?;

    println!("All {} workers finished", stats.succeeded);
    Ok(())
}

async fn run_worker_command(args: WorkerCommandArgs) -> anyhow::Result<()> {
    args.worker.validate()?;
    let mode = args.worker.execution_mode();
    let queue = JobQueue::connect_as(&args.queue.redis_url, &args.queue.queue, &args.name)
        .await
        .with_context(|| format!("Failed to connect to {}", args.queue.redis_url))?;

    let runner = CommandRunner::new(args.worker.runner_config());
    let results = ResultSink::new(&args.worker.result_dir);
    results.ensure_dir().await?;

    let mut worker = Worker::new(Arc::new(queue), Arc::new(runner), results, mode)
        .with_config(args.worker.worker_config());
    if worker.mode().requires_reservation() {
        let leases = LeaseArena::open(&args.worker.lease_dir).with_context(|| {
            format!(
                "Failed to open lease directory {}",
                args.worker.lease_dir.display()
            )
        })?;
        worker = worker.with_leases(leases);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    if args.stop_on_stdin_eof {
        watch_stdin(shutdown_tx.clone());
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current game");
            let _ = shutdown_tx.send(());
        }
        // Keep the channel open so the worker sees the signal, not a close.
        std::future::pending::<()>().await;
    });

    let stats = worker.run(shutdown_rx).await?;
    info!(processed = stats.processed(), "Worker exiting");
    Ok(())
}

/// Signals shutdown once stdin reaches EOF.
///
/// Uses a plain thread: a blocking stdin read cannot be cancelled and must
/// not hold up runtime shutdown.
fn watch_stdin(shutdown_tx: broadcast::Sender<()>) {
    std::thread::spawn(move || {
        let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());
        info!("Pool closed stdin, stopping after the current game");
        let _ = shutdown_tx.send(());
    });
}

fn print_stats(stats: &QueueStats) {
    println!(
        "Queue '{}': {} pending, {} in flight, {} dead-lettered",
        stats.queue_name, stats.pending, stats.in_flight, stats.dead_lettered
    );
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let queue = connect(&args.queue).await?;
    let results = args.result_dir.as_ref().map(ResultSink::new);
    let poll = Duration::from_secs(args.poll_interval.max(1));

    loop {
        let stats = queue.stats().await?;
        print_stats(&stats);

        if let Some(ref results) = results {
            let summary = results.summary().await?;
            println!(
                "Results in {}: {} finished, {} failed",
                results.dir().display(),
                summary.finished,
                summary.failed
            );
        }

        if !args.wait || stats.is_drained() {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    Ok(())
}

async fn run_dead_letters_command(args: DeadLettersArgs) -> anyhow::Result<()> {
    let queue = connect(&args.queue).await?;
    let entries = queue.dead_letters(args.limit).await?;

    if entries.is_empty() {
        println!("No dead-lettered messages in '{}'", args.queue.queue);
        return Ok(());
    }

    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_produce_defaults() {
        let cli = parse(&[
            "match-forge",
            "produce",
            "--bot-file",
            "bots.txt",
            "--map-file",
            "maps.txt",
            "--result-dir",
            "results",
        ]);

        match cli.command {
            Commands::Produce(args) => {
                assert_eq!(args.repeat_games, 10);
                assert!(args.test_bot.is_none());
                assert!(args.bot_dir.is_none());
            }
            other => panic!("expected produce, got {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_asset_dirs_go_together() {
        let result = Cli::try_parse_from([
            "match-forge",
            "produce",
            "--bot-file",
            "bots.txt",
            "--map-file",
            "maps.txt",
            "--result-dir",
            "results",
            "--bot-dir",
            "bots",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_args_survive_forwarding() {
        let cli = parse(&[
            "match-forge",
            "consume",
            "--result-dir",
            "results",
            "--read-overwrite",
            "--game-speed",
            "-1",
            "--game-type",
            "ONE_ON_ONE",
            "--runner-arg",
            "--map={map}",
            "--runner-arg",
            "{bots}",
            "--opt",
            "--fast",
            "--docker-image",
            "starcraft:game",
        ]);
        let Commands::Consume(consume) = cli.command else {
            panic!("expected consume");
        };

        let mut child = vec!["match-forge".to_string(), "worker".to_string()];
        child.extend(consume.queue.to_args());
        child.extend(consume.worker.to_args());
        child.push("--name=worker-0".to_string());

        let Commands::Worker(worker) = Cli::try_parse_from(child).unwrap().command else {
            panic!("expected worker");
        };
        assert_eq!(worker.worker, consume.worker);
        assert_eq!(worker.queue, consume.queue);
        assert_eq!(worker.name, "worker-0");
    }

    #[test]
    fn test_execution_mode_from_args() {
        let cli = parse(&[
            "match-forge",
            "worker",
            "--result-dir",
            "results",
            "--timeout",
            "90",
            "--random-names",
        ]);
        let Commands::Worker(args) = cli.command else {
            panic!("expected worker");
        };

        let mode = args.worker.execution_mode();
        assert_eq!(mode.timeout, Duration::from_secs(90));
        assert!(mode.random_names);
        assert!(!mode.requires_reservation());
        assert!(mode.headless);
        assert_eq!(args.worker.runner_config().program, "scbw-match");
    }

    fn worker_args(extra: &[&str]) -> WorkerArgs {
        let mut argv = vec!["match-forge", "worker", "--result-dir", "r"];
        argv.extend_from_slice(extra);
        match parse(&argv).command {
            Commands::Worker(args) => args.worker,
            other => panic!("expected worker, got {:?}", other),
        }
    }

    #[test]
    fn test_pump_period_must_fit_liveness_ttls() {
        assert!(worker_args(&[]).validate().is_ok());
        assert!(worker_args(&["--pump-period", "6"]).validate().is_ok());

        // Past a third of the heartbeat TTL.
        assert!(worker_args(&["--pump-period", "7"]).validate().is_err());
        assert!(worker_args(&["--pump-period", "30"]).validate().is_err());
        assert!(worker_args(&["--pump-period", "0"]).validate().is_err());

        let err = worker_args(&["--read-overwrite", "--pump-period", "120"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("--pump-period"));
    }

    #[test]
    fn test_dead_letters_limit() {
        let cli = parse(&["match-forge", "dead-letters", "--limit", "5"]);
        match cli.command {
            Commands::DeadLetters(args) => assert_eq!(args.limit, 5),
            other => panic!("expected dead-letters, got {:?}", other),
        }
    }
}
