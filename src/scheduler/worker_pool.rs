//! Worker pool supervising independent worker processes.
//!
//! Each worker is a separate OS process running one sequential worker loop
//! against the shared queue, so a crashed game client or a wedged worker
//! never takes its siblings down. Load balancing comes from the transport's
//! prefetch of one; the pool itself schedules nothing.
//!
//! # Features
//!
//! - Fixed number of worker processes
//! - Abandoned-message recovery before workers start
//! - Cooperative shutdown: a worker's stdin is closed and it stops after
//!   its current game
//! - Per-pool exit summary

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::queue::{QueueError, Transport};

/// Appended to every worker's arguments.
pub const STOP_ON_STDIN_EOF_FLAG: &str = "--stop-on-stdin-eof";

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker process could not be started.
    #[error("Failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// Queue recovery before start failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// One or more workers exited unsuccessfully.
    #[error("{} worker(s) failed: {}", .0.len(), .0.join(", "))]
    WorkersFailed(Vec<String>),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker processes to spawn.
    pub num_workers: usize,
    /// Executable started for each worker.
    pub program: PathBuf,
    /// Arguments shared by every worker. The pool appends `--name <name>`
    /// and the stdin shutdown flag.
    pub worker_args: Vec<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            program: PathBuf::from("match-forge"),
            worker_args: vec!["worker".to_string()],
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }
}

/// How the pool's workers ended.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl PoolStats {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.succeeded == self.num_workers
    }
}

type WorkerExit = (String, std::io::Result<ExitStatus>);

/// Supervises worker processes.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: JoinSet<WorkerExit>,
    stdins: Vec<ChildStdin>,
    is_running: bool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            workers: JoinSet::new(),
            stdins: Vec::new(),
            is_running: false,
        }
    }

    /// Name given to worker `index`.
    pub fn worker_name(index: usize) -> String {
        format!("worker-{}", index)
    }

    /// Recovers abandoned messages, then spawns every worker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    /// A spawn failure leaves already started workers running; call `wait`
    /// to shut them down.
    pub async fn start(&mut self, transport: &dyn Transport) -> Result<(), PoolError> {
        if self.is_running {
            return Err(PoolError::AlreadyRunning);
        }

        match transport.recover_abandoned().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered messages from dead workers"),
            Err(e) => warn!(error = %e, "Failed to recover abandoned messages"),
        }

        self.is_running = true;
        for index in 0..self.config.num_workers {
            let name = Self::worker_name(index);

            let mut child = Command::new(&self.config.program)
                .args(&self.config.worker_args)
                .arg("--name")
                .arg(&name)
                .arg(STOP_ON_STDIN_EOF_FLAG)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|source| PoolError::Spawn { index, source })?;

            if let Some(stdin) = child.stdin.take() {
                self.stdins.push(stdin);
            }

            info!(worker_id = %name, pid = ?child.id(), "Worker process started");
            self.workers.spawn(async move {
                let status = child.wait().await;
                (name, status)
            });
        }

        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Waits for every worker to exit.
    ///
    /// When `shutdown` completes, each worker's stdin is closed and the pool
    /// keeps waiting while they finish their current games.
    pub async fn wait<F>(&mut self, shutdown: F) -> Result<PoolStats, PoolError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = PoolStats {
            num_workers: self.config.num_workers,
            ..Default::default()
        };
        let mut shutdown_sent = false;

        loop {
            tokio::select! {
                joined = self.workers.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((name, Ok(status))) if status.success() => {
                            info!(worker_id = %name, "Worker exited");
                            stats.succeeded += 1;
                        }
                        Ok((name, Ok(status))) => {
                            error!(worker_id = %name, status = %status, "Worker failed");
                            stats.failed.push(name);
                        }
                        Ok((name, Err(e))) => {
                            error!(worker_id = %name, error = %e, "Failed to wait for worker");
                            stats.failed.push(name);
                        }
                        Err(e) => {
                            error!(error = %e, "Worker supervisor task panicked");
                            stats.failed.push("unknown".to_string());
                        }
                    }
                }
                _ = &mut shutdown, if !shutdown_sent => {
                    info!("Shutdown requested, workers stop after their current game");
                    self.stdins.clear();
                    shutdown_sent = true;
                }
            }
        }

        self.stdins.clear();
        self.is_running = false;

        if stats.failed.is_empty() {
            info!(succeeded = stats.succeeded, "Worker pool finished");
            Ok(stats)
        } else {
            Err(PoolError::WorkersFailed(stats.failed))
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}
