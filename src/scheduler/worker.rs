//! Worker Loop.
//!
//! One worker handles one delivery at a time:
//!
//! ```text
//! decode ─▶ duplicate check ─▶ reserve ─▶ run ─▶ release ─▶ record ─▶ ack
//!   │             │               │
//!   ▼             ▼               ▼
//! dead-letter    ack       requeue copy + ack
//! ```
//!
//! A message is acknowledged only after its result record is durably
//! written. If the worker dies anywhere before that, the message is
//! redelivered and the duplicate check short-circuits when the record made
//! it to disk. Errors that fit none of the recorded outcomes are
//! dead-lettered with the raw body logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{ReservationError, ResultError, RunnerError};
use crate::results::{Outcome, ResultRecord, ResultSink};
use crate::runner::{ExecutionMode, GameRunner, LivenessPump, MatchRequest};

use super::codec;
use super::job::Job;
use super::queue::{Delivery, QueueError, Transport};
use super::reservation::{LeaseArena, Reservation};

/// Dead-letter reason once a job has been requeued too often.
pub const REQUEUE_LIMIT_REASON: &str = "reservation requeue limit exceeded";

/// Errors that stop a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The broker connection failed; the worker cannot continue.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Execution mode needs bot reservations but no lease directory is configured")]
    MissingLeaseArena,
}

/// Worker loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one consume call waits for a message.
    pub consume_wait: Duration,
    /// Conflict requeues allowed before a job is dead-lettered.
    pub max_requeues: u32,
    /// Pause after a conflict requeue.
    pub conflict_backoff: Duration,
    /// Redeliver messages of dead consumers whenever the queue looks empty.
    pub recover_when_idle: bool,
    /// Stop once the queue is empty instead of waiting for more work.
    pub exit_when_idle: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consume_wait: Duration::from_secs(5),
            max_requeues: 1000,
            conflict_backoff: Duration::from_secs(1),
            recover_when_idle: true,
            exit_when_idle: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_consume_wait(mut self, wait: Duration) -> Self {
        self.consume_wait = wait;
        self
    }

    pub fn with_max_requeues(mut self, max: u32) -> Self {
        self.max_requeues = max;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_recover_when_idle(mut self, enabled: bool) -> Self {
        self.recover_when_idle = enabled;
        self
    }

    pub fn with_exit_when_idle(mut self, enabled: bool) -> Self {
        self.exit_when_idle = enabled;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A result record was written and the message acknowledged.
    Recorded { outcome: Outcome },
    /// A record already existed; acknowledged without running.
    Duplicate,
    /// A bot was busy; a fresh copy went back on the queue.
    Requeued,
    /// Routed to the dead-letter list with this reason.
    DeadLettered(String),
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub finished: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Recorded {
                outcome: Outcome::Finished,
            } => self.finished += 1,
            Disposition::Recorded { .. } => self.failed += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::DeadLettered(_) => self.dead_lettered += 1,
        }
    }

    /// Deliveries handled in total.
    pub fn processed(&self) -> u64 {
        self.finished + self.failed + self.duplicates + self.requeued + self.dead_lettered
    }
}

/// Keeps the broker heartbeat and the bot leases alive while a game runs.
struct WorkerPump<'a> {
    transport: &'a dyn Transport,
    reservation: Option<&'a Reservation>,
}

#[async_trait]
impl LivenessPump for WorkerPump<'_> {
    async fn pump(&self) -> Result<(), RunnerError> {
        if let Err(e) = self.transport.pump_liveness().await {
            warn!(worker_id = %self.transport.consumer_id(), error = %e, "Liveness pump failed");
        }
        if let Some(reservation) = self.reservation {
            match reservation.refresh() {
                Ok(()) => {}
                Err(e @ ReservationError::Lost { .. }) => {
                    error!(holder = %reservation.holder(), error = %e, "Bot lease lost mid-game");
                    return Err(RunnerError::Aborted(e.to_string()));
                }
                Err(e) => {
                    warn!(holder = %reservation.holder(), error = %e, "Failed to refresh bot leases")
                }
            }
        }
        Ok(())
    }
}

/// A single sequential consumer.
pub struct Worker {
    transport: Arc<dyn Transport>,
    runner: Arc<dyn GameRunner>,
    results: ResultSink,
    leases: Option<LeaseArena>,
    mode: ExecutionMode,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        transport: Arc<dyn Transport>,
        runner: Arc<dyn GameRunner>,
        results: ResultSink,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            transport,
            runner,
            results,
            leases: None,
            mode,
            config: WorkerConfig::default(),
        }
    }

    /// Lease directory shared by every worker of the campaign.
    pub fn with_leases(mut self, leases: LeaseArena) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(&self) -> &str {
        self.transport.consumer_id()
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// Runs until shutdown is signalled, the queue runs dry with
    /// `exit_when_idle`, or the broker fails.
    ///
    /// Shutdown is only observed between deliveries; a running game is
    /// always allowed to finish.
    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<WorkerStats, WorkerError> {
        if self.mode.requires_reservation() && self.leases.is_none() {
            return Err(WorkerError::MissingLeaseArena);
        }

        let mut stats = WorkerStats::default();
        info!(
            worker_id = %self.id(),
            reservations = self.mode.requires_reservation(),
            "Worker started"
        );

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id(), "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => break,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.transport.consume(self.config.consume_wait).await? {
                Some(delivery) => {
                    let disposition = self.handle_delivery(delivery).await?;
                    stats.record(&disposition);
                }
                None => {
                    if self.config.recover_when_idle {
                        let recovered = self.transport.recover_abandoned().await?;
                        if recovered > 0 {
                            info!(worker_id = %self.id(), recovered, "Recovered abandoned messages");
                            continue;
                        }
                    }
                    if self.config.exit_when_idle {
                        info!(worker_id = %self.id(), "Queue is empty, stopping");
                        break;
                    }
                    debug!(worker_id = %self.id(), "No jobs available");
                }
            }
        }

        self.transport.close().await?;
        info!(
            worker_id = %self.id(),
            finished = stats.finished,
            failed = stats.failed,
            duplicates = stats.duplicates,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// Takes one delivery through the whole state machine.
    ///
    /// Only broker failures are returned as errors; every other failure is
    /// settled on the message itself.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Disposition, WorkerError> {
        let job = match codec::decode(delivery.payload()) {
            Ok(job) => job,
            Err(e) => return self.dead_letter(&delivery, e.to_string()).await,
        };

        match self.results.exists(&job.job_id).await {
            Ok(true) => {
                info!(worker_id = %self.id(), job_id = %job.job_id, "Job already recorded, acknowledging");
                self.transport.ack(&delivery).await?;
                return Ok(Disposition::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                return self
                    .dead_letter(&delivery, format!("result lookup failed: {}", e))
                    .await
            }
        }

        let reservation = match self.reserve(&job) {
            Ok(reservation) => reservation,
            Err(ReservationError::Conflict { bot, holder }) => {
                return self.requeue_conflicted(&delivery, &job, &bot, &holder).await;
            }
            Err(e) => {
                return self
                    .dead_letter(&delivery, format!("reservation failed: {}", e))
                    .await
            }
        };

        info!(worker_id = %self.id(), job = %job, "Playing game");
        let request = MatchRequest::from_job(&job, &self.mode);
        let started = Instant::now();
        let result = {
            let pump = WorkerPump {
                transport: self.transport.as_ref(),
                reservation: reservation.as_ref(),
            };
            self.runner.run(&request, &pump).await
        };
        if let Some(reservation) = reservation {
            reservation.release();
        }

        let record = match result {
            Ok(game) => ResultRecord::from_outcome(&job, &self.mode, &game, self.id()),
            Err(e) if e.is_recordable() => {
                warn!(worker_id = %self.id(), job_id = %job.job_id, error = %e, "Game failed");
                ResultRecord::from_failure(&job, &self.mode, &e, self.id())
            }
            Err(e) => return self.dead_letter(&delivery, e.to_string()).await,
        };

        match self.results.write(&record).await {
            Ok(path) => {
                info!(
                    worker_id = %self.id(),
                    job_id = %job.job_id,
                    outcome = ?record.outcome,
                    duration_ms = started.elapsed().as_millis() as u64,
                    path = %path.display(),
                    "Game recorded"
                );
            }
            Err(ResultError::AlreadyRecorded(_)) => {
                info!(worker_id = %self.id(), job_id = %job.job_id, "Job recorded by another worker, acknowledging");
                self.transport.ack(&delivery).await?;
                return Ok(Disposition::Duplicate);
            }
            Err(e) => {
                return self
                    .dead_letter(&delivery, format!("failed to record result: {}", e))
                    .await
            }
        }

        self.transport.ack(&delivery).await?;
        Ok(Disposition::Recorded {
            outcome: record.outcome,
        })
    }

    fn reserve(&self, job: &Job) -> Result<Option<Reservation>, ReservationError> {
        if !self.mode.requires_reservation() {
            return Ok(None);
        }
        match self.leases {
            Some(ref arena) => {
                let holder = format!("{} ({})", self.id(), job.job_id);
                arena.try_acquire_all(&job.participants, &holder).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn requeue_conflicted(
        &self,
        delivery: &Delivery,
        job: &Job,
        bot: &str,
        holder: &str,
    ) -> Result<Disposition, WorkerError> {
        let next = job.requeued();
        if next.requeues > self.config.max_requeues {
            return self
                .dead_letter(delivery, REQUEUE_LIMIT_REASON.to_string())
                .await;
        }

        let payload = match codec::encode(&next) {
            Ok(payload) => payload,
            Err(e) => return self.dead_letter(delivery, e.to_string()).await,
        };

        debug!(
            worker_id = %self.id(),
            job_id = %job.job_id,
            bot = %bot,
            holder = %holder,
            requeues = next.requeues,
            "Bot is busy, requeuing job"
        );
        self.transport.requeue(delivery, &payload).await?;
        tokio::time::sleep(self.config.conflict_backoff).await;
        Ok(Disposition::Requeued)
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: String,
    ) -> Result<Disposition, WorkerError> {
        error!(
            worker_id = %self.id(),
            reason = %reason,
            body = %delivery.body_lossy(),
            "Dead-lettering message"
        );
        self.transport.reject(delivery, false, &reason).await?;
        Ok(Disposition::DeadLettered(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runner::GameOutcome;
    use crate::scheduler::MemoryBroker;

    const WAIT: Duration = Duration::from_millis(10);

    /// Reports a fixed result and counts invocations.
    struct FixedRunner {
        result: fn() -> Result<GameOutcome, RunnerError>,
        calls: AtomicUsize,
    }

    impl FixedRunner {
        fn new(result: fn() -> Result<GameOutcome, RunnerError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GameRunner for FixedRunner {
        async fn run(
            &self,
            _request: &MatchRequest,
            pump: &dyn LivenessPump,
        ) -> Result<GameOutcome, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            pump.pump().await?;
            (self.result)()
        }
    }

    fn win() -> Result<GameOutcome, RunnerError> {
        Ok(GameOutcome::won_by(0, 300.0))
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        broker: MemoryBroker,
        results: ResultSink,
        leases: LeaseArena,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let results = ResultSink::new(tmp.path().join("results"));
        let leases = LeaseArena::open(tmp.path().join("leases")).unwrap();
        Fixture {
            _tmp: tmp,
            broker: MemoryBroker::new("play"),
            results,
            leases,
        }
    }

    fn worker(fx: &Fixture, id: &str, runner: Arc<dyn GameRunner>, mode: ExecutionMode) -> Worker {
        Worker::new(
            Arc::new(fx.broker.connect(id)),
            runner,
            fx.results.clone(),
            mode,
        )
        .with_leases(fx.leases.clone())
        .with_config(
            WorkerConfig::default()
                .with_consume_wait(WAIT)
                .with_conflict_backoff(Duration::ZERO)
                .with_exit_when_idle(true),
        )
    }

    async fn publish(fx: &Fixture, job: &Job) {
        fx.broker
            .connect("producer")
            .publish(&codec::encode(job).unwrap())
            .await
            .unwrap();
    }

    async fn next(worker: &Worker) -> Delivery {
        worker
            .transport
            .consume(WAIT)
            .await
            .unwrap()
            .expect("a pending message")
    }

    #[tokio::test]
    async fn test_records_and_acks_finished_game() {
        let fx = fixture();
        let runner = FixedRunner::new(win);
        let w = worker(&fx, "worker-0", runner.clone(), ExecutionMode::default());
        publish(&fx, &Job::new(["A", "B"], "m1", "000000")).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::Recorded {
                outcome: Outcome::Finished
            }
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(fx.results.finished_path("000000").exists());
        assert_eq!(fx.broker.pending_len(), 0);
        assert_eq!(fx.broker.liveness_pumps("worker-0"), 1);
    }

    #[tokio::test]
    async fn test_existing_record_is_acked_without_running() {
        let fx = fixture();
        let job = Job::new(["A", "B"], "m1", "000001");
        fx.results
            .write(&ResultRecord::from_outcome(
                &job,
                &ExecutionMode::default(),
                &GameOutcome::won_by(1, 10.0),
                "earlier-worker",
            ))
            .await
            .unwrap();

        let runner = FixedRunner::new(win);
        let w = worker(&fx, "worker-0", runner.clone(), ExecutionMode::default());
        publish(&fx, &job).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert_eq!(disposition, Disposition::Duplicate);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(fx.broker.dead_lettered().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered() {
        let fx = fixture();
        let runner = FixedRunner::new(win);
        let w = worker(&fx, "worker-0", runner.clone(), ExecutionMode::default());
        fx.broker
            .connect("producer")
            .publish(br#"{"participants":["A","B"]}"#)
            .await
            .unwrap();

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert!(matches!(disposition, Disposition::DeadLettered(ref r) if r.contains("Malformed")));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.broker.dead_lettered().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_as_failed() {
        let fx = fixture();
        let runner = FixedRunner::new(|| Err(RunnerError::TimedOut(Duration::from_secs(600))));
        let w = worker(&fx, "worker-0", runner, ExecutionMode::default());
        publish(&fx, &Job::new(["A", "B"], "m1", "000002")).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::Recorded {
                outcome: Outcome::TimedOut
            }
        );
        let record = fx.results.read("000002").await.unwrap().unwrap();
        assert!(!record.is_finished);
        assert!(fx.results.failed_path("000002").exists());
        assert_eq!(fx.broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_dead_lettered() {
        let fx = fixture();
        let runner = FixedRunner::new(|| Err(RunnerError::Launch("no such file".into())));
        let w = worker(&fx, "worker-0", runner, ExecutionMode::default());
        publish(&fx, &Job::new(["A", "B"], "m1", "000003")).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert!(matches!(disposition, Disposition::DeadLettered(_)));
        assert!(!fx.results.exists("000003").await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_requeues_fresh_copy() {
        let fx = fixture();
        let mode = ExecutionMode::default().with_read_overwrite(true);
        let runner = FixedRunner::new(win);
        let w = worker(&fx, "worker-0", runner.clone(), mode);
        let _held = fx
            .leases
            .try_acquire_all(&["B".to_string()], "worker-9")
            .unwrap();
        publish(&fx, &Job::new(["A", "B"], "m1", "000004")).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert_eq!(disposition, Disposition::Requeued);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let pending = fx.broker.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(codec::decode(&pending[0]).unwrap().requeues, 1);
        // The partial hold on A was given back.
        assert!(fx.leases.holder_of("A").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_limit_dead_letters() {
        let fx = fixture();
        let mode = ExecutionMode::default().with_read_overwrite(true);
        let w = worker(&fx, "worker-0", FixedRunner::new(win), mode)
            .with_config(WorkerConfig::default().with_max_requeues(2).with_consume_wait(WAIT));
        let _held = fx
            .leases
            .try_acquire_all(&["A".to_string()], "worker-9")
            .unwrap();

        let mut job = Job::new(["A", "B"], "m1", "000005");
        job.requeues = 2;
        publish(&fx, &job).await;

        let disposition = w.handle_delivery(next(&w).await).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::DeadLettered(REQUEUE_LIMIT_REASON.to_string())
        );
        assert_eq!(fx.broker.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_leases_released_after_game() {
        let fx = fixture();
        let mode = ExecutionMode::default().with_read_overwrite(true);
        let runner = FixedRunner::new(|| Err(RunnerError::Crashed("bot crashed".into())));
        let w = worker(&fx, "worker-0", runner, mode);
        publish(&fx, &Job::new(["A", "B"], "m1", "000006")).await;

        w.handle_delivery(next(&w).await).await.unwrap();

        assert!(fx.leases.holder_of("A").unwrap().is_none());
        assert!(fx.leases.holder_of("B").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_reports_stats() {
        let fx = fixture();
        for n in 0..3 {
            publish(&fx, &Job::new(["A", "B"], "m1", format!("{:06}", n))).await;
        }
        publish(&fx, &Job::new(["A", "B"], "m1", "000000")).await;

        let (_tx, rx) = broadcast::channel(1);
        let w = worker(&fx, "worker-0", FixedRunner::new(win), ExecutionMode::default());
        let stats = w.run(rx).await.unwrap();

        assert_eq!(stats.finished, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.processed(), 4);
        assert_eq!(fx.results.summary().await.unwrap().finished, 3);
    }

    #[tokio::test]
    async fn test_run_without_lease_arena_fails() {
        let fx = fixture();
        let w = Worker::new(
            Arc::new(fx.broker.connect("worker-0")),
            FixedRunner::new(win),
            fx.results.clone(),
            ExecutionMode::default().with_read_overwrite(true),
        );
        let (_tx, rx) = broadcast::channel(1);

        assert!(matches!(w.run(rx).await, Err(WorkerError::MissingLeaseArena)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_next_delivery() {
        let fx = fixture();
        publish(&fx, &Job::new(["A", "B"], "m1", "000000")).await;

        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        let runner = FixedRunner::new(win);
        let w = worker(&fx, "worker-0", runner.clone(), ExecutionMode::default());

        let stats = w.run(rx).await.unwrap();

        assert_eq!(stats.processed(), 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.broker.pending_len(), 1);
    }
}
