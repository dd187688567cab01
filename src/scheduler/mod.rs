//! Job dispatch over a shared queue.
//!
//! This module holds the dispatch protocol itself:
//!
//! - **Job** and **codec**: the unit of work and its wire payload
//! - **Transport**: acknowledgment-based queue, backed by Redis ([`JobQueue`])
//!   or by memory ([`MemoryQueue`])
//! - **LeaseArena**: crash-safe bot reservations shared by worker processes
//! - **Worker**: the per-message state machine
//! - **WorkerPool**: N worker processes against one queue
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (campaign)  │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│──▶ bot leases
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      result directory
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use match_forge::results::ResultSink;
//! use match_forge::runner::{CommandRunner, CommandRunnerConfig, ExecutionMode};
//! use match_forge::scheduler::{JobQueue, LeaseArena, Worker};
//!
//! let queue = JobQueue::connect_as("redis://localhost:6379", "play", "worker-0").await?;
//! let runner = CommandRunner::new(CommandRunnerConfig::default());
//! let mode = ExecutionMode::default().with_read_overwrite(true);
//!
//! let worker = Worker::new(Arc::new(queue), Arc::new(runner), ResultSink::new("results"), mode)
//!     .with_leases(LeaseArena::open("leases")?);
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let stats = worker.run(shutdown_rx).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: BRPOPLPUSH moves each message into the consumer's
//!   processing list
//! - **Crash recovery**: processing lists of consumers whose heartbeat lapsed
//!   are pushed back onto the queue
//! - **Idempotency**: a result record on disk short-circuits redelivered jobs
//! - **Dead letter list**: malformed and unclassified messages are parked
//! - **Graceful shutdown**: workers finish the current game before stopping

pub mod codec;
pub mod job;
pub mod memory;
pub mod queue;
pub mod reservation;
pub mod worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use codec::{decode, encode};
pub use job::{Job, MIN_PARTICIPANTS};
pub use memory::{MemoryBroker, MemoryQueue};
pub use queue::{
    DeadLetterEntry, Delivery, JobQueue, QueueError, QueueStats, Transport, DEFAULT_HEARTBEAT_TTL,
};
pub use reservation::{LeaseArena, LeaseMarker, Reservation, DEFAULT_LEASE_TTL};
pub use worker::{Disposition, Worker, WorkerConfig, WorkerError, WorkerStats, REQUEUE_LIMIT_REASON};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig, STOP_ON_STDIN_EOF_FLAG};
