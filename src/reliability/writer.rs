//! Single-writer durability queue.
//!
//! Producers enqueue without blocking; one dedicated OS thread owns the store
//! and applies tasks strictly in FIFO order, one transaction per task.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use crate::error::EnqueueError;
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::metrics::EngineStats;
use crate::reliability::retry::{retry_blocking, RetryConfig};
use crate::types::{CollisionEvent, Pattern, Timestamp, Transition};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpsertPattern(Pattern),
    DeletePatterns { ids: Vec<String> },
    MarkRetained { asset: String },
    RecordCollision(CollisionEvent),
    RecordTransition(Transition),
    /// No-op marker; acknowledging it proves every earlier task was handled.
    Barrier,
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::UpsertPattern(_) => "upsert_pattern",
            WriteOp::DeletePatterns { .. } => "delete_patterns",
            WriteOp::MarkRetained { .. } => "mark_retained",
            WriteOp::RecordCollision(_) => "record_collision",
            WriteOp::RecordTransition(_) => "record_transition",
            WriteOp::Barrier => "barrier",
        }
    }
}

/// Whatever the writer thread applies tasks to.
pub trait TaskSink: Send + 'static {
    fn apply(&mut self, op: &WriteOp) -> Result<()>;
}

/// Completion acknowledgment for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Applied,
    Dropped,
}

#[derive(Debug)]
struct WriteTask {
    op: WriteOp,
    enqueued_at: Timestamp,
    ack: Option<oneshot::Sender<Ack>>,
}

#[derive(Debug)]
enum Envelope {
    Task(WriteTask),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub capacity: usize,
    pub watermark: usize,
    pub retry: RetryConfig,
}

#[derive(Debug)]
struct QueueShared {
    depth: AtomicUsize,
    alarm_armed: AtomicBool,
    capacity: usize,
    watermark: usize,
    stats: Arc<EngineStats>,
}

impl QueueShared {
    fn on_enqueued(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.watermark && self.alarm_armed.swap(false, Ordering::SeqCst) {
            EngineStats::incr(&self.stats.backlog_alarms);
            logging::log_backlog_alarm(depth, self.watermark);
        }
    }

    fn on_dequeued(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if depth < self.watermark {
            self.alarm_armed.store(true, Ordering::SeqCst);
        }
    }
}

/// Cloneable producer side of the durability queue.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Envelope>,
    shared: Arc<QueueShared>,
}

impl WriteQueue {
    /// Non-blocking enqueue. A full queue is an error, never a wait.
    pub fn enqueue(&self, op: WriteOp) -> Result<(), EnqueueError> {
        self.push(op, None)
    }

    /// Enqueue and get a receiver that resolves once the task is committed or dropped.
    pub fn enqueue_with_ack(&self, op: WriteOp) -> Result<oneshot::Receiver<Ack>, EnqueueError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.push(op, Some(ack_tx))?;
        Ok(ack_rx)
    }

    /// Wait until every task enqueued before this call has been handled.
    pub async fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let task = WriteTask {
            op: WriteOp::Barrier,
            enqueued_at: logging::ts_epoch_ms(),
            ack: Some(ack_tx),
        };
        self.shared.on_enqueued();
        if self.tx.send(Envelope::Task(task)).await.is_err() {
            self.shared.on_dequeued();
            return Err(anyhow!(EnqueueError::Closed));
        }
        ack_rx.await.map_err(|_| anyhow!("writer exited before barrier"))?;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn push(&self, op: WriteOp, ack: Option<oneshot::Sender<Ack>>) -> Result<(), EnqueueError> {
        let name = op.name();
        let task = WriteTask {
            op,
            enqueued_at: logging::ts_epoch_ms(),
            ack,
        };
        self.shared.on_enqueued();
        match self.tx.try_send(Envelope::Task(task)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.on_dequeued();
                EngineStats::incr(&self.shared.stats.enqueue_rejected);
                logging::log_rejected(Domain::Writer, name, "queue_full");
                Err(EnqueueError::Full(self.shared.capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.on_dequeued();
                EngineStats::incr(&self.shared.stats.enqueue_rejected);
                logging::log_rejected(Domain::Writer, name, "queue_closed");
                Err(EnqueueError::Closed)
            }
        }
    }
}

/// Owner of the writer thread.
#[derive(Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<Envelope>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Drain every accepted task, then stop the thread.
    pub async fn shutdown(mut self) -> Result<()> {
        // Waits for room if the queue is saturated; nothing accepted is lost.
        let _ = self.tx.send(Envelope::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await?
                .map_err(|_| anyhow!("writer thread panicked"))?;
        }
        Ok(())
    }
}

pub fn spawn_writer<S: TaskSink>(
    sink: S,
    cfg: WriterConfig,
    stats: Arc<EngineStats>,
) -> Result<(WriteQueue, WriterHandle)> {
    let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
    let shared = Arc::new(QueueShared {
        depth: AtomicUsize::new(0),
        alarm_armed: AtomicBool::new(true),
        capacity: cfg.capacity,
        watermark: cfg.watermark,
        stats,
    });
    let worker_shared = shared.clone();
    let retry = cfg.retry.clone();
    let thread = std::thread::Builder::new()
        .name("store-writer".to_string())
        .spawn(move || run_writer(sink, rx, worker_shared, retry))?;
    Ok((
        WriteQueue { tx: tx.clone(), shared },
        WriterHandle {
            tx,
            thread: Some(thread),
        },
    ))
}

fn run_writer<S: TaskSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Envelope>,
    shared: Arc<QueueShared>,
    retry: RetryConfig,
) {
    log(Level::Info, Domain::Writer, "writer_started", obj(&[("capacity", json!(shared.capacity))]));
    while let Some(envelope) = rx.blocking_recv() {
        match envelope {
            Envelope::Task(task) => apply_task(&mut sink, task, &shared, &retry),
            // Refuse new work; whatever is already buffered is still received.
            Envelope::Shutdown => rx.close(),
        }
    }
    log(Level::Info, Domain::Writer, "writer_stopped", obj(&[]));
}

fn apply_task<S: TaskSink>(sink: &mut S, task: WriteTask, shared: &QueueShared, retry: &RetryConfig) {
    let WriteTask { op, enqueued_at, ack } = task;
    let outcome = if matches!(op, WriteOp::Barrier) {
        Ack::Applied
    } else {
        let attempted = retry_blocking(retry, op.name(), || sink.apply(&op));
        if attempted.attempts > 1 {
            EngineStats::add(&shared.stats.writes_retried, u64::from(attempted.attempts - 1));
        }
        match attempted.result {
            Ok(()) => {
                EngineStats::incr(&shared.stats.writes_applied);
                log(
                    Level::Trace,
                    Domain::Writer,
                    "write_applied",
                    obj(&[
                        ("operation", v_str(op.name())),
                        ("queued_ms", json!(logging::ts_epoch_ms().saturating_sub(enqueued_at))),
                    ]),
                );
                Ack::Applied
            }
            Err(e) => {
                EngineStats::incr(&shared.stats.writes_dropped);
                logging::log_write_dropped(op.name(), attempted.attempts, &e.to_string());
                Ack::Dropped
            }
        }
    };
    shared.on_dequeued();
    if let Some(ack) = ack {
        let _ = ack.send(outcome);
    }
}
