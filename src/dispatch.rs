//! Single-worker dispatch bridge.
//!
//! The external connection is not safe for concurrent use, so exactly one
//! OS thread owns it. That thread runs a current-thread tokio runtime and
//! drains a bounded FIFO queue, running each task to completion before
//! taking the next. Synchronous callers enqueue a task and block on a
//! one-shot reply channel until the task resolves or its deadline passes.
//!
//! A deadline is a caller-side bound only. The worker cannot interrupt a
//! running call, so a caller that times out must treat the outcome as
//! unknown. A task whose deadline has already passed when it reaches the
//! front of the queue is dropped without touching the connection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::lifecycle::{Connected, ConnectionManager, ConnectionState, LifecycleError};
use crate::whatsapp::{ConnectionFactory, SendReceipt};

/// Name given to the worker thread.
const WORKER_THREAD_NAME: &str = "courier-dispatch";

/// How often a caller retries a full queue before its deadline.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Operation to run against the connection.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Establish the session.
    Connect,
    /// Send a text message to a bare phone number.
    SendText {
        /// Normalized phone number.
        recipient: String,
        /// Message body.
        text: String,
    },
    /// Send a prepared media file.
    SendMedia(MediaSend),
    /// Shut the session down and release the worker.
    Close,
}

/// Media send variants.
#[derive(Debug, Clone)]
pub enum MediaSend {
    /// Upload an encoded payload (used for video).
    File {
        /// Chat identifier (`{number}@c.us`).
        chat_id: String,
        /// Data URL payload.
        payload: String,
        /// File name shown to the recipient.
        file_name: String,
        /// Caption text.
        caption: String,
    },
    /// Send an image file by path.
    Image {
        /// Chat identifier (`{number}@c.us`).
        chat_id: String,
        /// Image location.
        path: PathBuf,
        /// File name shown to the recipient.
        file_name: String,
        /// Caption text.
        caption: String,
    },
}

impl Operation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SendText { .. } => "send_text",
            Self::SendMedia(MediaSend::File { .. }) => "send_file",
            Self::SendMedia(MediaSend::Image { .. }) => "send_image",
            Self::Close => "close",
        }
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Result of [`Operation::Connect`].
    Connected(Connected),
    /// Result of a send.
    Sent(SendReceipt),
    /// Result of [`Operation::Close`]; `true` when a session was shut down.
    Closed(bool),
}

/// Errors returned to callers of [`DispatchBridge::submit`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The deadline passed before the worker answered.
    #[error("dispatch timed out after {0:?}; the operation may still complete")]
    Timeout(Duration),

    /// The worker thread could not be started.
    #[error("dispatch worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The worker stopped before answering.
    #[error("dispatch worker stopped before answering")]
    WorkerLost,

    /// The connection manager refused or failed the operation.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Timing and queue settings for the bridge.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// How long a caller waits for its task.
    pub deadline: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Number of tasks that may wait in the queue.
    pub queue_capacity: usize,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            deadline: config.deadline(),
            connect_timeout: config.connect_timeout(),
            queue_capacity: config.queue_capacity,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

type ReplySlot = SyncSender<Result<Reply, DispatchError>>;

/// A unit of work owned by the worker until it is resolved.
struct DispatchTask {
    id: Uuid,
    operation: Operation,
    deadline: Instant,
    reply: ReplySlot,
}

/// Clears the liveness flag and signals exit when the worker thread ends,
/// including by panic.
struct ExitGuard {
    alive: Arc<AtomicBool>,
    exited: SyncSender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.exited.try_send(());
    }
}

/// Handle to the running worker thread.
struct Worker {
    generation: u64,
    queue: SyncSender<DispatchTask>,
    state: watch::Receiver<ConnectionState>,
    alive: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

/// Serializes every operation on the external connection through one worker.
pub struct DispatchBridge {
    factory: Arc<dyn ConnectionFactory>,
    settings: DispatchSettings,
    worker: Mutex<Option<Worker>>,
    spawns: AtomicU64,
}

impl DispatchBridge {
    /// Create a bridge. The worker is started on the first submission.
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: DispatchSettings) -> Self {
        Self {
            factory,
            settings,
            worker: Mutex::new(None),
            spawns: AtomicU64::new(0),
        }
    }

    /// Settings this bridge was built with.
    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Number of worker threads started so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Whether a worker is running and its connection is live.
    pub fn is_live(&self) -> bool {
        self.state() == Some(ConnectionState::Connected)
    }

    /// Published connection state, or `None` when no worker is running.
    pub fn state(&self) -> Option<ConnectionState> {
        let slot = self.lock_worker().ok()?;
        slot.as_ref()
            .filter(|worker| worker.is_running())
            .map(|worker| *worker.state.borrow())
    }

    /// Run `operation` on the worker and wait for its result.
    ///
    /// Blocks the calling thread for at most the configured deadline, time
    /// spent waiting for queue space included. Must not be called from an
    /// async runtime thread; async callers go through
    /// `tokio::task::spawn_blocking`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Timeout`] when the deadline passes,
    /// [`DispatchError::WorkerUnavailable`] / [`DispatchError::WorkerLost`]
    /// when the worker cannot run the task, and [`DispatchError::Lifecycle`]
    /// for failures reported by the connection manager.
    pub fn submit(&self, operation: Operation) -> Result<Reply, DispatchError> {
        let deadline = Instant::now()
            .checked_add(self.settings.deadline)
            .unwrap_or_else(Instant::now);
        let (reply, reply_rx) = mpsc::sync_channel(1);
        let id = Uuid::new_v4();
        let kind = operation.kind();
        let mut task = DispatchTask {
            id,
            operation,
            deadline,
            reply,
        };

        // A worker can exit between the liveness check and the send; the
        // send then hands the task back and a fresh worker takes it.
        let mut respawned = false;
        loop {
            let (generation, queue) = self.ensure_worker()?;
            debug!(task_id = %id, kind, generation, "submitting dispatch task");
            match enqueue(&queue, task, deadline) {
                Ok(()) => break,
                Err(TrySendError::Full(_)) => {
                    warn!(task_id = %id, kind, "dispatch queue stayed full until the deadline");
                    return Err(DispatchError::Timeout(self.settings.deadline));
                }
                Err(TrySendError::Disconnected(returned)) if !respawned => {
                    warn!(task_id = %id, generation, "dispatch worker gone, respawning");
                    task = returned;
                    respawned = true;
                    self.discard_worker(generation);
                }
                Err(TrySendError::Disconnected(_)) => return Err(DispatchError::WorkerLost),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match reply_rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(task_id = %id, kind, "dispatch deadline passed, outcome unknown");
                Err(DispatchError::Timeout(self.settings.deadline))
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(task_id = %id, kind, "dispatch worker dropped the task");
                Err(DispatchError::WorkerLost)
            }
        }
    }

    /// Close the connection if a worker is running, then stop the worker.
    ///
    /// Waits up to one deadline for the worker thread to exit.
    pub fn shutdown(&self) {
        let running = self
            .lock_worker()
            .map(|slot| slot.as_ref().is_some_and(Worker::is_running))
            .unwrap_or(false);
        if running {
            match self.submit(Operation::Close) {
                Ok(_) => debug!("close submitted during shutdown"),
                Err(e) => warn!(error = %e, "close failed during shutdown"),
            }
        }

        let worker = match self.lock_worker() {
            Ok(mut slot) => slot.take(),
            Err(e) => {
                warn!(error = %e, "cannot stop dispatch worker");
                return;
            }
        };
        let Some(Worker {
            queue,
            exited,
            handle,
            ..
        }) = worker
        else {
            return;
        };
        drop(queue);
        match exited.recv_timeout(self.settings.deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("dispatch worker panicked");
                }
                info!("dispatch worker stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("dispatch worker still busy at shutdown, detaching");
            }
        }
    }

    fn lock_worker(&self) -> Result<MutexGuard<'_, Option<Worker>>, DispatchError> {
        self.worker
            .lock()
            .map_err(|e| DispatchError::WorkerUnavailable(format!("worker lock poisoned: {e}")))
    }

    /// Return the generation and queue of a running worker, starting one if
    /// needed.
    fn ensure_worker(&self) -> Result<(u64, SyncSender<DispatchTask>), DispatchError> {
        let mut slot = self.lock_worker()?;
        if let Some(worker) = slot.as_ref() {
            if worker.is_running() {
                return Ok((worker.generation, worker.queue.clone()));
            }
            info!(
                generation = worker.generation,
                "dispatch worker not running, starting a new one"
            );
        }
        let worker = self.spawn_worker()?;
        let entry = (worker.generation, worker.queue.clone());
        *slot = Some(worker);
        Ok(entry)
    }

    /// Mark the worker of `generation` as gone so the next call replaces it.
    fn discard_worker(&self, generation: u64) {
        if let Ok(slot) = self.lock_worker() {
            if let Some(worker) = slot.as_ref().filter(|w| w.generation == generation) {
                worker.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    fn spawn_worker(&self) -> Result<Worker, DispatchError> {
        let (queue, queue_rx) = mpsc::sync_channel(self.settings.queue_capacity);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (exit_tx, exited) = mpsc::sync_channel(1);
        let alive = Arc::new(AtomicBool::new(true));
        let guard = ExitGuard {
            alive: Arc::clone(&alive),
            exited: exit_tx,
        };
        let worker_alive = Arc::clone(&alive);
        let factory = Arc::clone(&self.factory);
        let connect_timeout = self.settings.connect_timeout;
        let generation = self.spawns.fetch_add(1, Ordering::SeqCst).saturating_add(1);

        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || {
                let _guard = guard;
                run_worker(
                    factory.as_ref(),
                    connect_timeout,
                    &queue_rx,
                    ready_tx,
                    &worker_alive,
                );
            })
            .map_err(|e| DispatchError::WorkerUnavailable(format!("failed to spawn thread: {e}")))?;

        let state = match ready_rx.recv() {
            Ok(Ok(state)) => state,
            Ok(Err(reason)) => return Err(DispatchError::WorkerUnavailable(reason)),
            Err(_) => {
                return Err(DispatchError::WorkerUnavailable(
                    "worker exited during startup".to_owned(),
                ))
            }
        };
        info!(generation, "dispatch worker started");

        Ok(Worker {
            generation,
            queue,
            state,
            alive,
            exited,
            handle,
        })
    }
}

/// Enqueue `task`, polling for queue space until `deadline`.
///
/// Hands the task back as [`TrySendError::Full`] when the queue is still full
/// at the deadline.
fn enqueue(
    queue: &SyncSender<DispatchTask>,
    mut task: DispatchTask,
    deadline: Instant,
) -> Result<(), TrySendError<DispatchTask>> {
    loop {
        match queue.try_send(task) {
            Err(TrySendError::Full(returned)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TrySendError::Full(returned));
                }
                task = returned;
                std::thread::sleep(remaining.min(QUEUE_POLL_INTERVAL));
            }
            other => return other,
        }
    }
}

/// Body of the worker thread.
fn run_worker(
    factory: &dyn ConnectionFactory,
    connect_timeout: Duration,
    queue: &mpsc::Receiver<DispatchTask>,
    ready: SyncSender<Result<watch::Receiver<ConnectionState>, String>>,
    alive: &AtomicBool,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to build worker runtime: {e}")));
            return;
        }
    };
    let (mut manager, observer) = ConnectionManager::new(factory.create(), connect_timeout);
    if ready.send(Ok(observer)).is_err() {
        return;
    }
    drop(ready);

    while let Ok(task) = queue.recv() {
        let DispatchTask {
            id,
            operation,
            deadline,
            reply,
        } = task;
        let kind = operation.kind();

        if Instant::now() >= deadline {
            warn!(task_id = %id, kind, "dropping dispatch task whose caller already timed out");
            continue;
        }

        let started = Instant::now();
        let result = runtime.block_on(execute(&mut manager, operation));
        let released = matches!(result, Ok(Reply::Closed(true)));
        if released {
            // Submitters must see the worker as gone before the reply lands.
            alive.store(false, Ordering::SeqCst);
        }
        debug!(
            task_id = %id,
            kind,
            ok = result.is_ok(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "dispatch task finished"
        );
        if reply.send(result).is_err() {
            debug!(task_id = %id, kind, "caller stopped waiting before the reply");
        }
        if released {
            info!("connection closed, releasing dispatch worker");
            break;
        }
    }
}

async fn execute(
    manager: &mut ConnectionManager,
    operation: Operation,
) -> Result<Reply, DispatchError> {
    let reply = match operation {
        Operation::Connect => Reply::Connected(manager.connect().await?),
        Operation::SendText { recipient, text } => {
            Reply::Sent(manager.send_text(&recipient, &text).await?)
        }
        Operation::SendMedia(MediaSend::File {
            chat_id,
            payload,
            file_name,
            caption,
        }) => Reply::Sent(
            manager
                .send_file(&chat_id, &payload, &file_name, &caption)
                .await?,
        ),
        Operation::SendMedia(MediaSend::Image {
            chat_id,
            path,
            file_name,
            caption,
        }) => Reply::Sent(
            manager
                .send_image(&chat_id, &path, &file_name, &caption)
                .await?,
        ),
        Operation::Close => Reply::Closed(manager.close().await?),
    };
    Ok(reply)
}
