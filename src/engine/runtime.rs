//! Multi-shard engine.
//!
//! Each shard is a thread running a current-thread tokio runtime around one
//! [`Worker`]. Shards exchange frames over one bounded lane per ordered pair
//! and share nothing else but the [`BudgetPool`].

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{self, select_all, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::error::{EngineError, EngineResult};
use super::generation::Generation;
use super::metrics::EventSink;
use super::status::{EngineState, EngineStatus};
use super::worker::{EgressFrame, Worker, WorkerStats};
use crate::binding::shard_of;
use crate::budget::BudgetPool;
use crate::config::EngineSection;
use crate::frame::FrameHeader;

const LANE_RETRY: Duration = Duration::from_millis(1);

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of shards.
    pub workers: usize,
    /// Capacity of each inter-shard lane.
    pub lane_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            workers: section.workers,
            lane_capacity: section.lane_capacity,
        }
    }
}

/// Receives every frame addressed to the embedder.
pub type EgressReceiver = mpsc::UnboundedReceiver<EgressFrame>;

struct LaneFrame {
    from: usize,
    frame: EgressFrame,
}

enum Command {
    Dispatch(EgressFrame),
    Reconfigure(Arc<Generation>),
    Stats(oneshot::Sender<WorkerStats>),
    Shutdown,
}

struct ShardHandle {
    control: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
}

/// Everything a shard thread owns.
struct ShardTask {
    worker: Worker,
    control: mpsc::UnboundedReceiver<Command>,
    lanes_in: Vec<mpsc::Receiver<LaneFrame>>,
    lanes_out: Vec<Option<mpsc::Sender<LaneFrame>>>,
    backlog: Vec<VecDeque<LaneFrame>>,
    credits: broadcast::Receiver<u64>,
    egress: mpsc::UnboundedSender<EgressFrame>,
}

impl ShardTask {
    fn flush(&mut self) {
        for frame in self.worker.take_egress() {
            if self.egress.send(frame).is_err() {
                debug!(shard = self.worker.shard(), "Egress receiver dropped");
            }
        }
        for (to, frame) in self.worker.take_forwards() {
            let from = self.worker.shard();
            if let Some(backlog) = self.backlog.get_mut(to) {
                backlog.push_back(LaneFrame { from, frame });
            }
        }
        self.retry_lanes();
    }

    /// Push backlogged frames into their lanes until a lane is full.
    fn retry_lanes(&mut self) {
        for (to, backlog) in self.backlog.iter_mut().enumerate() {
            let Some(Some(lane)) = self.lanes_out.get(to) else {
                backlog.clear();
                continue;
            };
            while let Some(frame) = backlog.pop_front() {
                match lane.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(frame)) => {
                        backlog.push_front(frame);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(from = self.worker.shard(), to, "Lane closed, dropping frames");
                        backlog.clear();
                        break;
                    }
                }
            }
        }
    }

    fn has_backlog(&self) -> bool {
        self.backlog.iter().any(|backlog| !backlog.is_empty())
    }

    async fn run(mut self) {
        let shard = self.worker.shard();
        info!(shard, "Shard started");

        let lanes: Vec<BoxStream<'static, LaneFrame>> = std::mem::take(&mut self.lanes_in)
            .into_iter()
            .map(|lane| {
                stream::unfold(lane, |mut lane| async move {
                    lane.recv().await.map(|frame| (frame, lane))
                })
                .boxed()
            })
            .collect();
        let mut lanes = select_all(lanes);
        let has_lanes = !lanes.is_empty();

        loop {
            let deadline = self.worker.next_deadline();
            let backlog = self.has_backlog();

            tokio::select! {
                command = self.control.recv() => match command {
                    Some(Command::Dispatch(frame)) => {
                        self.worker.on_inbound(frame.type_id, frame.frame, Instant::now());
                    }
                    Some(Command::Reconfigure(generation)) => self.worker.reconfigure(generation),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.worker.stats());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(lane) = lanes.next(), if has_lanes => {
                    self.worker.on_lane(lane.from, lane.frame.type_id, lane.frame.frame, Instant::now());
                }
                credit = self.credits.recv() => match credit {
                    Ok(budget_id) => self.worker.on_budget_credit(budget_id, Instant::now()),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(shard, missed, "Missed credit events, waking all watchers");
                        self.worker.on_budget_credit_all(Instant::now());
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.worker.on_timers(Instant::now());
                }
                () = tokio::time::sleep(LANE_RETRY), if backlog => {}
            }

            self.flush();
        }

        info!(shard, "Shard stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// N shards dispatching frames to bindings.
pub struct Engine {
    shards: Vec<ShardHandle>,
    pool: Arc<BudgetPool>,
    generation: RwLock<Arc<Generation>>,
    state: RwLock<EngineState>,
    started_at: Instant,
}

impl Engine {
    /// Start `config.workers` shards on `generation`.
    ///
    /// Returns the engine and the receiver of frames for the embedder.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or a thread cannot be
    /// started.
    pub fn start(
        config: EngineConfig,
        generation: Arc<Generation>,
        sink: Arc<dyn EventSink>,
    ) -> EngineResult<(Self, EgressReceiver)> {
        if config.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if config.workers > 128 {
            return Err(EngineError::InvalidConfig("at most 128 workers are supported".to_string()));
        }
        let shards = config.workers;
        let capacity = config.lane_capacity.max(1);
        let pool = Arc::new(BudgetPool::new());
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();

        // lanes[from][to]
        let mut senders: Vec<Vec<Option<mpsc::Sender<LaneFrame>>>> =
            (0..shards).map(|_| (0..shards).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<mpsc::Receiver<LaneFrame>>> = (0..shards).map(|_| Vec::new()).collect();
        for (from, row) in senders.iter_mut().enumerate() {
            for (to, slot) in row.iter_mut().enumerate() {
                if from != to {
                    let (tx, rx) = mpsc::channel(capacity);
                    *slot = Some(tx);
                    receivers[to].push(rx);
                }
            }
        }

        let mut handles = Vec::with_capacity(shards);
        for (shard, (lanes_out, lanes_in)) in senders.into_iter().zip(receivers).enumerate() {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let generation = Arc::clone(&generation);
            let pool = Arc::clone(&pool);
            let sink = Arc::clone(&sink);
            let credits = pool.subscribe();
            let egress = egress_tx.clone();

            let thread = std::thread::Builder::new()
                .name(format!("dataplane-shard-{shard}"))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!(shard, error = %e, "Failed to build shard runtime");
                            return;
                        }
                    };
                    let task = ShardTask {
                        worker: Worker::new(shard, shards, generation, pool, sink),
                        control: control_rx,
                        lanes_in,
                        backlog: (0..lanes_out.len()).map(|_| VecDeque::new()).collect(),
                        lanes_out,
                        credits,
                        egress,
                    };
                    runtime.block_on(task.run());
                })
                .map_err(|source| EngineError::Spawn { shard, source })?;

            handles.push(ShardHandle {
                control: control_tx,
                thread: Some(thread),
            });
        }

        info!(
            workers = shards,
            lane_capacity = capacity,
            revision = generation.revision(),
            "Engine started"
        );

        Ok((
            Self {
                shards: handles,
                pool,
                generation: RwLock::new(generation),
                state: RwLock::new(EngineState::Running),
                started_at: Instant::now(),
            },
            egress_rx,
        ))
    }

    /// Number of shards.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Shared budget pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BudgetPool> {
        &self.pool
    }

    /// Generation used for new streams.
    #[must_use]
    pub fn generation(&self) -> Option<Arc<Generation>> {
        self.generation.read().ok().map(|current| Arc::clone(&current))
    }

    fn send(&self, shard: usize, command: Command) -> EngineResult<()> {
        if self.is_stopped() {
            return Err(EngineError::Stopped);
        }
        let handle = self
            .shards
            .get(shard)
            .ok_or(EngineError::ShardUnavailable(shard))?;
        handle
            .control
            .send(command)
            .map_err(|_| EngineError::ShardUnavailable(shard))
    }

    fn is_stopped(&self) -> bool {
        self.state
            .read()
            .map_or(true, |state| state.is_stopped())
    }

    /// Route an encoded frame to the shard owning its stream id.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be read or the shard is gone.
    pub fn dispatch(&self, type_id: u32, frame: Bytes) -> EngineResult<()> {
        let header = FrameHeader::peek(&frame, 0, frame.len())?;
        let shard = shard_of(header.stream_id, self.shards.len());
        self.send(shard, Command::Dispatch(EgressFrame::new(type_id, frame)))
    }

    /// Use `generation` for new streams on every shard.
    ///
    /// Returns `false` without doing anything when `generation` has the same
    /// content hash as the current one.
    ///
    /// # Errors
    ///
    /// Returns an error if a shard is gone.
    pub fn reconfigure(&self, generation: Arc<Generation>) -> EngineResult<bool> {
        let mut current = self
            .generation
            .write()
            .map_err(|_| EngineError::InvalidConfig("generation lock poisoned".to_string()))?;
        if current.content_hash() == generation.content_hash() {
            debug!(revision = generation.revision(), "Generation unchanged");
            return Ok(false);
        }
        for shard in 0..self.shards.len() {
            self.send(shard, Command::Reconfigure(Arc::clone(&generation)))?;
        }
        info!(
            from = current.revision(),
            to = generation.revision(),
            hash = %generation.content_hash(),
            bindings = generation.len(),
            "Engine reconfigured"
        );
        *current = generation;
        Ok(true)
    }

    /// Credit a shared budget and wake the streams waiting on it.
    pub fn credit(&self, budget_id: u64, amount: u64) -> u64 {
        self.pool.credit(budget_id, amount)
    }

    /// Per-shard counts.
    ///
    /// # Errors
    ///
    /// Returns an error if a shard is gone.
    pub async fn stats(&self) -> EngineResult<Vec<WorkerStats>> {
        let mut stats = Vec::with_capacity(self.shards.len());
        for shard in 0..self.shards.len() {
            let (tx, rx) = oneshot::channel();
            self.send(shard, Command::Stats(tx))?;
            stats.push(rx.await.map_err(|_| EngineError::ShardUnavailable(shard))?);
        }
        Ok(stats)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let live_shards = self
            .shards
            .iter()
            .filter(|handle| handle.thread.as_ref().is_some_and(|t| !t.is_finished()))
            .count();
        let mut state = self
            .state
            .read()
            .map_or(EngineState::Stopped, |state| state.clone());
        if state.is_healthy() && live_shards < self.shards.len() {
            state = EngineState::Degraded {
                reason: format!("{} of {} shards running", live_shards, self.shards.len()),
            };
        }
        let (revision, content_hash, bindings) = self
            .generation()
            .map_or((0, Default::default(), 0), |g| (g.revision(), g.content_hash(), g.len()));

        EngineStatus {
            state,
            shards: self.shards.len(),
            live_shards,
            revision,
            content_hash,
            bindings,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Stop every shard and wait for its thread.
    pub fn shutdown(&mut self) {
        if self.is_stopped() {
            return;
        }
        for handle in &self.shards {
            let _ = handle.control.send(Command::Shutdown);
        }
        for (shard, handle) in self.shards.iter_mut().enumerate() {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    error!(shard, "Shard thread panicked");
                }
            }
        }
        if let Ok(mut state) = self.state.write() {
            *state = EngineState::Stopped;
        }
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
