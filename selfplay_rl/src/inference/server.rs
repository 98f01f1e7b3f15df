//! Batched inference server.
//!
//! One server pins one model replica to one device. Callers submit single
//! requests; a dispatch thread coalesces whatever has queued up for a method
//! into one model call and routes each output back on the caller's private
//! reply channel.
//!
//! # Architecture
//!
//! ```text
//! actor ─act_async()─┐                          ┌─> reply(bounded 1) ─> actor
//! actor ─act_async()─┼─> Act queue (bounded) ──>│
//! actor ─priority()──┼─> ComputePriority queue ─┤ dispatch thread:
//!                    │                          │   select ready queue
//!                    │                          │   drain up to capacity
//!                    │                          │   snapshot = slot.load()
//!                    │                          │   model.act(batch)
//!                    │                          └─> fan out replies
//! ```
//!
//! Each queue's bound is the method's registered capacity: once that many
//! requests are waiting, further callers block in `submit` until the
//! dispatcher drains the queue. The same number caps the batch size.
//!
//! # Shutdown
//!
//! [`InferenceServer::stop`] clears the running flag, joins the dispatcher
//! and fails every queued request with [`InferenceError::Stopped`]. Callers
//! poll the flag while waiting, so a request that slips in after the final
//! drain still returns instead of hanging.

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, Select, SendTimeoutError, Sender,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::{Fragment, ModelSnapshot, SnapshotSlot, VersionCounter};
use crate::environment::Observation;
use crate::model::{Device, PolicyModel};

/// A named operation a server can batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// Per-action values for an observation.
    Act,
    /// Initial replay priority for a finished fragment.
    ComputePriority,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Act => f.write_str("act"),
            Method::ComputePriority => f.write_str("compute_priority"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("inference server stopped")]
    Stopped,

    #[error("method `{0}` is not registered")]
    NotRegistered(Method),

    #[error("method `{0}` is already registered")]
    AlreadyRegistered(Method),

    #[error("method `{0}` needs a queue capacity > 0")]
    ZeroCapacity(Method),

    #[error("cannot register methods while the server is running")]
    Running,

    #[error("no methods registered")]
    NoMethods,

    #[error("model returned {actual} outputs for a `{method}` batch of {expected}")]
    BatchMismatch {
        method: Method,
        expected: usize,
        actual: usize,
    },
}

/// A request for any registered method.
#[derive(Debug, Clone)]
pub enum Request {
    Act(Observation),
    ComputePriority(Arc<Fragment>),
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Act(_) => Method::Act,
            Request::ComputePriority(_) => Method::ComputePriority,
        }
    }
}

/// The answer to a [`Request`] of the same method.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Act(Vec<f32>),
    Priority(f32),
}

/// Dispatch timing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long the dispatcher lingers for more requests after the first.
    pub batch_wait: Duration,
    /// Granularity at which blocked callers and the dispatcher notice a stop.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            batch_wait: Duration::from_micros(200),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Throughput counters for one method.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MethodStats {
    pub batches: u64,
    pub requests: u64,
}

impl MethodStats {
    /// Average number of requests per model call.
    pub fn mean_batch_size(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.requests as f64 / self.batches as f64
        }
    }
}

#[derive(Debug, Default)]
struct MethodCounters {
    batches: AtomicU64,
    requests: AtomicU64,
}

impl MethodCounters {
    fn record(&self, requests: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(requests as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MethodStats {
        MethodStats {
            batches: self.batches.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

type ReplyResult<T> = Result<T, InferenceError>;

struct Job<Req, Resp> {
    request: Req,
    reply: Sender<ReplyResult<Resp>>,
}

struct MethodQueue<Req, Resp> {
    tx: Sender<Job<Req, Resp>>,
    rx: Receiver<Job<Req, Resp>>,
    capacity: usize,
}

impl<Req, Resp> Clone for MethodQueue<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<Req, Resp> MethodQueue<Req, Resp> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Take whatever is queued, lingering up to `wait` for stragglers.
    fn collect_batch(&self, wait: Duration) -> Vec<Job<Req, Resp>> {
        let mut jobs = Vec::with_capacity(self.capacity.min(1024));
        let deadline = Instant::now() + wait;
        while jobs.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(job) => jobs.push(job),
                Err(_) => match self.rx.recv_deadline(deadline) {
                    Ok(job) => jobs.push(job),
                    Err(_) => break,
                },
            }
        }
        jobs
    }

    fn fail_pending(&self) -> usize {
        let mut failed = 0;
        while let Ok(job) = self.rx.try_recv() {
            let _ = job.reply.send(Err(InferenceError::Stopped));
            failed += 1;
        }
        failed
    }
}

/// A reply that has been requested but not yet collected.
pub struct PendingReply<T> {
    rx: Receiver<ReplyResult<T>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<T> PendingReply<T> {
    /// Block until the batch containing this request has run.
    pub fn wait(self) -> Result<T, InferenceError> {
        loop {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(InferenceError::Stopped),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.running.load(Ordering::Acquire) {
                        return self.rx.try_recv().unwrap_or(Err(InferenceError::Stopped));
                    }
                }
            }
        }
    }
}

/// A pending reply of either method, as returned by
/// [`InferenceServer::submit_async`].
pub enum PendingRequest {
    Act(PendingReply<Vec<f32>>),
    Priority(PendingReply<f32>),
}

impl PendingRequest {
    pub fn method(&self) -> Method {
        match self {
            PendingRequest::Act(_) => Method::Act,
            PendingRequest::Priority(_) => Method::ComputePriority,
        }
    }

    pub fn wait(self) -> Result<Reply, InferenceError> {
        match self {
            PendingRequest::Act(p) => p.wait().map(Reply::Act),
            PendingRequest::Priority(p) => p.wait().map(Reply::Priority),
        }
    }
}

struct Shared<M> {
    name: String,
    device: Device,
    config: ServerConfig,
    slot: SnapshotSlot<M>,
    versions: VersionCounter,
    running: Arc<AtomicBool>,
    act: RwLock<Option<MethodQueue<Observation, Vec<f32>>>>,
    priority: RwLock<Option<MethodQueue<Arc<Fragment>, f32>>>,
    act_counters: MethodCounters,
    priority_counters: MethodCounters,
}

/// Batches concurrent requests against one model replica.
pub struct InferenceServer<M: PolicyModel> {
    shared: Arc<Shared<M>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<M: PolicyModel> InferenceServer<M> {
    /// Create a stopped server serving `model` (already placed on `device`).
    pub fn new(name: impl Into<String>, device: Device, model: M) -> Self {
        Self::with_config(name, device, model, ServerConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        device: Device,
        model: M,
        config: ServerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                device,
                config,
                slot: SnapshotSlot::new(ModelSnapshot::new(model, 0)),
                versions: VersionCounter::new(),
                running: Arc::new(AtomicBool::new(false)),
                act: RwLock::new(None),
                priority: RwLock::new(None),
                act_counters: MethodCounters::default(),
                priority_counters: MethodCounters::default(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Declare `method` with room for `capacity` queued requests.
    pub fn register(&self, method: Method, capacity: usize) -> Result<(), InferenceError> {
        if self.is_running() {
            return Err(InferenceError::Running);
        }
        if capacity == 0 {
            return Err(InferenceError::ZeroCapacity(method));
        }
        match method {
            Method::Act => install(&self.shared.act, method, capacity),
            Method::ComputePriority => install(&self.shared.priority, method, capacity),
        }
    }

    pub fn is_registered(&self, method: Method) -> bool {
        match method {
            Method::Act => self.shared.act.read().is_some(),
            Method::ComputePriority => self.shared.priority.read().is_some(),
        }
    }

    /// Spawn the dispatch thread. Starting a running server is a no-op.
    pub fn start(&self) -> Result<(), InferenceError> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return Ok(());
        }
        if !self.is_registered(Method::Act) && !self.is_registered(Method::ComputePriority) {
            return Err(InferenceError::NoMethods);
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("infer-{}", self.shared.name))
            .spawn(move || dispatch(shared))
            .expect("failed to spawn inference dispatch thread");
        *dispatcher = Some(handle);
        log::debug!("inference server {} started on {}", self.shared.name, self.shared.device);
        Ok(())
    }

    /// Stop dispatching and fail every request still waiting.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.dispatcher.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.join().is_err() {
            log::error!("inference dispatcher {} panicked", self.shared.name);
        }
        let mut failed = 0;
        if let Some(q) = self.shared.act.read().as_ref() {
            failed += q.fail_pending();
        }
        if let Some(q) = self.shared.priority.read().as_ref() {
            failed += q.fail_pending();
        }
        log::debug!(
            "inference server {} stopped ({} queued requests failed)",
            self.shared.name,
            failed
        );
    }

    /// Serve `model` for every batch that starts from now on.
    ///
    /// Batches already running finish on the snapshot they loaded.
    pub fn replace_weights(&self, model: M) -> u64 {
        let version = self.shared.versions.increment();
        self.shared
            .slot
            .replace(Arc::new(ModelSnapshot::new(model, version)));
        version
    }

    /// Version of the snapshot new batches will use.
    pub fn weights_version(&self) -> u64 {
        self.shared.slot.version()
    }

    /// Currently served snapshot.
    pub fn snapshot(&self) -> Arc<ModelSnapshot<M>> {
        self.shared.slot.load()
    }

    pub fn stats(&self, method: Method) -> MethodStats {
        match method {
            Method::Act => self.shared.act_counters.snapshot(),
            Method::ComputePriority => self.shared.priority_counters.snapshot(),
        }
    }

    /// Queue an observation and return without waiting for the batch.
    pub fn act_async(&self, obs: Observation) -> Result<PendingReply<Vec<f32>>, InferenceError> {
        let queue = self
            .shared
            .act
            .read()
            .clone()
            .ok_or(InferenceError::NotRegistered(Method::Act))?;
        self.enqueue(&queue, obs)
    }

    pub fn act(&self, obs: Observation) -> Result<Vec<f32>, InferenceError> {
        self.act_async(obs)?.wait()
    }

    pub fn compute_priority_async(
        &self,
        fragment: Arc<Fragment>,
    ) -> Result<PendingReply<f32>, InferenceError> {
        let queue = self
            .shared
            .priority
            .read()
            .clone()
            .ok_or(InferenceError::NotRegistered(Method::ComputePriority))?;
        self.enqueue(&queue, fragment)
    }

    pub fn compute_priority(&self, fragment: Arc<Fragment>) -> Result<f32, InferenceError> {
        self.compute_priority_async(fragment)?.wait()
    }

    /// Submit a request of any method and block for its reply.
    pub fn submit(&self, request: Request) -> Result<Reply, InferenceError> {
        match request {
            Request::Act(obs) => self.act(obs).map(Reply::Act),
            Request::ComputePriority(f) => self.compute_priority(f).map(Reply::Priority),
        }
    }

    /// Queue a request of any method without waiting for it.
    pub fn submit_async(&self, request: Request) -> Result<PendingRequest, InferenceError> {
        match request {
            Request::Act(obs) => self.act_async(obs).map(PendingRequest::Act),
            Request::ComputePriority(f) => {
                self.compute_priority_async(f).map(PendingRequest::Priority)
            }
        }
    }

    fn enqueue<Req, Resp>(
        &self,
        queue: &MethodQueue<Req, Resp>,
        request: Req,
    ) -> Result<PendingReply<Resp>, InferenceError> {
        if !self.is_running() {
            return Err(InferenceError::Stopped);
        }
        let (reply, rx) = bounded(1);
        let mut job = Job { request, reply };
        loop {
            match queue.tx.send_timeout(job, self.shared.config.poll_interval) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.is_running() {
                        return Err(InferenceError::Stopped);
                    }
                    job = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(InferenceError::Stopped),
            }
        }
        Ok(PendingReply {
            rx,
            running: Arc::clone(&self.shared.running),
            poll_interval: self.shared.config.poll_interval,
        })
    }
}

impl<M: PolicyModel> Drop for InferenceServer<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn install<Req, Resp>(
    slot: &RwLock<Option<MethodQueue<Req, Resp>>>,
    method: Method,
    capacity: usize,
) -> Result<(), InferenceError> {
    let mut slot = slot.write();
    if slot.is_some() {
        return Err(InferenceError::AlreadyRegistered(method));
    }
    *slot = Some(MethodQueue::new(capacity));
    Ok(())
}

fn dispatch<M: PolicyModel>(shared: Arc<Shared<M>>) {
    let act = shared.act.read().clone();
    let priority = shared.priority.read().clone();
    let poll = shared.config.poll_interval;

    while shared.running.load(Ordering::Acquire) {
        let mut select = Select::new();
        let act_index = act.as_ref().map(|q| select.recv(&q.rx));
        let priority_index = priority.as_ref().map(|q| select.recv(&q.rx));
        let Ok(ready) = select.ready_timeout(poll) else {
            continue;
        };

        if Some(ready) == act_index {
            if let Some(queue) = &act {
                let jobs = queue.collect_batch(shared.config.batch_wait);
                run_batch(&shared, Method::Act, jobs, &shared.act_counters, |m, batch| {
                    m.act(batch)
                });
            }
        } else if Some(ready) == priority_index {
            if let Some(queue) = &priority {
                let jobs = queue.collect_batch(shared.config.batch_wait);
                run_batch(
                    &shared,
                    Method::ComputePriority,
                    jobs,
                    &shared.priority_counters,
                    |m, batch| m.compute_priority(batch),
                );
            }
        }
    }
}

fn run_batch<M, Req, Resp, F>(
    shared: &Shared<M>,
    method: Method,
    jobs: Vec<Job<Req, Resp>>,
    counters: &MethodCounters,
    evaluate: F,
) where
    M: PolicyModel,
    F: FnOnce(&M, &[Req]) -> Vec<Resp>,
{
    if jobs.is_empty() {
        return;
    }
    let (requests, replies): (Vec<Req>, Vec<_>) =
        jobs.into_iter().map(|j| (j.request, j.reply)).unzip();

    // Loaded once: a concurrent replace_weights only affects later batches.
    let snapshot = shared.slot.load();
    let outputs = evaluate(snapshot.model(), &requests);
    counters.record(requests.len());

    if outputs.len() != replies.len() {
        log::error!(
            "{}: model returned {} outputs for {} `{}` requests",
            shared.name,
            outputs.len(),
            replies.len(),
            method
        );
        let err = InferenceError::BatchMismatch {
            method,
            expected: replies.len(),
            actual: outputs.len(),
        };
        for reply in replies {
            let _ = reply.send(Err(err.clone()));
        }
        return;
    }
    for (reply, output) in replies.into_iter().zip(outputs) {
        let _ = reply.send(Ok(output));
    }
}
