//! Per-descriptor synchronization engine.
//!
//! A [`ThreadSyncEngine`] is a handle to an actor task that owns everything
//! about one catalog or thread: the last materialized view, the listener set,
//! the poll timer and the single in-flight fetch. Commands arrive over an
//! async_channel queue with oneshot replies; fetches run on spawned tasks and
//! report back over a completion channel tagged with a request id, so a
//! superseded or cancelled fetch can never publish.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use super::cache::PostCache;
use super::coordinator::{FetchCoordinator, FetchOutcome, FetchResult};
use super::listener::{ListenerId, SyncListener};
use super::merge::{merge, merge_catalog, merge_stored};
use super::post::{MaterializedThread, Post};
use super::scheduler::PollScheduler;
use super::ContentDescriptor;
use crate::config::{PollingConfig, ENGINE_COMMAND_QUEUE_CAPACITY};
use crate::error::SyncError;

/// Answer to [`ThreadSyncEngine::request_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A fetch was started
    Started,
    /// A fetch is already running; its result will be delivered
    AlreadyInFlight,
    /// The engine hit a configuration error or was shut down
    Disabled,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Re-arm the poll timer after each successful thread fetch
    pub auto_poll: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { auto_poll: true }
    }
}

impl From<&PollingConfig> for EngineSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            auto_poll: config.auto_poll,
        }
    }
}

enum EngineCommand {
    RequestData {
        force: bool,
        response: oneshot::Sender<RequestOutcome>,
    },
    QuickLoad {
        listener: ListenerId,
        refetch: bool,
        response: oneshot::Sender<bool>,
    },
    SetTimer {
        response: oneshot::Sender<()>,
    },
    ClearTimer {
        response: oneshot::Sender<()>,
    },
    AddListener {
        listener: Arc<dyn SyncListener>,
        response: oneshot::Sender<ListenerId>,
    },
    RemoveListener {
        id: ListenerId,
        response: oneshot::Sender<bool>,
    },
    Snapshot {
        response: oneshot::Sender<Option<Arc<MaterializedThread>>>,
    },
    TimeUntilNextPoll {
        response: oneshot::Sender<Duration>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

struct FetchCompletion {
    request_id: u64,
    result: Result<FetchOutcome, SyncError>,
}

struct InFlight {
    request_id: u64,
    cancel: CancellationToken,
    /// Posts the fetch was started against
    baseline: Vec<Post>,
}

struct EngineActor {
    descriptor: ContentDescriptor,
    coordinator: Arc<FetchCoordinator>,
    cache: PostCache,
    scheduler: PollScheduler,
    settings: EngineSettings,
    thread: Option<Arc<MaterializedThread>>,
    listeners: Vec<(ListenerId, Arc<dyn SyncListener>)>,
    in_flight: Option<InFlight>,
    next_request_id: u64,
    poll_deadline: Option<Instant>,
    disabled: bool,
    commands: Receiver<EngineCommand>,
    completions_tx: mpsc::UnboundedSender<FetchCompletion>,
    completions_rx: mpsc::UnboundedReceiver<FetchCompletion>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl EngineActor {
    async fn run(mut self) {
        tracing::debug!("Engine started");

        loop {
            let deadline = self.poll_deadline;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Ok(EngineCommand::Shutdown { response }) => {
                        self.commands.close();
                        self.stop();
                        let _ = response.send(());
                        break;
                    }
                    Ok(command) => self.handle_command(command).await,
                    Err(_) => {
                        self.stop();
                        break;
                    }
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = wait_until(deadline) => {
                    self.poll_deadline = None;
                    tracing::debug!("Poll timer fired");
                    self.start_fetch(false).await;
                }
            }
        }

        tracing::debug!("Engine stopped");
    }

    fn stop(&mut self) {
        self.cancel_in_flight();
        self.poll_deadline = None;
        self.listeners.clear();
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::RequestData { force, response } => {
                let outcome = self.start_fetch(force).await;
                let _ = response.send(outcome);
            }
            EngineCommand::QuickLoad {
                listener,
                refetch,
                response,
            } => {
                let target = self.listeners.iter().find(|(id, _)| *id == listener);
                let delivered = match (&self.thread, target) {
                    (Some(thread), Some((_, target))) => {
                        target.on_data(thread.clone());
                        true
                    }
                    _ => false,
                };
                if refetch {
                    self.start_fetch(false).await;
                }
                let _ = response.send(delivered);
            }
            EngineCommand::SetTimer { response } => {
                if !self.disabled {
                    self.arm_timer();
                }
                let _ = response.send(());
            }
            EngineCommand::ClearTimer { response } => {
                self.poll_deadline = None;
                self.scheduler.reset();
                let _ = response.send(());
            }
            EngineCommand::AddListener { listener, response } => {
                let id = ListenerId::new();
                self.listeners.push((id, listener));
                tracing::debug!(listener = %id, count = self.listeners.len(), "Listener added");
                let _ = response.send(id);
            }
            EngineCommand::RemoveListener { id, response } => {
                self.listeners.retain(|(listener_id, _)| *listener_id != id);
                let dormant = self.listeners.is_empty();
                if dormant {
                    self.cancel_in_flight();
                    self.poll_deadline = None;
                    self.scheduler.reset();
                    tracing::debug!("Last listener removed, engine idle");
                }
                let _ = response.send(dormant);
            }
            EngineCommand::Snapshot { response } => {
                let _ = response.send(self.thread.clone());
            }
            EngineCommand::TimeUntilNextPoll { response } => {
                let remaining = self
                    .scheduler
                    .time_until_next_poll(Instant::now(), self.in_flight.is_some());
                let _ = response.send(remaining);
            }
            EngineCommand::Shutdown { response } => {
                // Handled in the run loop
                let _ = response.send(());
            }
        }
    }

    async fn start_fetch(&mut self, force: bool) -> RequestOutcome {
        if self.disabled {
            return RequestOutcome::Disabled;
        }

        if let Some(in_flight) = self.in_flight.take() {
            if !force {
                self.in_flight = Some(in_flight);
                return RequestOutcome::AlreadyInFlight;
            }
            in_flight.cancel.cancel();
            tracing::debug!(request_id = in_flight.request_id, "Cancelled fetch for forced reload");
        }

        self.poll_deadline = None;
        if force {
            self.scheduler.reset();
        }

        let baseline = self.baseline_posts().await;
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let cancel = CancellationToken::new();

        let coordinator = self.coordinator.clone();
        let descriptor = self.descriptor.clone();
        let completions = self.completions_tx.clone();
        let token = cancel.clone();
        let previous = baseline.clone();
        tokio::spawn(
            async move {
                let result = coordinator.fetch(&descriptor, &previous, &token).await;
                let _ = completions.send(FetchCompletion { request_id, result });
            }
            .in_current_span(),
        );

        tracing::debug!(request_id, force, "Fetch started");
        self.in_flight = Some(InFlight {
            request_id,
            cancel,
            baseline,
        });
        RequestOutcome::Started
    }

    /// Current posts, or the shared cache's copy before the first load
    async fn baseline_posts(&self) -> Vec<Post> {
        if let Some(thread) = &self.thread {
            return thread.posts.clone();
        }
        let Some(thread) = self.descriptor.as_thread() else {
            return Vec::new();
        };
        match self.cache.thread_posts(thread).await {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(error = %e, "Post cache unavailable");
                Vec::new()
            }
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            tracing::debug!(request_id = in_flight.request_id, "Cancelled in-flight fetch");
        }
    }

    async fn handle_completion(&mut self, completion: FetchCompletion) {
        let current = self.in_flight.as_ref().map(|f| f.request_id);
        if current != Some(completion.request_id) {
            tracing::trace!(request_id = completion.request_id, "Discarding stale completion");
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        match completion.result {
            Ok(outcome) => self.apply_outcome(in_flight.baseline, outcome).await,
            Err(e) if e.is_cancellation() => {
                tracing::debug!("Fetch cancelled");
            }
            Err(e) => {
                if e.is_fatal() {
                    self.disabled = true;
                    tracing::error!(error = %e, "Engine disabled");
                } else {
                    tracing::warn!(error = %e, "Fetch failed");
                }
                self.poll_deadline = None;
                self.notify_error(&e);
            }
        }
    }

    #[instrument(
        name = "sync.engine.apply",
        skip_all,
        fields(descriptor = %self.descriptor, posts, deleted_posts, duration_ms)
    )]
    async fn apply_outcome(&mut self, baseline: Vec<Post>, outcome: FetchOutcome) {
        let start = Instant::now();
        let result = outcome.result;

        let merged = match (&self.descriptor, result) {
            (ContentDescriptor::Catalog(_), _) => merge_catalog(outcome.posts),
            // A stored copy is no evidence of what the origin dropped
            (ContentDescriptor::Thread(_), FetchResult::LoadedFromStore { .. }) => {
                merge_stored(&baseline, outcome.posts, outcome.mirror_posts)
            }
            (ContentDescriptor::Thread(_), FetchResult::LoadedFromNetwork) => {
                let fresh_op = outcome.posts.iter().find(|p| p.is_op).cloned();
                let mut merged = merge(&baseline, outcome.posts, outcome.mirror_posts);
                if let Some(fresh_op) = fresh_op {
                    if let Some(op) = merged.posts.iter_mut().find(|p| p.is_op) {
                        op.apply_aggregates(&fresh_op);
                    }
                }
                merged
            }
        };
        let deleted_posts = merged.deleted.len();

        let thread = MaterializedThread::from_posts(self.descriptor.clone(), merged.posts, result);
        self.scheduler.record_poll(thread.post_count(), Instant::now());

        if let ContentDescriptor::Thread(descriptor) = &self.descriptor {
            if let Err(e) = self.cache.put_thread(descriptor.clone(), &thread.posts).await {
                tracing::warn!(error = %e, "Failed to update post cache");
            }
        }

        let thread = Arc::new(thread);
        self.thread = Some(thread.clone());
        tracing::info!(
            posts = thread.post_count(),
            deleted_posts,
            result = ?result,
            "Materialized"
        );
        self.notify_data(&thread);

        if self.settings.auto_poll
            && self.descriptor.is_thread()
            && !self.listeners.is_empty()
            && !thread.deleted
        {
            self.arm_timer();
        }

        let span = tracing::Span::current();
        span.record("posts", thread.post_count());
        span.record("deleted_posts", deleted_posts);
        span.record("duration_ms", start.elapsed().as_millis() as u64);
    }

    fn arm_timer(&mut self) {
        let delay = self.scheduler.current_delay();
        self.poll_deadline = Some(Instant::now() + delay);
        tracing::debug!(delay_secs = delay.as_secs(), "Next poll scheduled");
    }

    fn notify_data(&self, thread: &Arc<MaterializedThread>) {
        for (_, listener) in &self.listeners {
            listener.on_data(thread.clone());
        }
    }

    fn notify_error(&self, error: &SyncError) {
        let message = error.to_string();
        for (_, listener) in &self.listeners {
            listener.on_error(error.kind(), &message);
        }
    }
}

/// Handle to the engine of one descriptor. Cheap to clone.
#[derive(Clone)]
pub struct ThreadSyncEngine {
    descriptor: ContentDescriptor,
    commands: Sender<EngineCommand>,
}

impl ThreadSyncEngine {
    /// Spawn the engine task. Must be called from within a Tokio runtime.
    pub fn spawn(
        descriptor: ContentDescriptor,
        coordinator: Arc<FetchCoordinator>,
        cache: PostCache,
        scheduler: PollScheduler,
        settings: EngineSettings,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(ENGINE_COMMAND_QUEUE_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let actor = EngineActor {
            descriptor: descriptor.clone(),
            coordinator,
            cache,
            scheduler,
            settings,
            thread: None,
            listeners: Vec::new(),
            in_flight: None,
            next_request_id: 0,
            poll_deadline: None,
            disabled: false,
            commands: rx,
            completions_tx,
            completions_rx,
        };

        let span = tracing::info_span!("sync.engine", descriptor = %descriptor);
        tokio::spawn(actor.run().instrument(span));

        Self {
            descriptor,
            commands: tx,
        }
    }

    pub fn descriptor(&self) -> &ContentDescriptor {
        &self.descriptor
    }

    /// Whether the engine task still accepts commands
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(build(tx)).await.is_err() {
            tracing::debug!(descriptor = %self.descriptor, "Engine is shut down");
            return None;
        }
        rx.await.ok()
    }

    /// Start a fetch unless one is running. `force` cancels the running fetch
    /// and resets the poll backoff.
    pub async fn request_data(&self, force: bool) -> RequestOutcome {
        self.call(|response| EngineCommand::RequestData { force, response })
            .await
            .unwrap_or(RequestOutcome::Disabled)
    }

    /// Deliver the current view to one newly added listener without a
    /// network round-trip. Returns false if there is no view yet or the
    /// listener is not registered. With `refetch`, also requests fresh data.
    pub async fn quick_load(&self, listener: ListenerId, refetch: bool) -> bool {
        self.call(|response| EngineCommand::QuickLoad {
            listener,
            refetch,
            response,
        })
            .await
            .unwrap_or(false)
    }

    /// Arm the poll timer with the current backoff delay
    pub async fn set_timer(&self) {
        self.call(|response| EngineCommand::SetTimer { response }).await;
    }

    /// Disarm the poll timer and reset the backoff
    pub async fn clear_timer(&self) {
        self.call(|response| EngineCommand::ClearTimer { response }).await;
    }

    /// `None` when the engine is shut down
    pub async fn add_listener(&self, listener: Arc<dyn SyncListener>) -> Option<ListenerId> {
        self.call(|response| EngineCommand::AddListener { listener, response })
            .await
    }

    /// Remove a listener. Returns true if no listeners remain, in which case
    /// in-flight work was cancelled and the timer cleared.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.call(|response| EngineCommand::RemoveListener { id, response })
            .await
            .unwrap_or(true)
    }

    pub async fn snapshot(&self) -> Option<Arc<MaterializedThread>> {
        self.call(|response| EngineCommand::Snapshot { response })
            .await
            .flatten()
    }

    pub async fn time_until_next_poll(&self) -> Duration {
        self.call(|response| EngineCommand::TimeUntilNextPoll { response })
            .await
            .unwrap_or_default()
    }

    /// Stop the engine task, cancelling any in-flight fetch
    pub async fn shutdown(&self) {
        self.call(|response| EngineCommand::Shutdown { response }).await;
    }
}
