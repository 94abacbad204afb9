//! Fetch coordination with store and mirror fallbacks.
//!
//! A fetch tries the network first. Transport failures fall back to the
//! durable store; a "not found" answer for a thread first asks the mirrors,
//! persists whatever they return, then serves the stored copy marked as
//! deleted on the server. Successful network fetches are persisted and, when
//! posts appear to be missing, supplemented from a mirror.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::capabilities::{MirrorLookup, PayloadParser, PostStore, SourceResolver, Transport};
use super::merge::missing_post_numbers;
use super::post::{Post, PostNo};
use super::{ContentDescriptor, ThreadDescriptor};
use crate::config::{MirrorSettings, SourceKind, DEFAULT_MIRROR_TIMEOUT_SECS};
use crate::error::SyncError;

/// How a fetch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    LoadedFromNetwork,
    LoadedFromStore { deleted_on_server: bool },
}

impl FetchResult {
    pub fn is_deleted_on_server(&self) -> bool {
        matches!(self, FetchResult::LoadedFromStore { deleted_on_server: true })
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub result: FetchResult,
    /// Posts from the network, or the stored copy on fallback
    pub posts: Vec<Post>,
    /// Posts recovered from a mirror; take precedence when merged
    pub mirror_posts: Vec<Post>,
    pub source_kind: SourceKind,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub mirror_enabled: bool,
    pub mirror_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            mirror_enabled: true,
            mirror_timeout: Duration::from_secs(DEFAULT_MIRROR_TIMEOUT_SECS),
        }
    }
}

impl From<&MirrorSettings> for CoordinatorSettings {
    fn from(settings: &MirrorSettings) -> Self {
        Self {
            mirror_enabled: settings.enabled,
            mirror_timeout: Duration::from_secs(settings.timeout_seconds),
        }
    }
}

/// Resolves descriptors and fetches them through the fallback chain.
pub struct FetchCoordinator {
    resolver: Arc<dyn SourceResolver>,
    transport: Arc<dyn Transport>,
    parser: Arc<dyn PayloadParser>,
    store: Arc<dyn PostStore>,
    mirror: Option<Arc<dyn MirrorLookup>>,
    settings: CoordinatorSettings,
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, SyncError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        value = fut => Ok(value),
    }
}

impl FetchCoordinator {
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn PayloadParser>,
        store: Arc<dyn PostStore>,
    ) -> Self {
        Self {
            resolver,
            transport,
            parser,
            store,
            mirror: None,
            settings: CoordinatorSettings::default(),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorLookup>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Source kind of a descriptor's site; live when the site is unknown
    pub fn source_kind(&self, descriptor: &ContentDescriptor) -> SourceKind {
        self.resolver
            .resolve(descriptor)
            .map(|endpoint| endpoint.kind)
            .unwrap_or_default()
    }

    /// Fetch a descriptor, falling back to the store and mirrors as needed.
    ///
    /// `previous` is what the caller already shows; it is only used to decide
    /// whether a mirror lookup is worthwhile.
    #[instrument(
        name = "sync.coordinator.fetch",
        skip(self, descriptor, previous, cancel),
        fields(descriptor = %descriptor, result, duration_ms)
    )]
    pub async fn fetch(
        &self,
        descriptor: &ContentDescriptor,
        previous: &[Post],
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let start = Instant::now();
        let result = self.fetch_inner(descriptor, previous, cancel).await;

        let label = match &result {
            Ok(outcome) => match outcome.result {
                FetchResult::LoadedFromNetwork => "network".to_string(),
                FetchResult::LoadedFromStore { .. } => "store".to_string(),
            },
            Err(e) => e.kind().to_string(),
        };
        let span = tracing::Span::current();
        span.record("result", label.as_str());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    async fn fetch_inner(
        &self,
        descriptor: &ContentDescriptor,
        previous: &[Post],
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let endpoint = self.resolver.resolve(descriptor)?;
        tracing::debug!(url = %endpoint.url, kind = ?endpoint.kind, "Fetching");

        let response = match cancellable(cancel, self.transport.get(&endpoint.url)).await? {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Transport failed, trying stored copy");
                return self
                    .load_from_store(descriptor, endpoint.kind, SyncError::from(e), false, cancel)
                    .await;
            }
        };

        if !response.status.is_success() {
            let error = SyncError::Server {
                status: response.status.as_u16(),
            };
            if response.status == StatusCode::NOT_FOUND {
                return self
                    .recover_not_found(descriptor, endpoint.kind, error, cancel)
                    .await;
            }
            tracing::warn!(status = %response.status, "Server returned an error status");
            return Err(error);
        }

        let posts = self.parser.parse(&response.body, descriptor.mode())?;
        if posts.is_empty() {
            return Err(SyncError::EmptyPayload);
        }

        self.persist(descriptor, &posts).await;

        let mut mirror_posts = Vec::new();
        if let Some(thread) = descriptor.as_thread() {
            if self.mirror_eligible(thread, endpoint.kind) {
                let missing = missing_post_numbers(previous, &posts);
                if !missing.is_empty() {
                    tracing::debug!(missing = missing.len(), "Posts missing, consulting mirror");
                    let known = served_numbers(&posts);
                    let recovered = self.lookup_mirror(thread, &known, cancel).await?;
                    mirror_posts = keep_useful_mirror_posts(recovered, &posts);
                    if !mirror_posts.is_empty() {
                        self.persist(descriptor, &mirror_posts).await;
                    }
                }
            }
        }

        tracing::debug!(
            posts = posts.len(),
            mirror_posts = mirror_posts.len(),
            "Fetched from network"
        );

        Ok(FetchOutcome {
            result: FetchResult::LoadedFromNetwork,
            posts,
            mirror_posts,
            source_kind: endpoint.kind,
        })
    }

    /// 404 handling: recover what a mirror still has, then serve the store.
    async fn recover_not_found(
        &self,
        descriptor: &ContentDescriptor,
        kind: SourceKind,
        error: SyncError,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        tracing::info!("Not found on server, recovering");

        let mut mirror_posts = Vec::new();
        if let Some(thread) = descriptor.as_thread() {
            if self.mirror_eligible(thread, kind) {
                mirror_posts = self
                    .lookup_mirror(thread, &BTreeSet::new(), cancel)
                    .await?;
                if !mirror_posts.is_empty() {
                    self.persist(descriptor, &mirror_posts).await;
                }
            }
        }

        let mut outcome = self
            .load_from_store(descriptor, kind, error, true, cancel)
            .await?;
        outcome.mirror_posts = mirror_posts;
        Ok(outcome)
    }

    /// Serve the stored copy, or return `original` if there is none.
    async fn load_from_store(
        &self,
        descriptor: &ContentDescriptor,
        kind: SourceKind,
        original: SyncError,
        deleted_on_server: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let stored = match cancellable(cancel, self.store.load_posts(descriptor)).await? {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load stored copy");
                return Err(original);
            }
        };

        if stored.is_empty() {
            tracing::debug!("No stored copy available");
            return Err(original);
        }

        // A thread without its original post can't be shown
        if descriptor.is_thread() && !stored.iter().any(|p| p.is_op) {
            tracing::warn!(posts = stored.len(), "Stored copy has no original post");
            return Err(original);
        }

        tracing::info!(posts = stored.len(), deleted_on_server, "Loaded stored copy");

        Ok(FetchOutcome {
            result: FetchResult::LoadedFromStore { deleted_on_server },
            posts: stored,
            mirror_posts: Vec::new(),
            source_kind: kind,
        })
    }

    fn mirror_eligible(&self, thread: &ThreadDescriptor, kind: SourceKind) -> bool {
        self.settings.mirror_enabled
            && kind == SourceKind::Live
            && self.mirror.as_ref().is_some_and(|m| m.covers(thread))
    }

    /// Bounded mirror lookup. Failures and timeouts yield no posts.
    async fn lookup_mirror(
        &self,
        thread: &ThreadDescriptor,
        known: &BTreeSet<PostNo>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Post>, SyncError> {
        let Some(mirror) = &self.mirror else {
            return Ok(Vec::new());
        };

        let lookup = tokio::time::timeout(
            self.settings.mirror_timeout,
            mirror.lookup_posts(thread, known),
        );
        match cancellable(cancel, lookup).await? {
            Ok(Ok(posts)) => {
                tracing::debug!(posts = posts.len(), "Mirror lookup finished");
                Ok(posts)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Mirror lookup failed");
                Ok(Vec::new())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.settings.mirror_timeout.as_secs(),
                    "Mirror lookup timed out"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Persist posts; a store failure never fails the fetch
    async fn persist(&self, descriptor: &ContentDescriptor, posts: &[Post]) {
        if let Err(e) = self.store.persist_posts(descriptor, posts).await {
            tracing::warn!(error = %e, posts = posts.len(), "Failed to persist posts");
        }
    }
}

/// Numbers the origin still serves; the mirror only needs to supply the rest
fn served_numbers(fresh: &[Post]) -> BTreeSet<PostNo> {
    fresh.iter().map(|p| p.no).collect()
}

/// Drop mirror posts that add nothing over the fresh copy.
fn keep_useful_mirror_posts(mirror: Vec<Post>, fresh: &[Post]) -> Vec<Post> {
    let fresh_by_no: HashMap<PostNo, &Post> = fresh.iter().map(|p| (p.no, p)).collect();
    mirror
        .into_iter()
        .filter(|post| match fresh_by_no.get(&post.no) {
            Some(current) => post.images.len() > current.images.len(),
            None => true,
        })
        .collect()
}
