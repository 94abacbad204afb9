//! Engine registry.
//!
//! Hands out one [`ThreadSyncEngine`] per descriptor so every consumer of a
//! thread shares the same fetch, timer and materialized view.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::cache::PostCache;
use super::coordinator::{CoordinatorSettings, FetchCoordinator};
use super::engine::{EngineSettings, ThreadSyncEngine};
use super::scheduler::{BackoffTables, PollScheduler};
use super::ContentDescriptor;
use crate::config::AppConfig;
use crate::error::TransportError;
use crate::mirror::HttpMirrorLookup;
use crate::parser::JsonPayloadParser;
use crate::sites::SiteRegistry;
use crate::store::FileStore;
use crate::transport::HttpTransport;

#[derive(Clone)]
pub struct SyncService {
    coordinator: Arc<FetchCoordinator>,
    cache: PostCache,
    tables: BackoffTables,
    settings: EngineSettings,
    engines: Arc<Mutex<HashMap<ContentDescriptor, ThreadSyncEngine>>>,
}

impl SyncService {
    pub fn new(
        coordinator: FetchCoordinator,
        cache: PostCache,
        tables: BackoffTables,
        settings: EngineSettings,
    ) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            cache,
            tables,
            settings,
            engines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire up the HTTP, JSON, file store and mirror implementations.
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &AppConfig) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new(&config.http)?);
        let parser = Arc::new(JsonPayloadParser);

        let mut coordinator = FetchCoordinator::new(
            Arc::new(SiteRegistry::new(&config.site)),
            transport.clone(),
            parser.clone(),
            Arc::new(FileStore::new(config.store.data_dir.clone())),
        )
        .with_settings(CoordinatorSettings::from(&config.mirror_settings));

        if !config.mirror.is_empty() {
            coordinator = coordinator.with_mirror(Arc::new(HttpMirrorLookup::new(
                config.mirror.clone(),
                transport,
                parser,
            )));
        }

        tracing::info!(
            sites = config.site.len(),
            mirrors = config.mirror.len(),
            cache_max_threads = config.cache.max_threads,
            "Sync service configured"
        );

        Ok(Self::new(
            coordinator,
            PostCache::spawn(&config.cache),
            BackoffTables::from_config(&config.polling),
            EngineSettings::from(&config.polling),
        ))
    }

    /// The engine for `descriptor`, spawning it on first use
    pub async fn engine(&self, descriptor: ContentDescriptor) -> ThreadSyncEngine {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(&descriptor) {
            if engine.is_running() {
                return engine.clone();
            }
        }

        let kind = self.coordinator.source_kind(&descriptor);
        let engine = ThreadSyncEngine::spawn(
            descriptor.clone(),
            self.coordinator.clone(),
            self.cache.clone(),
            PollScheduler::new(&self.tables, kind),
            self.settings.clone(),
        );
        tracing::debug!(%descriptor, ?kind, "Engine created");
        engines.insert(descriptor, engine.clone());
        engine
    }

    /// Shut down and forget the engine for `descriptor`
    pub async fn release(&self, descriptor: &ContentDescriptor) -> bool {
        let engine = self.engines.lock().await.remove(descriptor);
        match engine {
            Some(engine) => {
                engine.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn active_engines(&self) -> usize {
        self.engines.lock().await.len()
    }

    /// Shut down every engine
    pub async fn shutdown(&self) {
        let engines: Vec<ThreadSyncEngine> =
            self.engines.lock().await.drain().map(|(_, e)| e).collect();
        let count = engines.len();
        futures::future::join_all(engines.iter().map(|e| e.shutdown())).await;
        tracing::info!(engines = count, "Sync service stopped");
    }

    pub fn cache(&self) -> &PostCache {
        &self.cache
    }
}
