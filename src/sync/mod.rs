//! Thread and catalog synchronization.
//!
//! This module contains the descriptor types that identify a catalog or a
//! thread, the post model, and the synchronization machinery built on top of
//! them: a per-descriptor engine that fetches, reconciles and publishes
//! posts, a fallback fetch coordinator, a shared bounded post cache and an
//! adaptive poll scheduler.
//!
//! Key re-exports:
//! - [`SyncService`] - Registry that hands out one engine per descriptor
//! - [`ThreadSyncEngine`] - Lifecycle of a single catalog or thread
//! - [`FetchCoordinator`] - Network, store and mirror fallback chain
//! - [`PostCache`] - Process-wide bounded cache of thread posts

mod cache;
mod capabilities;
mod coordinator;
mod engine;
mod listener;
mod merge;
mod messages;
mod post;
mod scheduler;
mod service;

pub use cache::{BoundedCache, PostCache, ThreadPosts};
pub use capabilities::{
    MirrorLookup, PayloadMode, PayloadParser, PostStore, SourceEndpoint, SourceResolver,
    Transport, TransportResponse,
};
pub use coordinator::{CoordinatorSettings, FetchCoordinator, FetchOutcome, FetchResult};
pub use engine::{EngineSettings, RequestOutcome, ThreadSyncEngine};
pub use listener::{ChannelListener, ListenerId, SyncEvent, SyncListener};
pub use merge::{merge, merge_catalog, merge_stored, missing_post_numbers, MergeOutcome};
pub use post::{MaterializedThread, Post, PostFlags, PostImage, PostNo, ThreadAggregates};
pub use scheduler::{BackoffTable, BackoffTables, PollScheduler};
pub use service::SyncService;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the catalog of a board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogDescriptor {
    pub site: String,
    pub board: String,
}

/// Identifies a single thread on a board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub site: String,
    pub board: String,
    /// Post number of the thread's original post
    pub thread_no: u64,
}

impl CatalogDescriptor {
    pub fn new(site: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
        }
    }
}

impl ThreadDescriptor {
    pub fn new(site: impl Into<String>, board: impl Into<String>, thread_no: u64) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
            thread_no,
        }
    }

    /// The catalog this thread is listed in
    pub fn catalog(&self) -> CatalogDescriptor {
        CatalogDescriptor::new(self.site.clone(), self.board.clone())
    }
}

/// Either a catalog or a thread. Used as cache, store and registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContentDescriptor {
    Catalog(CatalogDescriptor),
    Thread(ThreadDescriptor),
}

impl ContentDescriptor {
    pub fn catalog(site: impl Into<String>, board: impl Into<String>) -> Self {
        ContentDescriptor::Catalog(CatalogDescriptor::new(site, board))
    }

    pub fn thread(site: impl Into<String>, board: impl Into<String>, thread_no: u64) -> Self {
        ContentDescriptor::Thread(ThreadDescriptor::new(site, board, thread_no))
    }

    pub fn site(&self) -> &str {
        match self {
            ContentDescriptor::Catalog(c) => &c.site,
            ContentDescriptor::Thread(t) => &t.site,
        }
    }

    pub fn board(&self) -> &str {
        match self {
            ContentDescriptor::Catalog(c) => &c.board,
            ContentDescriptor::Thread(t) => &t.board,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, ContentDescriptor::Thread(_))
    }

    pub fn as_thread(&self) -> Option<&ThreadDescriptor> {
        match self {
            ContentDescriptor::Thread(t) => Some(t),
            ContentDescriptor::Catalog(_) => None,
        }
    }

    /// Payload shape expected from this descriptor's endpoint
    pub fn mode(&self) -> PayloadMode {
        match self {
            ContentDescriptor::Catalog(_) => PayloadMode::Catalog,
            ContentDescriptor::Thread(_) => PayloadMode::Thread,
        }
    }
}

impl From<ThreadDescriptor> for ContentDescriptor {
    fn from(t: ThreadDescriptor) -> Self {
        ContentDescriptor::Thread(t)
    }
}

impl From<CatalogDescriptor> for ContentDescriptor {
    fn from(c: CatalogDescriptor) -> Self {
        ContentDescriptor::Catalog(c)
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentDescriptor::Catalog(c) => write!(f, "{}/{}/catalog", c.site, c.board),
            ContentDescriptor::Thread(t) => write!(f, "{}/{}/{}", t.site, t.board, t.thread_no),
        }
    }
}

impl fmt::Display for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.site, self.board, self.thread_no)
    }
}
