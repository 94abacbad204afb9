//! Capability traits the fetch coordinator is built from.
//!
//! Each external concern (resolving a descriptor to a URL, HTTP, parsing,
//! durable storage, mirrors) sits behind a trait object so engines can be
//! driven by in-memory fakes in tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use http::StatusCode;

use super::post::{Post, PostNo};
use super::{ContentDescriptor, ThreadDescriptor};
use crate::config::SourceKind;
use crate::error::{MirrorError, ParseError, StoreError, SyncError, TransportError};

/// Payload shape a parser is asked to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadMode {
    Catalog,
    Thread,
}

/// Where a descriptor is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    pub url: String,
    pub kind: SourceKind,
}

/// Maps descriptors to endpoints.
pub trait SourceResolver: Send + Sync {
    /// Fails with [`SyncError::Configuration`] for unknown sites
    fn resolve(&self, descriptor: &ContentDescriptor) -> Result<SourceEndpoint, SyncError>;
}

/// Raw HTTP response. Non-2xx statuses are data, not errors.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

pub trait PayloadParser: Send + Sync {
    fn parse(&self, body: &[u8], mode: PayloadMode) -> Result<Vec<Post>, ParseError>;
}

/// Durable copy of everything fetched, used when the network can't answer.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn persist_posts(
        &self,
        descriptor: &ContentDescriptor,
        posts: &[Post],
    ) -> Result<(), StoreError>;

    /// Empty when nothing was stored for the descriptor
    async fn load_posts(&self, descriptor: &ContentDescriptor) -> Result<Vec<Post>, StoreError>;
}

/// Third-party archive that may still hold posts the origin deleted.
#[async_trait]
pub trait MirrorLookup: Send + Sync {
    /// Whether any configured mirror archives this thread's site
    fn covers(&self, thread: &ThreadDescriptor) -> bool;

    /// Posts of `thread` the mirror can contribute. `known` lists post numbers
    /// the caller already has; implementations may skip them.
    async fn lookup_posts(
        &self,
        thread: &ThreadDescriptor,
        known: &BTreeSet<PostNo>,
    ) -> Result<Vec<Post>, MirrorError>;
}
