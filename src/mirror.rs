//! HTTP mirror lookup.
//!
//! Mirrors are third-party archives serving threads in the same payload
//! format as the origin. Mirrors covering a site are tried in configuration
//! order; the first one that answers wins.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http::StatusCode;
use tracing::instrument;

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::sites::mirror_thread_url;
use crate::sync::{MirrorLookup, PayloadMode, PayloadParser, Post, PostNo, ThreadDescriptor, Transport};

pub struct HttpMirrorLookup {
    mirrors: Vec<MirrorConfig>,
    transport: Arc<dyn Transport>,
    parser: Arc<dyn PayloadParser>,
}

impl HttpMirrorLookup {
    pub fn new(
        mirrors: Vec<MirrorConfig>,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn PayloadParser>,
    ) -> Self {
        Self {
            mirrors,
            transport,
            parser,
        }
    }

    async fn fetch_from(
        &self,
        mirror: &MirrorConfig,
        thread: &ThreadDescriptor,
    ) -> Result<Vec<Post>, MirrorError> {
        let url = mirror_thread_url(mirror, thread);
        let response = self
            .transport
            .get(&url)
            .await
            .map_err(|e| MirrorError(format!("{}: {}", mirror.name, e)))?;

        if response.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status.is_success() {
            return Err(MirrorError(format!(
                "{}: status {}",
                mirror.name, response.status
            )));
        }

        self.parser
            .parse(&response.body, PayloadMode::Thread)
            .map_err(|e| MirrorError(format!("{}: {}", mirror.name, e)))
    }
}

#[async_trait]
impl MirrorLookup for HttpMirrorLookup {
    fn covers(&self, thread: &ThreadDescriptor) -> bool {
        self.mirrors.iter().any(|m| m.covers(&thread.site))
    }

    #[instrument(
        name = "sync.mirror.lookup",
        skip(self, thread, known),
        fields(thread = %thread, mirror, duration_ms)
    )]
    async fn lookup_posts(
        &self,
        thread: &ThreadDescriptor,
        known: &BTreeSet<PostNo>,
    ) -> Result<Vec<Post>, MirrorError> {
        let start = Instant::now();
        let mut last_error = None;

        for mirror in self.mirrors.iter().filter(|m| m.covers(&thread.site)) {
            match self.fetch_from(mirror, thread).await {
                Ok(posts) => {
                    // Known posts only matter if the mirror kept their images
                    let useful: Vec<Post> = posts
                        .into_iter()
                        .filter(|p| p.thread_no == thread.thread_no)
                        .filter(|p| !known.contains(&p.no) || !p.images.is_empty())
                        .collect();

                    let span = tracing::Span::current();
                    span.record("mirror", mirror.name.as_str());
                    span.record("duration_ms", start.elapsed().as_millis() as u64);
                    return Ok(useful);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Mirror failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        Err(last_error.unwrap_or_else(|| {
            MirrorError(format!("No mirror covers site '{}'", thread.site))
        }))
    }
}
