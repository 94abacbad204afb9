//! Site registry: resolves descriptors to endpoint URLs.

use std::collections::HashMap;

use crate::config::{MirrorConfig, SiteConfig, BOARD_PLACEHOLDER, THREAD_PLACEHOLDER};
use crate::error::SyncError;
use crate::sync::{ContentDescriptor, SourceEndpoint, SourceResolver, ThreadDescriptor};

/// Sites known to this process, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: HashMap<String, SiteConfig>,
}

impl SiteRegistry {
    pub fn new(sites: &[SiteConfig]) -> Self {
        Self {
            sites: sites
                .iter()
                .map(|site| (site.name.clone(), site.clone()))
                .collect(),
        }
    }
}

impl SourceResolver for SiteRegistry {
    fn resolve(&self, descriptor: &ContentDescriptor) -> Result<SourceEndpoint, SyncError> {
        let site = self.sites.get(descriptor.site()).ok_or_else(|| {
            SyncError::Configuration(format!("Site '{}' is not configured", descriptor.site()))
        })?;

        let url = match descriptor {
            ContentDescriptor::Catalog(catalog) => expand(&site.catalog_url, &catalog.board, None),
            ContentDescriptor::Thread(thread) => {
                expand(&site.thread_url, &thread.board, Some(thread.thread_no))
            }
        };

        Ok(SourceEndpoint {
            url,
            kind: site.kind,
        })
    }
}

/// Thread URL of `thread` on a mirror
pub fn mirror_thread_url(mirror: &MirrorConfig, thread: &ThreadDescriptor) -> String {
    expand(&mirror.thread_url, &thread.board, Some(thread.thread_no))
}

/// Fill a URL template. The board code is percent-encoded.
fn expand(template: &str, board: &str, thread_no: Option<u64>) -> String {
    let url = template.replace(BOARD_PLACEHOLDER, &urlencoding::encode(board));
    match thread_no {
        Some(no) => url.replace(THREAD_PLACEHOLDER, &no.to_string()),
        None => url,
    }
}
