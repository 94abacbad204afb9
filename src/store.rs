//! File-backed post store.
//!
//! Layout: `<data_dir>/<site>/<board>/thread_<no>.json` and
//! `<data_dir>/<site>/<board>/catalog.json`. Thread files accumulate every
//! post ever persisted (upsert by post number) so a thread that disappears
//! from the origin can be served in full. Catalog files hold the latest
//! listing only. Writes go to a temporary file that is then renamed.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::error::StoreError;
use crate::sync::{ContentDescriptor, Post, PostNo, PostStore};

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoredPosts {
    version: u32,
    posts: Vec<Post>,
}

pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

/// Make a descriptor component safe to use as a single path segment
fn path_segment(raw: &str) -> String {
    let encoded = urlencoding::encode(raw).into_owned();
    match encoded.as_str() {
        "" | "." | ".." => format!("_{}", encoded),
        _ => encoded,
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, descriptor: &ContentDescriptor) -> PathBuf {
        let dir = self
            .root
            .join(path_segment(descriptor.site()))
            .join(path_segment(descriptor.board()));
        match descriptor {
            ContentDescriptor::Catalog(_) => dir.join("catalog.json"),
            ContentDescriptor::Thread(t) => dir.join(format!("thread_{}.json", t.thread_no)),
        }
    }

    async fn read_file(path: &Path) -> Result<Vec<Post>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let stored: StoredPosts = serde_json::from_slice(&bytes)?;
                if stored.version != STORE_FORMAT_VERSION {
                    tracing::warn!(
                        path = %path.display(),
                        version = stored.version,
                        "Ignoring stored posts with unknown format version"
                    );
                    return Ok(Vec::new());
                }
                Ok(stored.posts)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(path: &Path, posts: Vec<Post>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(&StoredPosts {
            version: STORE_FORMAT_VERSION,
            posts,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl PostStore for FileStore {
    #[instrument(
        name = "sync.store.persist",
        skip(self, descriptor, posts),
        fields(descriptor = %descriptor, posts = posts.len())
    )]
    async fn persist_posts(
        &self,
        descriptor: &ContentDescriptor,
        posts: &[Post],
    ) -> Result<(), StoreError> {
        let path = self.path_for(descriptor);
        let _guard = self.write_lock.lock().await;

        let merged = match descriptor {
            ContentDescriptor::Catalog(_) => posts.to_vec(),
            ContentDescriptor::Thread(_) => {
                let mut by_no: BTreeMap<PostNo, Post> = Self::read_file(&path)
                    .await?
                    .into_iter()
                    .map(|p| (p.no, p))
                    .collect();
                for post in posts {
                    by_no.insert(post.no, post.clone());
                }
                by_no.into_values().collect()
            }
        };

        Self::write_file(&path, merged).await
    }

    #[instrument(name = "sync.store.load", skip(self, descriptor), fields(descriptor = %descriptor))]
    async fn load_posts(&self, descriptor: &ContentDescriptor) -> Result<Vec<Post>, StoreError> {
        Self::read_file(&self.path_for(descriptor)).await
    }
}
