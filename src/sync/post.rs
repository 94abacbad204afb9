//! Post model and the materialized thread published to listeners.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::coordinator::FetchResult;
use super::ContentDescriptor;

/// Post number with an optional sub-number (0 when absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostNo {
    pub no: u64,
    #[serde(default)]
    pub sub_no: u64,
}

impl PostNo {
    pub fn new(no: u64) -> Self {
        Self { no, sub_no: 0 }
    }

    pub fn with_sub(no: u64, sub_no: u64) -> Self {
        Self { no, sub_no }
    }
}

impl fmt::Display for PostNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub_no == 0 {
            write!(f, "{}", self.no)
        } else {
            write!(f, "{},{}", self.no, self.sub_no)
        }
    }
}

/// Image attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostImage {
    pub server_filename: String,
    pub original_filename: Option<String>,
    pub extension: Option<String>,
    pub size: Option<u64>,
}

/// Moderation state of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostFlags {
    pub sticky: bool,
    pub closed: bool,
    pub archived: bool,
    pub deleted: bool,
}

/// Thread-level counters carried by an original post.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThreadAggregates {
    pub reply_count: u32,
    pub image_count: u32,
    pub unique_posters: Option<u32>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Maximum number of posts kept in a sticky rolling thread
    pub sticky_cap: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub no: PostNo,
    /// Number of the thread this post belongs to
    pub thread_no: u64,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub tripcode: Option<String>,
    pub poster_id: Option<String>,
    pub subject: Option<String>,
    pub comment: String,
    #[serde(default)]
    pub images: Vec<PostImage>,
    #[serde(default)]
    pub flags: PostFlags,
    /// Post numbers this post quotes (parsed from the comment)
    #[serde(default)]
    pub reply_to: BTreeSet<u64>,
    /// Post numbers quoting this post; always recomputed by the merger
    #[serde(default)]
    pub reply_from: Vec<u64>,
    pub is_op: bool,
    /// Present on original posts only
    #[serde(default)]
    pub aggregates: Option<ThreadAggregates>,
}

impl Post {
    /// A bare post with no content. `is_op` is derived from the numbers.
    pub fn new(thread_no: u64, no: u64) -> Self {
        let is_op = thread_no == no;
        Self {
            no: PostNo::new(no),
            thread_no,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            name: String::new(),
            tripcode: None,
            poster_id: None,
            subject: None,
            comment: String::new(),
            images: Vec::new(),
            flags: PostFlags::default(),
            reply_to: BTreeSet::new(),
            reply_from: Vec::new(),
            is_op,
            aggregates: is_op.then(ThreadAggregates::default),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_reply_to(mut self, targets: impl IntoIterator<Item = u64>) -> Self {
        self.reply_to.extend(targets);
        self
    }

    pub fn with_images(mut self, images: Vec<PostImage>) -> Self {
        self.images = images;
        self
    }

    pub fn with_aggregates(mut self, aggregates: ThreadAggregates) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    /// Refresh a retained post with a newer copy of itself.
    ///
    /// Comment and reply-to set are authoritative on the incoming copy, as are
    /// the moderation flags. Images are only replaced by a richer set, since a
    /// mirror may still hold images the origin removed.
    pub fn refresh_from(&mut self, incoming: &Post) {
        self.comment.clone_from(&incoming.comment);
        self.reply_to.clone_from(&incoming.reply_to);
        self.subject.clone_from(&incoming.subject);
        self.flags = incoming.flags;

        if incoming.images.len() > self.images.len() {
            self.images.clone_from(&incoming.images);
        }
    }

    /// Copy thread-level state from a freshly fetched OP onto this OP.
    pub fn apply_aggregates(&mut self, fresh_op: &Post) {
        if let Some(aggregates) = &fresh_op.aggregates {
            self.aggregates = Some(aggregates.clone());
        }
        self.flags.sticky = fresh_op.flags.sticky;
        self.flags.closed = fresh_op.flags.closed;
        self.flags.archived = fresh_op.flags.archived;
    }
}

/// Consistent, reply-linked view of a catalog or thread.
///
/// Built by an engine after reconciliation and published behind an `Arc`;
/// consumers never mutate it.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedThread {
    pub descriptor: ContentDescriptor,
    pub posts: Vec<Post>,
    pub closed: bool,
    pub archived: bool,
    /// The origin no longer serves this thread; posts come from the store
    pub deleted: bool,
    /// How the most recent fetch was satisfied
    pub last_result: FetchResult,
}

impl MaterializedThread {
    /// Build from merged posts, taking closed/archived from the OP. A thread
    /// the origin no longer serves also gets its OP flagged deleted.
    pub fn from_posts(
        descriptor: ContentDescriptor,
        posts: Vec<Post>,
        last_result: FetchResult,
    ) -> Self {
        let mut thread = Self {
            descriptor,
            posts,
            closed: false,
            archived: false,
            deleted: last_result.is_deleted_on_server(),
            last_result,
        };
        thread.sync_flags_from_op();
        if thread.deleted {
            if let Some(op) = thread.original_post_mut() {
                op.flags.deleted = true;
            }
        }
        thread
    }

    /// The original post, for thread descriptors
    pub fn original_post(&self) -> Option<&Post> {
        if !self.descriptor.is_thread() {
            return None;
        }
        self.posts.iter().find(|p| p.is_op)
    }

    pub fn original_post_mut(&mut self) -> Option<&mut Post> {
        if !self.descriptor.is_thread() {
            return None;
        }
        self.posts.iter_mut().find(|p| p.is_op)
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn find(&self, no: PostNo) -> Option<&Post> {
        self.posts.iter().find(|p| p.no == no)
    }

    /// Posts currently flagged as deleted
    pub fn deleted_posts(&self) -> impl Iterator<Item = &Post> {
        self.posts.iter().filter(|p| p.flags.deleted)
    }

    /// Re-derive closed/archived from the OP
    pub fn sync_flags_from_op(&mut self) {
        if let Some(op) = self.original_post() {
            let flags = op.flags;
            self.closed = flags.closed;
            self.archived = flags.archived;
        }
    }
}
