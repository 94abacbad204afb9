//! JSON payload parser.
//!
//! Both catalogs and threads arrive as `{"posts": [...]}`. A post with
//! `resto == 0` is an original post; replies carry their thread number in
//! `resto`. Quotes are `>>123` in the comment, optionally HTML-escaped.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ParseError;
use crate::sync::{
    PayloadMode, PayloadParser, Post, PostFlags, PostImage, PostNo, ThreadAggregates,
};

#[derive(Debug, Deserialize)]
struct WirePayload {
    #[serde(default)]
    posts: Vec<WirePost>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    no: u64,
    #[serde(default)]
    sub_no: u64,
    #[serde(default)]
    resto: u64,
    time: i64,
    #[serde(default = "default_name")]
    name: String,
    trip: Option<String>,
    id: Option<String>,
    sub: Option<String>,
    #[serde(default)]
    com: String,
    #[serde(default)]
    images: Vec<WireImage>,
    #[serde(default)]
    sticky: bool,
    #[serde(default)]
    closed: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    deleted: bool,
    replies: Option<u32>,
    image_count: Option<u32>,
    unique_ips: Option<u32>,
    last_modified: Option<i64>,
    sticky_cap: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    tim: String,
    filename: Option<String>,
    ext: Option<String>,
    fsize: Option<u64>,
}

fn default_name() -> String {
    "Anonymous".to_string()
}

fn timestamp(secs: i64, post: u64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ParseError(format!("Post {}: invalid timestamp {}", post, secs)))
}

/// Post numbers quoted in a comment (`>>123`). Cross-board quotes
/// (`>>>/g/123`) are not replies and are skipped.
pub fn extract_reply_targets(comment: &str) -> BTreeSet<u64> {
    let text = comment.replace("&gt;", ">");
    let bytes = text.as_bytes();
    let mut targets = BTreeSet::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'>' && bytes[i + 1] == b'>' {
            let preceded_by_quote = i > 0 && bytes[i - 1] == b'>';
            let start = i + 2;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if !preceded_by_quote && end > start {
                if let Ok(no) = text[start..end].parse() {
                    targets.insert(no);
                }
            }
            i = end.max(i + 2);
        } else {
            i += 1;
        }
    }

    targets
}

impl WirePost {
    fn into_post(self) -> Result<Post, ParseError> {
        let is_op = self.resto == 0;
        let thread_no = if is_op { self.no } else { self.resto };

        let aggregates = if is_op {
            Some(ThreadAggregates {
                reply_count: self.replies.unwrap_or(0),
                image_count: self.image_count.unwrap_or(0),
                unique_posters: self.unique_ips,
                last_modified: self
                    .last_modified
                    .map(|secs| timestamp(secs, self.no))
                    .transpose()?,
                sticky_cap: self.sticky_cap,
            })
        } else {
            None
        };

        Ok(Post {
            no: PostNo::with_sub(self.no, self.sub_no),
            thread_no,
            timestamp: timestamp(self.time, self.no)?,
            name: self.name,
            tripcode: self.trip,
            poster_id: self.id,
            subject: self.sub,
            reply_to: extract_reply_targets(&self.com),
            comment: self.com,
            images: self
                .images
                .into_iter()
                .map(|image| PostImage {
                    server_filename: image.tim,
                    original_filename: image.filename,
                    extension: image.ext,
                    size: image.fsize,
                })
                .collect(),
            flags: PostFlags {
                sticky: self.sticky,
                closed: self.closed,
                archived: self.archived,
                deleted: self.deleted,
            },
            reply_from: Vec::new(),
            is_op,
            aggregates,
        })
    }
}

/// Parser for the `{"posts": [...]}` JSON format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadParser;

impl PayloadParser for JsonPayloadParser {
    fn parse(&self, body: &[u8], mode: PayloadMode) -> Result<Vec<Post>, ParseError> {
        let payload: WirePayload =
            serde_json::from_slice(body).map_err(|e| ParseError(e.to_string()))?;

        let posts = payload
            .posts
            .into_iter()
            .map(WirePost::into_post)
            .collect::<Result<Vec<_>, _>>()?;

        match mode {
            PayloadMode::Catalog => {
                if let Some(reply) = posts.iter().find(|p| !p.is_op) {
                    return Err(ParseError(format!(
                        "Catalog entry {} is not an original post",
                        reply.no
                    )));
                }
            }
            PayloadMode::Thread => {
                if !posts.is_empty() && !posts.iter().any(|p| p.is_op) {
                    return Err(ParseError(
                        "Thread payload has no original post".to_string(),
                    ));
                }
            }
        }

        Ok(posts)
    }
}
