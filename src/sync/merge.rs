//! Post reconciliation.
//!
//! Combines the posts an engine already holds with a freshly fetched set and
//! optional mirror-recovered posts. Previously seen posts are never dropped:
//! a post the origin stops returning stays in the thread, flagged deleted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::trace;

use super::post::{Post, PostNo};

/// Result of a thread merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Cached posts in their original order followed by new posts ascending
    pub posts: Vec<Post>,
    /// Cached posts absent from both the fresh and the mirror set
    pub deleted: BTreeSet<PostNo>,
}

/// Merge a thread's cached posts with fresh and mirror posts.
///
/// Mirror posts take precedence over fresh posts carrying the same number.
/// Reply back-references are rebuilt from scratch on the merged list.
pub fn merge(cached: &[Post], fresh: Vec<Post>, mirror: Vec<Post>) -> MergeOutcome {
    let mut incoming: BTreeMap<PostNo, Post> = fresh.into_iter().map(|p| (p.no, p)).collect();
    for post in mirror {
        incoming.insert(post.no, post);
    }

    let mut posts = Vec::with_capacity(cached.len() + incoming.len());
    let mut deleted = BTreeSet::new();
    let mut seen = HashSet::with_capacity(cached.len());

    for cached_post in cached {
        if !seen.insert(cached_post.no) {
            continue;
        }

        let mut post = cached_post.clone();
        match incoming.remove(&post.no) {
            Some(update) => post.refresh_from(&update),
            None => {
                if !post.flags.deleted {
                    trace!(post = %post.no, "Post no longer served, marking deleted");
                    post.flags.deleted = true;
                }
                deleted.insert(post.no);
            }
        }
        posts.push(post);
    }

    // BTreeMap iteration yields the remaining new posts in ascending order
    posts.extend(incoming.into_values());

    link_replies(&mut posts);

    MergeOutcome { posts, deleted }
}

/// Merge a thread's cached posts with a stored copy served in place of the
/// origin.
///
/// The stored copy says nothing about what the origin still has, so cached
/// posts are never flagged deleted and keep their content. Stored posts only
/// fill in numbers the cache lacks. Mirror posts still refresh cached ones.
pub fn merge_stored(cached: &[Post], stored: Vec<Post>, mirror: Vec<Post>) -> MergeOutcome {
    let mut fill: BTreeMap<PostNo, Post> = stored.into_iter().map(|p| (p.no, p)).collect();
    let mut mirrored: BTreeMap<PostNo, Post> = mirror.into_iter().map(|p| (p.no, p)).collect();

    let mut posts = Vec::with_capacity(cached.len() + fill.len());
    let mut seen = HashSet::with_capacity(cached.len());

    for cached_post in cached {
        if !seen.insert(cached_post.no) {
            continue;
        }

        let mut post = cached_post.clone();
        if let Some(update) = mirrored.remove(&post.no) {
            post.refresh_from(&update);
        }
        fill.remove(&post.no);
        posts.push(post);
    }

    fill.append(&mut mirrored);
    posts.extend(fill.into_values());

    link_replies(&mut posts);

    MergeOutcome {
        posts,
        deleted: BTreeSet::new(),
    }
}

/// Catalog "merge": the fresh listing replaces whatever was shown before.
///
/// Server order (bump order) is preserved and duplicate numbers are dropped.
pub fn merge_catalog(fresh: Vec<Post>) -> MergeOutcome {
    let mut seen = HashSet::with_capacity(fresh.len());
    let posts = fresh.into_iter().filter(|p| seen.insert(p.no)).collect();

    MergeOutcome {
        posts,
        deleted: BTreeSet::new(),
    }
}

/// Rebuild `reply_from` on every post from the `reply_to` sets.
///
/// Targets that do not exist in the list (ghost replies) are ignored.
pub fn link_replies(posts: &mut [Post]) {
    let index: HashMap<u64, usize> = posts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.no.sub_no == 0)
        .map(|(i, p)| (p.no.no, i))
        .collect();

    for post in posts.iter_mut() {
        post.reply_from.clear();
    }

    let mut edges = Vec::new();
    for post in posts.iter() {
        for target in &post.reply_to {
            if *target == post.no.no {
                continue;
            }
            if let Some(&idx) = index.get(target) {
                edges.push((idx, post.no.no));
            }
        }
    }

    for (idx, source) in edges {
        let replies = &mut posts[idx].reply_from;
        if !replies.contains(&source) {
            replies.push(source);
        }
    }
}

/// Post numbers worth asking a mirror about.
///
/// These are in-thread reply targets that no known post carries, plus
/// previously known posts the origin no longer returns.
pub fn missing_post_numbers(previous: &[Post], fresh: &[Post]) -> BTreeSet<u64> {
    let fresh_numbers: HashSet<u64> = fresh.iter().map(|p| p.no.no).collect();
    let known: HashSet<u64> = previous
        .iter()
        .map(|p| p.no.no)
        .chain(fresh_numbers.iter().copied())
        .collect();

    let mut missing: BTreeSet<u64> = previous
        .iter()
        .filter(|p| !p.flags.deleted && !fresh_numbers.contains(&p.no.no))
        .map(|p| p.no.no)
        .collect();

    for post in fresh {
        missing.extend(
            post.reply_to
                .iter()
                .filter(|target| **target >= post.thread_no && !known.contains(target)),
        );
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::post::PostImage;

    fn numbers(posts: &[Post]) -> Vec<u64> {
        posts.iter().map(|p| p.no.no).collect()
    }

    fn find(posts: &[Post], no: u64) -> &Post {
        posts.iter().find(|p| p.no.no == no).unwrap()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[test]
    fn test_missing_post_is_retained_and_flagged() {
        let cached = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 3)];
        let fresh = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 4)];

        let outcome = merge(&cached, fresh, vec![]);

        assert_eq!(numbers(&outcome.posts), vec![1, 2, 3, 4]);
        assert!(find(&outcome.posts, 3).flags.deleted);
        assert!(!find(&outcome.posts, 4).flags.deleted);
        assert_eq!(outcome.deleted, BTreeSet::from([PostNo::new(3)]));
    }

    #[test]
    fn test_mirror_recovers_deleted_post() {
        let cached = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 3)];
        let fresh = vec![Post::new(1, 1), Post::new(1, 2)];
        let mirror = vec![Post::new(1, 3).with_comment("archived copy")];

        let outcome = merge(&cached, fresh, mirror);

        assert!(outcome.deleted.is_empty());
        let recovered = find(&outcome.posts, 3);
        assert!(!recovered.flags.deleted);
        assert_eq!(recovered.comment, "archived copy");
    }

    #[test]
    fn test_mirror_wins_over_fresh() {
        let fresh = vec![Post::new(1, 1), Post::new(1, 2).with_comment("fresh")];
        let mirror = vec![Post::new(1, 2).with_comment("mirror")];

        let outcome = merge(&[], fresh, mirror);

        assert_eq!(find(&outcome.posts, 2).comment, "mirror");
    }

    #[test]
    fn test_lagging_stored_copy_flags_nothing() {
        let cached = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 3)];
        let stored = vec![Post::new(1, 1), Post::new(1, 2)];

        let outcome = merge_stored(&cached, stored, vec![]);

        assert_eq!(numbers(&outcome.posts), vec![1, 2, 3]);
        assert!(outcome.deleted.is_empty());
        assert!(outcome.posts.iter().all(|p| !p.flags.deleted));
    }

    #[test]
    fn test_stored_copy_fills_gaps_without_overwriting() {
        let cached = vec![Post::new(1, 1), Post::new(1, 2).with_comment("current")];
        let stored = vec![
            Post::new(1, 2).with_comment("stale"),
            Post::new(1, 4),
            Post::new(1, 3).with_reply_to([2]),
        ];
        let mirror = vec![Post::new(1, 1).with_comment("mirror"), Post::new(1, 5)];

        let outcome = merge_stored(&cached, stored, mirror);

        assert_eq!(numbers(&outcome.posts), vec![1, 2, 3, 4, 5]);
        assert_eq!(find(&outcome.posts, 1).comment, "mirror");
        assert_eq!(find(&outcome.posts, 2).comment, "current");
        assert_eq!(find(&outcome.posts, 2).reply_from, vec![3]);
    }

    #[test]
    fn test_stored_copy_keeps_existing_deleted_flags() {
        let mut gone = Post::new(1, 2);
        gone.flags.deleted = true;
        let cached = vec![Post::new(1, 1), gone];

        let outcome = merge_stored(&cached, vec![Post::new(1, 1)], vec![]);

        assert!(find(&outcome.posts, 2).flags.deleted);
        assert!(outcome.deleted.is_empty());
    }

    #[test]
    fn test_every_input_number_is_present() {
        let cached = vec![Post::new(1, 1), Post::new(1, 5)];
        let fresh = vec![Post::new(1, 1), Post::new(1, 7), Post::new(1, 6)];
        let mirror = vec![Post::new(1, 9)];

        let outcome = merge(&cached, fresh, mirror);

        let present: BTreeSet<u64> = numbers(&outcome.posts).into_iter().collect();
        assert_eq!(present, BTreeSet::from([1, 5, 6, 7, 9]));
        assert_eq!(outcome.posts.len(), 5);
    }

    #[test]
    fn test_new_posts_are_appended_ascending() {
        let cached = vec![Post::new(1, 1), Post::new(1, 3)];
        let fresh = vec![Post::new(1, 8), Post::new(1, 1), Post::new(1, 4), Post::new(1, 3)];

        let outcome = merge(&cached, fresh, vec![]);

        assert_eq!(numbers(&outcome.posts), vec![1, 3, 4, 8]);
    }

    #[test]
    fn test_deleted_stays_deleted_until_returned() {
        let mut gone = Post::new(1, 2);
        gone.flags.deleted = true;
        let cached = vec![Post::new(1, 1), gone];

        let still_gone = merge(&cached, vec![Post::new(1, 1)], vec![]);
        assert!(find(&still_gone.posts, 2).flags.deleted);

        let returned = merge(&still_gone.posts, vec![Post::new(1, 1), Post::new(1, 2)], vec![]);
        assert!(!find(&returned.posts, 2).flags.deleted);
    }

    #[test]
    fn test_refresh_keeps_richer_cached_images() {
        let image = PostImage {
            server_filename: "1700000000.png".into(),
            ..Default::default()
        };
        let cached = vec![Post::new(1, 1), Post::new(1, 2).with_images(vec![image])];
        let fresh = vec![Post::new(1, 1), Post::new(1, 2).with_comment("edited")];

        let outcome = merge(&cached, fresh, vec![]);

        let post = find(&outcome.posts, 2);
        assert_eq!(post.comment, "edited");
        assert_eq!(post.images.len(), 1);
    }

    #[test]
    fn test_duplicate_cached_posts_are_collapsed() {
        let cached = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 2)];

        let outcome = merge(&cached, vec![Post::new(1, 1), Post::new(1, 2)], vec![]);

        assert_eq!(numbers(&outcome.posts), vec![1, 2]);
    }

    // =========================================================================
    // Reply Linking
    // =========================================================================

    #[test]
    fn test_reply_from_is_symmetric() {
        let fresh = vec![
            Post::new(1, 1),
            Post::new(1, 2).with_reply_to([1]),
            Post::new(1, 3).with_reply_to([1, 2]),
        ];

        let outcome = merge(&[], fresh, vec![]);

        assert_eq!(find(&outcome.posts, 1).reply_from, vec![2, 3]);
        assert_eq!(find(&outcome.posts, 2).reply_from, vec![3]);
        assert!(find(&outcome.posts, 3).reply_from.is_empty());

        for post in &outcome.posts {
            for source in &post.reply_from {
                assert!(find(&outcome.posts, *source).reply_to.contains(&post.no.no));
            }
        }
    }

    #[test]
    fn test_ghost_replies_are_ignored() {
        let fresh = vec![Post::new(1, 1), Post::new(1, 2).with_reply_to([1, 999])];

        let outcome = merge(&[], fresh, vec![]);

        assert_eq!(outcome.posts.len(), 2);
        assert_eq!(find(&outcome.posts, 1).reply_from, vec![2]);
    }

    #[test]
    fn test_reply_from_is_rebuilt_not_accumulated() {
        let mut stale = Post::new(1, 1);
        stale.reply_from = vec![42, 43];
        let cached = vec![stale];

        let outcome = merge(&cached, vec![Post::new(1, 1)], vec![]);

        assert!(find(&outcome.posts, 1).reply_from.is_empty());
    }

    // =========================================================================
    // Catalogs and Mirror Hints
    // =========================================================================

    #[test]
    fn test_catalog_keeps_server_order() {
        let fresh = vec![Post::new(30, 30), Post::new(10, 10), Post::new(20, 20), Post::new(10, 10)];

        let outcome = merge_catalog(fresh);

        assert_eq!(numbers(&outcome.posts), vec![30, 10, 20]);
        assert!(outcome.deleted.is_empty());
    }

    #[test]
    fn test_missing_numbers_from_vanished_posts() {
        let previous = vec![Post::new(1, 1), Post::new(1, 2), Post::new(1, 3)];
        let fresh = vec![Post::new(1, 1), Post::new(1, 3)];

        assert_eq!(missing_post_numbers(&previous, &fresh), BTreeSet::from([2]));
    }

    #[test]
    fn test_missing_numbers_from_unresolved_replies() {
        let fresh = vec![Post::new(100, 100), Post::new(100, 105).with_reply_to([100, 103, 7])];

        // 7 predates the thread, so it is a cross-thread quote
        assert_eq!(missing_post_numbers(&[], &fresh), BTreeSet::from([103]));
    }

    #[test]
    fn test_nothing_missing() {
        let previous = vec![Post::new(1, 1)];
        let fresh = vec![Post::new(1, 1), Post::new(1, 2).with_reply_to([1])];

        assert!(missing_post_numbers(&previous, &fresh).is_empty());
    }
}
