//! Message types for the bounded cache actor
//!
//! These messages are sent from a [`BoundedCache`](super::BoundedCache) handle to
//! its actor task via async_channel, with responses sent back via oneshot
//! channels. Requests are processed strictly in arrival order, so a store
//! followed by a get from the same caller always observes the stored value.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;

/// Predicate evaluated against cached values inside the actor
pub type ValueFilter<V> = Box<dyn Fn(&V) -> bool + Send>;

/// Visitor called per entry; returning `false` stops iteration
pub type EntryVisitor<K, V> = Box<dyn FnMut(&K, &V) -> bool + Send>;

/// In-place update applied to each selected value
pub type ValueUpdate<V> = Box<dyn FnMut(&mut V) + Send>;

/// Operation names, used in trace output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Get,
    GetMany,
    GetAll,
    FilterValues,
    FirstWhere,
    IterateWhile,
    Store,
    StoreMany,
    UpdateMany,
    Contains,
    Size,
    Delete,
    DeleteMany,
    Clear,
}

impl CacheOp {
    /// Whether the operation can grow or shrink the cache
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            CacheOp::Store
                | CacheOp::StoreMany
                | CacheOp::UpdateMany
                | CacheOp::Delete
                | CacheOp::DeleteMany
                | CacheOp::Clear
        )
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheOp::Get => "get",
            CacheOp::GetMany => "get_many",
            CacheOp::GetAll => "get_all",
            CacheOp::FilterValues => "filter_values",
            CacheOp::FirstWhere => "first_where",
            CacheOp::IterateWhile => "iterate_while",
            CacheOp::Store => "store",
            CacheOp::StoreMany => "store_many",
            CacheOp::UpdateMany => "update_many",
            CacheOp::Contains => "contains",
            CacheOp::Size => "size",
            CacheOp::Delete => "delete",
            CacheOp::DeleteMany => "delete_many",
            CacheOp::Clear => "clear",
        };
        write!(f, "{}", name)
    }
}

/// Request messages sent to the cache actor
pub enum CacheRequest<K, V> {
    Get {
        key: K,
        response: oneshot::Sender<Option<V>>,
    },
    GetMany {
        keys: Vec<K>,
        response: oneshot::Sender<HashMap<K, V>>,
    },
    GetAll {
        response: oneshot::Sender<HashMap<K, V>>,
    },
    FilterValues {
        filter: ValueFilter<V>,
        response: oneshot::Sender<Vec<V>>,
    },
    FirstWhere {
        predicate: ValueFilter<V>,
        response: oneshot::Sender<Option<V>>,
    },
    IterateWhile {
        visitor: EntryVisitor<K, V>,
        response: oneshot::Sender<()>,
    },
    Store {
        key: K,
        value: V,
        response: oneshot::Sender<()>,
    },
    StoreMany {
        entries: Vec<(K, V)>,
        response: oneshot::Sender<()>,
    },
    /// Apply `update` to each present key; responds with the number updated
    UpdateMany {
        keys: Vec<K>,
        update: ValueUpdate<V>,
        response: oneshot::Sender<usize>,
    },
    Contains {
        key: K,
        response: oneshot::Sender<bool>,
    },
    Size {
        response: oneshot::Sender<usize>,
    },
    Delete {
        key: K,
        response: oneshot::Sender<Option<V>>,
    },
    DeleteMany {
        keys: Vec<K>,
        response: oneshot::Sender<usize>,
    },
    Clear {
        response: oneshot::Sender<()>,
    },
}

impl<K, V> CacheRequest<K, V> {
    pub fn op(&self) -> CacheOp {
        match self {
            CacheRequest::Get { .. } => CacheOp::Get,
            CacheRequest::GetMany { .. } => CacheOp::GetMany,
            CacheRequest::GetAll { .. } => CacheOp::GetAll,
            CacheRequest::FilterValues { .. } => CacheOp::FilterValues,
            CacheRequest::FirstWhere { .. } => CacheOp::FirstWhere,
            CacheRequest::IterateWhile { .. } => CacheOp::IterateWhile,
            CacheRequest::Store { .. } => CacheOp::Store,
            CacheRequest::StoreMany { .. } => CacheOp::StoreMany,
            CacheRequest::UpdateMany { .. } => CacheOp::UpdateMany,
            CacheRequest::Contains { .. } => CacheOp::Contains,
            CacheRequest::Size { .. } => CacheOp::Size,
            CacheRequest::Delete { .. } => CacheOp::Delete,
            CacheRequest::DeleteMany { .. } => CacheOp::DeleteMany,
            CacheRequest::Clear { .. } => CacheOp::Clear,
        }
    }
}
