// src/server/coalesce.rs

//! Single-flight groups keyed by the cache key-string: only one request per
//! group talks to the backend, the rest share its completion signal.

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

/// The completion signal followers wait on. Resolves both when the leader
/// announces completion and when it gives up and drops the sender.
pub type Waiter = Shared<BoxFuture<'static, ()>>;

/// The outcome of joining a group.
pub enum GroupRole {
    /// This request was elected to perform the fetch; send on the channel
    /// (or drop it) once the cache has been settled.
    Leader(oneshot::Sender<()>),
    /// Another request is already fetching; await the waiter.
    Follower(Waiter),
}

#[derive(Default)]
pub struct Coalesce {
    groups: DashMap<String, Waiter>,
}

impl Coalesce {
    /// Joins the group for `key`, electing this caller as leader when no
    /// fetch is in flight.
    pub fn join(&self, key: &str) -> GroupRole {
        match self.groups.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                GroupRole::Follower(occupied.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel::<()>();
                let waiter: Waiter = rx.map(|_| ()).boxed().shared();
                vacant.insert(waiter);
                GroupRole::Leader(tx)
            }
        }
    }

    /// Drops the group so future requests for `key` start a fresh fetch.
    /// Requests already waiting keep their signal.
    pub fn forget(&self, key: &str) {
        self.groups.remove(key);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
