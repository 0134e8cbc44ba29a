//! Live sessions keyed by session id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::inner::SessionInner;

/// Concurrent map of open sessions.
///
/// At most one non-closed session exists per id; reopening a live id returns
/// the existing session.
#[derive(Clone, Default)]
pub(crate) struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<SessionInner>>>,
}

impl SessionRegistry {
    /// Return the live session for `id`, or insert the one built by `create`.
    ///
    /// The flag is `true` when `create` ran. `create` must not touch the
    /// registry.
    pub(crate) fn get_or_insert_with(
        &self,
        id: &str,
        create: impl FnOnce() -> Arc<SessionInner>,
    ) -> (Arc<SessionInner>, bool) {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state().is_closed() {
                    return (Arc::clone(entry.get()), false);
                }
                let session = create();
                entry.insert(Arc::clone(&session));
                (session, true)
            }
            Entry::Vacant(entry) => {
                let session = create();
                entry.insert(Arc::clone(&session));
                (session, true)
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<SessionInner>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `id` only if it still maps to `session`.
    ///
    /// A closed session must not evict a newer one opened under the same id.
    pub(crate) fn remove(&self, id: &str, session: &SessionInner) -> bool {
        self.sessions
            .remove_if(id, |_, current| std::ptr::eq(Arc::as_ptr(current), session))
            .is_some()
    }

    /// Snapshot of every registered session.
    pub(crate) fn all(&self) -> Vec<Arc<SessionInner>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
