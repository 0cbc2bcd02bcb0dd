//! Ephemeral access handles to in-memory payloads
//!
//! Every payload the queue exposes (a job's source bytes, a converted output)
//! sits behind a [`HandleId`]. A handle is created once per payload and revoked
//! exactly once; revoking an unknown or already revoked handle is a logged
//! no-op, never an error.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(Uuid);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct HandleRegistry {
    live: HashMap<HandleId, Bytes>,
    created: u64,
    revoked: u64,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, data: Bytes) -> HandleId {
        let id = HandleId(Uuid::new_v4());
        self.live.insert(id, data);
        self.created += 1;
        debug!(handle = %id, "created access handle");
        id
    }

    /// Release a handle. Returns `false` when it was not live.
    pub fn revoke(&mut self, id: HandleId) -> bool {
        if self.live.remove(&id).is_some() {
            self.revoked += 1;
            debug!(handle = %id, "revoked access handle");
            true
        } else {
            warn!(handle = %id, "ignoring revoke of a handle that is not live");
            false
        }
    }

    pub fn resolve(&self, id: HandleId) -> Option<Bytes> {
        self.live.get(&id).cloned()
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn created_count(&self) -> u64 {
        self.created
    }

    pub fn revoked_count(&self) -> u64 {
        self.revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_resolve_revoke() {
        let mut handles = HandleRegistry::new();
        let id = handles.create(Bytes::from_static(b"payload"));

        assert_eq!(handles.resolve(id).as_deref(), Some(&b"payload"[..]));
        assert!(handles.revoke(id));
        assert!(handles.resolve(id).is_none());
        assert_eq!(handles.live_count(), 0);
    }

    #[test]
    fn test_double_revoke_is_noop() {
        let mut handles = HandleRegistry::new();
        let id = handles.create(Bytes::from_static(b"x"));

        assert!(handles.revoke(id));
        assert!(!handles.revoke(id));
        assert_eq!(handles.revoked_count(), 1);
    }

    #[test]
    fn test_handle_display() {
        let mut handles = HandleRegistry::new();
        let id = handles.create(Bytes::new());
        assert!(id.to_string().starts_with("blob:"));
    }
}
