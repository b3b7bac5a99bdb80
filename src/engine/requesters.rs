use dashmap::DashMap;

use crate::model::*;

/// Requesters keyed by normalized identity document. A document is registered
/// once; later submissions under the same document refresh the contact fields.
#[derive(Default)]
pub struct RequesterRegistry {
    by_identity: DashMap<String, Requester>,
}

impl RequesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-or-update. Returns the registry key the reservation refers to.
    pub fn upsert(&self, requester: &Requester) -> String {
        let key = requester.key();
        self.by_identity
            .entry(key.clone())
            .and_modify(|existing| {
                existing.name = requester.name.clone();
                if requester.phone.is_some() {
                    existing.phone = requester.phone.clone();
                }
                if requester.email.is_some() {
                    existing.email = requester.email.clone();
                }
            })
            .or_insert_with(|| requester.clone());
        key
    }

    pub fn get(&self, identity: &str) -> Option<Requester> {
        self.by_identity
            .get(&normalize_identity(identity))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Requester> {
        self.by_identity.iter().map(|e| e.value().clone()).collect()
    }
}
