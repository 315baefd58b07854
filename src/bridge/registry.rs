// Handle registry: maps opaque ids to live models and contexts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{LoadedModel, Session};

/// Shared context state. The mutex serializes calls on one context.
pub type SharedSession = Arc<Mutex<Session>>;

/// Live handles of both kinds.
///
/// Model and context ids come from one counter that starts at 1 and never
/// goes back, so an id is never reused and never valid for both kinds.
#[derive(Default)]
pub struct Registry {
    last_id: u64,
    models: HashMap<u64, Arc<LoadedModel>>,
    contexts: HashMap<u64, SharedSession>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn insert_model(&mut self, model: Arc<LoadedModel>) -> u64 {
        let id = self.next_id();
        self.models.insert(id, model);
        id
    }

    pub fn insert_context(&mut self, session: SharedSession) -> u64 {
        let id = self.next_id();
        self.contexts.insert(id, session);
        id
    }

    pub fn model(&self, id: u64) -> Option<Arc<LoadedModel>> {
        self.models.get(&id).cloned()
    }

    pub fn context(&self, id: u64) -> Option<SharedSession> {
        self.contexts.get(&id).cloned()
    }

    pub fn remove_model(&mut self, id: u64) -> Option<Arc<LoadedModel>> {
        self.models.remove(&id)
    }

    pub fn remove_context(&mut self, id: u64) -> Option<SharedSession> {
        self.contexts.remove(&id)
    }

    pub fn n_models(&self) -> usize {
        self.models.len()
    }

    pub fn n_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Drop every handle. Returns `(models, contexts)` released.
    pub fn clear(&mut self) -> (usize, usize) {
        let counts = (self.models.len(), self.contexts.len());
        self.contexts.clear();
        self.models.clear();
        counts
    }
}
