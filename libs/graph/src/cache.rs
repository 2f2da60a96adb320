//! A process-local, TTL-based read-through cache for resolved models.
//!
//! The cache may serve a model up to one TTL stale after a catalog write;
//! catalog mutations invalidate eagerly so a single process observes its own
//! writes immediately. A TTL of zero disables caching, which is how the
//! tests run.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use twin_types::{Dtmi, ModelRecord, model::{DtdlInterface, FlattenedModel}};

/// A fully resolved model: the stored record, its parsed interface, and the
/// contents flattened over all bases.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub record: ModelRecord,
    pub interface: DtdlInterface,
    pub flattened: FlattenedModel,
}

#[derive(Debug)]
pub struct ModelCache {
    ttl: Duration,
    entries: RwLock<HashMap<Dtmi, (Instant, Arc<ResolvedModel>)>>,
}

impl ModelCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, id: &Dtmi) -> Option<Arc<ResolvedModel>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read().ok()?;
        let (inserted_at, model) = entries.get(id)?;
        (inserted_at.elapsed() < self.ttl).then(|| Arc::clone(model))
    }

    pub fn insert(&self, model: ResolvedModel) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(model.record.id.clone(), (Instant::now(), Arc::new(model)));
        }
    }

    pub fn invalidate(&self, id: &Dtmi) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}
