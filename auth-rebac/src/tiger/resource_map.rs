use crate::models::Object;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bijection between objects and the dense integers bitmaps index by.
///
/// Ids are assigned in first-seen order and never reused.
#[derive(Default)]
pub struct ResourceMap {
    ids: DashMap<Object, u64>,
    objects: DashMap<u64, Object>,
    next: AtomicU64,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_assign(&self, object: &Object) -> u64 {
        if let Some(id) = self.ids.get(object) {
            return *id;
        }
        let entry = self.ids.entry(object.clone()).or_insert_with(|| {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.objects.insert(id, object.clone());
            id
        });
        *entry
    }

    pub fn id_of(&self, object: &Object) -> Option<u64> {
        self.ids.get(object).map(|id| *id)
    }

    pub fn object_of(&self, id: u64) -> Option<Object> {
        self.objects.get(&id).map(|o| o.clone())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
