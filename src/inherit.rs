//! Key/value tables that fall back to a parent table on a miss.
//!
//! Settings, template engines and the request/response capability tables of
//! an application are all `Inherited`. Mounting links the child's tables to
//! the parent's; a key set on the child afterwards shadows the parent's.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub(crate) struct Inherited<V> {
    own: RwLock<HashMap<String, V>>,
    parent: RwLock<Option<Arc<Inherited<V>>>>,
}

impl<V: Clone> Inherited<V> {
    pub(crate) fn new() -> Self {
        Self { own: RwLock::new(HashMap::new()), parent: RwLock::new(None) }
    }

    /// Own value, else the nearest ancestor's.
    pub(crate) fn get(&self, key: &str) -> Option<V> {
        if let Some(v) = self.own.read().get(key) {
            return Some(v.clone());
        }
        let parent = self.parent.read().clone();
        parent.and_then(|p| p.get(key))
    }

    pub(crate) fn set(&self, key: impl Into<String>, value: V) {
        self.own.write().insert(key.into(), value);
    }

    pub(crate) fn set_parent(&self, parent: Arc<Inherited<V>>) {
        *self.parent.write() = Some(parent);
    }

    /// Every visible entry, nearer tables winning.
    pub(crate) fn flatten(&self) -> HashMap<String, V> {
        let parent = self.parent.read().clone();
        let mut all = parent.map(|p| p.flatten()).unwrap_or_default();
        all.extend(self.own.read().iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }
}
