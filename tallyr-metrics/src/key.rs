use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;

/// Interned sample name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u32);

impl From<u32> for KeyId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<KeyId> for u32 {
    fn from(v: KeyId) -> Self {
        v.0
    }
}

#[derive(Debug, Default)]
struct Table {
    ids: HashMap<Arc<str>, KeyId, RandomState>,
    names: Vec<Arc<str>>,
}

/// Append-only string interner shared by every execution on the aggregator.
#[derive(Debug, Default)]
pub struct Interner {
    table: RwLock<Table>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, s: &str) -> Option<KeyId> {
        self.table.read().ids.get(s).copied()
    }

    pub fn get_or_intern(&self, s: &str) -> KeyId {
        if let Some(id) = self.get(s) {
            return id;
        }

        let mut table = self.table.write();

        // Another writer may have interned it between the read and write locks.
        if let Some(&id) = table.ids.get(s) {
            return id;
        }

        let id = KeyId(table.names.len() as u32);
        let s: Arc<str> = Arc::from(s);
        table.names.push(s.clone());
        table.ids.insert(s, id);
        id
    }

    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.table.read().names.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
