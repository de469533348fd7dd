use crate::error::{EngineError, EngineResult};
use crate::task::TaskDefinition;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Keyed lookup of task definitions, populated before rules are compiled
pub struct TaskRegistry<P> {
    inner: RwLock<RegistryInner<P>>,
}

struct RegistryInner<P> {
    by_name: HashMap<String, Arc<TaskDefinition<P>>>,
    by_kind: BTreeMap<String, Vec<String>>,
}

impl<P> TaskRegistry<P> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_name: HashMap::new(),
                by_kind: BTreeMap::new(),
            }),
        }
    }

    /// Register a definition under its kind and name. Names are unique across kinds.
    pub fn register(&self, definition: TaskDefinition<P>) -> EngineResult<Arc<TaskDefinition<P>>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let name = definition.name().to_string();

        if inner.by_name.contains_key(&name) {
            return Err(EngineError::DuplicateTaskName(name));
        }

        let definition = Arc::new(definition);
        inner
            .by_kind
            .entry(definition.kind().to_string())
            .or_default()
            .push(name.clone());
        inner.by_name.insert(name.clone(), Arc::clone(&definition));

        tracing::debug!(task = %name, kind = %definition.kind(), "registered task");
        Ok(definition)
    }

    /// Get a definition by task name
    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition<P>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.get(name).cloned()
    }

    /// All definitions of one kind, in registration order
    pub fn lookup(&self, kind: &str) -> Vec<Arc<TaskDefinition<P>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_kind
            .get(kind)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| inner.by_name.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.contains_key(name)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_kind.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for TaskRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
