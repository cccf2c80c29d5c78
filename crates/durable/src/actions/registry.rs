//! Registry of action handlers keyed by action type

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::handler::ActionHandler;

/// Maps action types to handlers
///
/// New action types are added by registering a handler; the engine itself
/// never matches on action type names.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Register a handler, replacing any previous one for the type
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered action types, sorted
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}

/// Builder for [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registry: HandlerRegistry,
}

impl HandlerRegistryBuilder {
    pub fn handler(mut self, action_type: impl Into<String>, handler: impl super::ActionHandler) -> Self {
        self.registry.register(action_type, Arc::new(handler));
        self
    }

    pub fn shared(mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.registry.register(action_type, handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        self.registry
    }
}
