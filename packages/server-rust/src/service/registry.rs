use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rpcguard_core::{MethodDescriptor, MethodType, ServerCallHandler};

// ---------------------------------------------------------------------------
// ServerMethodDefinition
// ---------------------------------------------------------------------------

/// A method exposed by the server: its descriptor and the handler serving it.
pub struct ServerMethodDefinition<Req, Resp> {
    descriptor: MethodDescriptor,
    handler: Arc<dyn ServerCallHandler<Req, Resp>>,
}

impl<Req, Resp> ServerMethodDefinition<Req, Resp> {
    #[must_use]
    pub fn new(
        descriptor: MethodDescriptor,
        handler: Arc<dyn ServerCallHandler<Req, Resp>>,
    ) -> Self {
        Self {
            descriptor,
            handler,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn ServerCallHandler<Req, Resp>> {
        &self.handler
    }
}

impl<Req, Resp> fmt::Debug for ServerMethodDefinition<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMethodDefinition")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Methods served by a server, keyed by full method name (`service/method`).
///
/// Registration and lookup may happen concurrently. Registering a name twice
/// replaces the earlier definition.
pub struct HandlerRegistry<Req, Resp> {
    methods: DashMap<String, Arc<ServerMethodDefinition<Req, Resp>>>,
}

impl<Req, Resp> HandlerRegistry<Req, Resp> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: DashMap::new(),
        }
    }

    /// Registers `handler` under `full_name` with the given call shape.
    pub fn register<H>(&self, full_name: impl Into<String>, method_type: MethodType, handler: H)
    where
        H: ServerCallHandler<Req, Resp> + 'static,
    {
        let descriptor = MethodDescriptor::new(full_name, method_type);
        self.add(ServerMethodDefinition::new(descriptor, Arc::new(handler)));
    }

    /// Adds a prepared definition.
    pub fn add(&self, definition: ServerMethodDefinition<Req, Resp>) {
        let name = definition.descriptor().full_name().to_string();
        if self
            .methods
            .insert(name.clone(), Arc::new(definition))
            .is_some()
        {
            tracing::warn!(method = %name, "replaced existing method registration");
        } else {
            tracing::debug!(method = %name, "registered method");
        }
    }

    /// Returns the definition for `full_name`, or `None` if no such method
    /// is registered.
    #[must_use]
    pub fn lookup(&self, full_name: &str) -> Option<Arc<ServerMethodDefinition<Req, Resp>>> {
        self.methods
            .get(full_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered method names in sorted order.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<Req, Resp> Default for HandlerRegistry<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
