//! Method registry: names, call shapes, and payload validation.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Call shape of a registered method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    /// One request payload, one response payload.
    Unary,
    /// One request payload, an ordered sequence of response payloads.
    Stream,
}

type Validator = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// A registered method: its call shape plus a payload validator.
pub struct MethodSpec {
    kind: MethodKind,
    validate: Validator,
}

impl MethodSpec {
    /// Call shape.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Check a request payload against the method's expected shape.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        (self.validate)(payload)
    }
}

/// Registry mapping method names to their specs.
///
/// The registry only vets shape; the payload itself is forwarded to the
/// backend untouched.
pub struct MethodRegistry {
    methods: HashMap<String, MethodSpec>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a unary method whose payload must decode as `Req`.
    pub fn register_unary<Req: DeserializeOwned + 'static>(&mut self, method: &str) {
        self.register::<Req>(method, MethodKind::Unary);
    }

    /// Register a server-streaming method whose payload must decode as `Req`.
    pub fn register_stream<Req: DeserializeOwned + 'static>(&mut self, method: &str) {
        self.register::<Req>(method, MethodKind::Stream);
    }

    fn register<Req: DeserializeOwned + 'static>(&mut self, method: &str, kind: MethodKind) {
        let validate: Validator = Box::new(|payload| {
            serde_json::from_value::<Req>(payload.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        let _ = self
            .methods
            .insert(method.to_owned(), MethodSpec { kind, validate });
    }

    /// Look up a method by name.
    pub fn resolve(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method)
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}
