use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::backend::DetectorBackend;
use crate::error::DetectionError;

/// Shared handle to a backend. The detection worker locks it per pass.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Detector backends available to this build, looked up by the name in
/// `detection.backend`. The first one registered answers for "no preference".
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, SharedBackend>,
    first: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend under its own name, replacing one of the same name.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        self.first.get_or_insert_with(|| name.clone());
        let shared: SharedBackend = Arc::new(Mutex::new(backend));
        self.backends.insert(name, shared);
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).map(Arc::clone)
    }

    /// Backend called `name`, or the first registered one for `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<SharedBackend, DetectionError> {
        let wanted = match name.or(self.first.as_deref()) {
            Some(wanted) => wanted,
            None => {
                return Err(DetectionError::Backend {
                    backend: String::new(),
                    reason: "no detector backend registered".into(),
                })
            }
        };
        self.get(wanted).ok_or_else(|| DetectionError::Backend {
            backend: wanted.to_string(),
            reason: format!("not registered (have: {})", self.list().join(", ")),
        })
    }

    /// Registered names in ascending order.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;

    #[test]
    fn resolves_by_name_or_first_registered() {
        let mut registry = BackendRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.resolve(None).is_err());

        registry.register(StubBackend::new());
        let backend = registry.resolve(None).unwrap();
        assert_eq!(backend.lock().unwrap().name(), "stub");
        assert!(registry.resolve(Some("stub")).is_ok());

        let err = registry.resolve(Some("tract")).err().unwrap();
        assert!(err.to_string().contains("not registered (have: stub)"));
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }
}
