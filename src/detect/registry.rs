use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::DetectionError;

use super::backend::DetectorBackend;
use super::backends::{MotionBackend, MotionMemory, StubBackend};

/// Builds one backend instance. Called once per pool worker.
pub type BackendFactory =
    Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>, DetectionError> + Send + Sync>;

/// Settings handed to the built-in backends.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    pub confidence: f32,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence: 0.4,
            model_path: None,
            input_width: 640,
            input_height: 640,
        }
    }
}

/// Detector backends by name.
///
/// The registry holds factories rather than instances: every pool worker
/// gets a backend of its own, so `detect(&mut self)` never needs a lock.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `stub`, `motion` and, when compiled in, `tract`.
    pub fn with_builtin(settings: &DetectorSettings) -> Self {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));

        let memory = MotionMemory::new();
        registry.register("motion", move || {
            Ok(Box::new(MotionBackend::new(memory.clone())))
        });

        #[cfg(feature = "backend-tract")]
        {
            let settings = settings.clone();
            registry.register("tract", move || {
                let path = settings.model_path.as_ref().ok_or_else(|| {
                    DetectionError::Model("tract backend needs a model_path".into())
                })?;
                let backend = super::backends::TractBackend::new(
                    path,
                    settings.input_width,
                    settings.input_height,
                )?
                .with_threshold(settings.confidence);
                Ok(Box::new(backend))
            });
        }
        #[cfg(not(feature = "backend-tract"))]
        let _ = settings;

        registry
    }

    /// Register (or replace) a factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>, DetectionError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn factory(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).cloned()
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>, DetectionError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DetectionError::Model(format!("backend '{name}' not registered")))?;
        factory()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_backends_are_registered() {
        let registry = BackendRegistry::with_builtin(&DetectorSettings::default());
        assert!(registry.contains("stub"));
        assert!(registry.contains("motion"));
        assert_eq!(registry.create("motion").unwrap().name(), "motion");
    }

    #[test]
    fn unknown_backend_is_a_model_error() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.create("yolo-x"),
            Err(DetectionError::Model(_))
        ));
    }

    #[test]
    fn each_create_builds_a_fresh_instance() {
        let mut registry = BackendRegistry::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        let a = registry.create("stub").unwrap();
        let b = registry.create("stub").unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }
}
