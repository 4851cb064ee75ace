//! Stage type registry.
//!
//! A [`StageRegistry`] maps stage type names to factories so pipelines
//! can be assembled from names. Registries are explicit values built at
//! startup and handed to
//! [`Pipeline::with_registry`](crate::pipeline::Pipeline::with_registry);
//! there is no process-wide registry.

use crate::stage::pad::PadTemplate;
use crate::stage::Stage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type StageFactory = Box<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// A registered stage type: its name, the pads instances will expose,
/// and a factory producing fresh instances.
pub struct StageTemplate {
    name: String,
    pad_templates: Vec<PadTemplate>,
    factory: StageFactory,
}

impl StageTemplate {
    /// Describe a stage type.
    pub fn new(
        name: impl Into<String>,
        pad_templates: Vec<PadTemplate>,
        factory: impl Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            pad_templates,
            factory: Box::new(factory),
        }
    }

    /// The type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pads instances of this type expose.
    pub fn pad_templates(&self) -> &[PadTemplate] {
        &self.pad_templates
    }

    /// Instantiate the stage.
    pub fn instantiate(&self) -> Box<dyn Stage> {
        (self.factory)()
    }
}

impl fmt::Debug for StageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageTemplate")
            .field("name", &self.name)
            .field("pads", &self.pad_templates.len())
            .finish()
    }
}

/// An explicit collection of stage types.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    templates: HashMap<String, Arc<StageTemplate>>,
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage type. Replaces an earlier registration of the
    /// same name.
    pub fn register(&mut self, template: StageTemplate) {
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    /// Look a type up by name.
    pub fn get(&self, name: &str) -> Option<&Arc<StageTemplate>> {
        self.templates.get(name)
    }

    /// Instantiate a registered type.
    pub fn create(&self, name: &str) -> Option<Box<dyn Stage>> {
        self.templates.get(name).map(|t| t.instantiate())
    }

    /// The registered type names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}
