//! Registry of pipeline definitions.

use super::{PipelineDefinition, PipelineGraph};
use crate::errors::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The set of pipelines known to a controller.
///
/// Every registered definition has already passed graph validation, so a
/// lookup never yields a pipeline that cannot be built.
#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pipelines: BTreeMap<String, Arc<PipelineDefinition>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<PipelineDefinition>),
    Wrapped { pipelines: Vec<PipelineDefinition> },
}

impl PipelineCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a pipeline, replacing one with the same name.
    ///
    /// # Errors
    ///
    /// Returns the graph validation error when the definition is invalid.
    pub fn register(&mut self, definition: PipelineDefinition) -> Result<(), ConfigError> {
        PipelineGraph::build(&definition)?;
        self.pipelines
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns the graph validation error when the definition is invalid.
    pub fn with_pipeline(mut self, definition: PipelineDefinition) -> Result<Self, ConfigError> {
        self.register(definition)?;
        Ok(self)
    }

    /// Loads a catalog from JSON: either a list of definitions or an object
    /// with a `pipelines` list.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an invalid pipeline.
    pub fn from_json(json: &str) -> crate::errors::Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        let definitions = match document {
            CatalogDocument::List(list) | CatalogDocument::Wrapped { pipelines: list } => list,
        };
        let mut catalog = Self::new();
        for definition in definitions {
            catalog.register(definition)?;
        }
        Ok(catalog)
    }

    /// Looks up a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPipeline`] if the name is not registered.
    pub fn get(&self, name: &str) -> Result<Arc<PipelineDefinition>, ConfigError> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPipeline {
                name: name.to_string(),
            })
    }

    /// Builds the dependency graph of a registered pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPipeline`] if the name is not registered.
    pub fn graph(&self, name: &str) -> Result<PipelineGraph, ConfigError> {
        let definition = self.get(name)?;
        PipelineGraph::build(&definition)
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    /// Registered pipeline names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Registered definitions, sorted by name.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> + '_ {
        self.pipelines.values()
    }

    /// Number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepSpec;

    #[test]
    fn test_register_and_lookup() {
        let catalog = PipelineCatalog::new()
            .with_pipeline(PipelineDefinition::new("deploy").step(StepSpec::new("build", "ci.build")))
            .unwrap();

        assert!(catalog.contains("deploy"));
        assert_eq!(catalog.names(), vec!["deploy".to_string()]);
        assert_eq!(catalog.get("deploy").unwrap().steps.len(), 1);
        assert_eq!(catalog.graph("deploy").unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_pipeline() {
        let catalog = PipelineCatalog::new();
        let err = catalog.get("ghost").unwrap_err();
        assert_eq!(err.code(), "CONFIG-UNKNOWN-PIPELINE");
    }

    #[test]
    fn test_invalid_pipeline_is_not_registered() {
        let mut catalog = PipelineCatalog::new();
        let bad = PipelineDefinition::new("bad")
            .step(StepSpec::new("a", "t").depends_on(&["b"]))
            .step(StepSpec::new("b", "t").depends_on(&["a"]));

        assert!(catalog.register(bad).is_err());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_from_json_both_shapes() {
        let list = r#"[{"name": "a", "steps": [{"name": "s", "task": "t"}]}]"#;
        let wrapped = r#"{"pipelines": [{"name": "b", "steps": [{"name": "s", "task": "t"}]}]}"#;

        assert!(PipelineCatalog::from_json(list).unwrap().contains("a"));
        assert!(PipelineCatalog::from_json(wrapped).unwrap().contains("b"));
        assert!(PipelineCatalog::from_json("{").is_err());
    }
}
