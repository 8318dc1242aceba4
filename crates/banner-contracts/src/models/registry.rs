use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// What a model call is used for. Stages and generators declare the
/// capability they need; the registry resolves it to a concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    CodeGeneration,
    ImageGeneration,
    VisionScoring,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::CodeGeneration => "code_generation",
            Self::ImageGeneration => "image_generation",
            Self::VisionScoring => "vision_scoring",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    /// Restricts the registry to one provider, keeping insertion order.
    pub fn for_provider(&self, provider: &str) -> Self {
        Self {
            models: self
                .models
                .iter()
                .filter(|(_, model)| model.provider == provider)
                .map(|(name, model)| (name.clone(), model.clone()))
                .collect(),
        }
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    use Capability::{CodeGeneration, ImageGeneration, TextGeneration, VisionScoring};

    let mut map = IndexMap::new();
    let mut insert =
        |name: &str, provider: &str, capabilities: &[Capability], context_window: Option<u64>| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities.to_vec(),
                    context_window,
                },
            );
        };

    insert("qwen-max", "dashscope", &[TextGeneration, CodeGeneration], Some(32768));
    insert("qwen-plus", "dashscope", &[TextGeneration, CodeGeneration], Some(131072));
    insert("qwen-vl-max", "dashscope", &[VisionScoring], Some(32768));
    insert(
        "gpt-4o-mini",
        "openai",
        &[TextGeneration, CodeGeneration, VisionScoring],
        Some(128000),
    );
    insert("gpt-4o", "openai", &[TextGeneration, CodeGeneration, VisionScoring], Some(128000));
    insert("pollinations-flux", "pollinations", &[ImageGeneration], None);
    insert("dryrun-text-1", "dryrun", &[TextGeneration, CodeGeneration], Some(8192));
    insert("dryrun-vision-1", "dryrun", &[VisionScoring], Some(8192));
    insert("dryrun-image-1", "dryrun", &[ImageGeneration], None);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_filters_by_capability_in_order() {
        let registry = ModelRegistry::default();
        let vision: Vec<String> = registry
            .by_capability(Capability::VisionScoring)
            .into_iter()
            .map(|model| model.name)
            .collect();
        assert_eq!(vision.first().map(String::as_str), Some("qwen-vl-max"));
        assert!(vision.contains(&"dryrun-vision-1".to_string()));
        assert!(registry.ensure("qwen-max", Capability::VisionScoring).is_none());
        assert!(registry.ensure("qwen-max", Capability::CodeGeneration).is_some());
    }

    #[test]
    fn provider_view_keeps_only_that_provider() {
        let dryrun = ModelRegistry::default().for_provider("dryrun");
        assert!(dryrun.list().all(|model| model.provider == "dryrun"));
        assert_eq!(dryrun.list().count(), 3);
    }
}
