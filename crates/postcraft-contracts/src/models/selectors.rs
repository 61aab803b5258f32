use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    /// Set whenever the chosen model is not the one asked for.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let candidates = self.registry.by_capability(capability);
        Self::choose(candidates, requested, capability)
            .ok_or_else(|| format!("No models available for capability '{capability}'."))
    }

    /// Like [`ModelSelector::select`], restricted to models served by `provider`.
    pub fn select_for_provider(
        &self,
        requested: Option<&str>,
        capability: &str,
        provider: &str,
    ) -> Result<ModelSelection, String> {
        let candidates = self
            .registry
            .by_capability(capability)
            .into_iter()
            .filter(|model| model.provider == provider)
            .collect();
        Self::choose(candidates, requested, capability).ok_or_else(|| {
            format!("No models available for capability '{capability}' from provider '{provider}'.")
        })
    }

    /// The requested model when it is a candidate, else the first candidate.
    fn choose(
        candidates: Vec<ModelSpec>,
        requested: Option<&str>,
        capability: &str,
    ) -> Option<ModelSelection> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        if let Some(name) = requested {
            if let Some(model) = candidates.iter().find(|model| model.name == name) {
                return Some(ModelSelection {
                    model: model.clone(),
                    requested: Some(name.to_string()),
                    fallback_reason: None,
                });
            }
        }
        let model = candidates.into_iter().next()?;
        let fallback_reason = match requested {
            Some(name) => {
                format!("Requested model '{name}' unavailable for capability '{capability}'.")
            }
            None => "No model specified; using default.".to_string(),
        };
        Some(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::ModelSelector;
    use crate::models::{ModelRegistry, ModelSpec, CAPABILITY_IMAGE, CAPABILITY_VIDEO};

    fn only_text_models() -> ModelRegistry {
        let mut models = IndexMap::new();
        models.insert(
            "gemini-2.5-flash".to_string(),
            ModelSpec {
                name: "gemini-2.5-flash".to_string(),
                provider: "gemini".to_string(),
                capabilities: vec!["text".to_string()],
            },
        );
        ModelRegistry::new(Some(models))
    }

    #[test]
    fn exact_request_has_no_fallback_reason() -> Result<(), String> {
        let selection = ModelSelector::new(None).select_for_provider(
            Some("gemini-3-pro-image-preview"),
            CAPABILITY_IMAGE,
            "gemini",
        )?;
        assert_eq!(selection.model.name, "gemini-3-pro-image-preview");
        assert!(selection.fallback_reason.is_none());
        Ok(())
    }

    #[test]
    fn default_and_mismatched_requests_explain_the_fallback() -> Result<(), String> {
        let selector = ModelSelector::new(None);

        let default = selector.select_for_provider(None, CAPABILITY_VIDEO, "gemini")?;
        assert_eq!(default.model.name, "veo-3.1-fast-generate-preview");
        assert_eq!(
            default.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );

        let mismatched =
            selector.select_for_provider(Some("dryrun-image-1"), CAPABILITY_IMAGE, "gemini")?;
        assert_eq!(mismatched.model.provider, "gemini");
        assert_eq!(mismatched.requested.as_deref(), Some("dryrun-image-1"));
        assert_eq!(
            mismatched.fallback_reason.as_deref(),
            Some("Requested model 'dryrun-image-1' unavailable for capability 'image'.")
        );
        Ok(())
    }

    #[test]
    fn missing_capability_is_an_error() {
        let selector = ModelSelector::new(Some(only_text_models()));
        assert_eq!(
            selector.select(None, CAPABILITY_IMAGE).err().as_deref(),
            Some("No models available for capability 'image'.")
        );
        assert_eq!(
            selector
                .select_for_provider(None, "text", "dryrun")
                .err()
                .as_deref(),
            Some("No models available for capability 'text' from provider 'dryrun'.")
        );
    }
}
