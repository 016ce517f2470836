use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

/// Hardware-class buckets grouping the models suitable for a deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    TS,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTier {
    Minimal,
    Balanced,
    Full,
    Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Code,
    Chat,
    Reasoning,
    Moe,
    Embed,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ModelHandle {
    pub id: String,
    pub tier: ModelTier,
    pub family: String,
    pub capabilities: Vec<Capability>,
    pub context_len: u32,
    pub loaded: bool,
}

/// Static tier → ordered model list catalog. The first entry of a tier is
/// its primary model.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelHandle>,
}

const TIER_MODELS: &[(ModelTier, &[&str])] = &[
    (
        ModelTier::Minimal,
        &["qwen2.5-coder:7b", "glm4:9b", "phi3:3.8b"],
    ),
    (
        ModelTier::Balanced,
        &[
            "qwen2.5-coder:14b",
            "qwen2.5-coder:7b",
            "glm4:9b",
            "codellama:13b",
            "mistral:7b",
            "phi3:14b",
        ],
    ),
    (
        ModelTier::Full,
        &[
            "qwen2.5-coder:32b",
            "deepseek-r1:32b-q4",
            "qwen2.5-coder:14b",
            "glm4:9b",
            "codellama:34b",
            "mixtral:8x7b",
            "starcoder2:15b",
        ],
    ),
    (
        ModelTier::Ultra,
        &[
            "qwen3:235b-q4",
            "deepseek-r1:70b-q4",
            "qwen2.5-coder:32b",
            "glm4:9b",
            "llama3.1:70b",
            "mixtral:8x22b",
            "deepseek-coder:33b",
        ],
    ),
];

pub fn family_of(model_id: &str) -> &str {
    model_id.split(':').next().unwrap_or(model_id)
}

fn capabilities_of(family: &str) -> Vec<Capability> {
    let mut caps = Vec::new();
    if matches!(
        family,
        "qwen2.5-coder" | "codellama" | "deepseek-coder" | "starcoder2"
    ) {
        caps.push(Capability::Code);
    }
    if matches!(family, "glm4" | "mistral" | "llama3.1" | "qwen3" | "phi3") {
        caps.push(Capability::Chat);
    }
    if matches!(family, "deepseek-r1" | "qwen3") {
        caps.push(Capability::Reasoning);
    }
    if family == "mixtral" {
        caps.push(Capability::Moe);
    }
    caps
}

fn context_len_of(family: &str) -> u32 {
    match family {
        "qwen2.5-coder" | "starcoder2" | "mixtral" => 32_768,
        "deepseek-r1" => 65_536,
        "llama3.1" => 131_072,
        "qwen3" => 131_072,
        _ => 8_192,
    }
}

impl ModelCatalog {
    /// The built-in tiered catalog; models start out marked loaded and can
    /// be reconciled against the backend's tag listing.
    pub fn builtin() -> Self {
        let mut models = Vec::new();
        for (tier, ids) in TIER_MODELS {
            for id in *ids {
                let family = family_of(id).to_string();
                models.push(ModelHandle {
                    id: (*id).to_string(),
                    tier: *tier,
                    capabilities: capabilities_of(&family),
                    context_len: context_len_of(&family),
                    family,
                    loaded: true,
                });
            }
        }
        Self { models }
    }

    pub fn models(&self, tier: ModelTier) -> Vec<ModelHandle> {
        self.models
            .iter()
            .filter(|m| m.tier == tier)
            .cloned()
            .collect()
    }

    pub fn primary(&self, tier: ModelTier) -> Option<ModelHandle> {
        self.models.iter().find(|m| m.tier == tier).cloned()
    }

    pub fn find(&self, tier: ModelTier, id: &str) -> Option<ModelHandle> {
        self.models
            .iter()
            .find(|m| m.tier == tier && m.id == id)
            .cloned()
    }

    /// Next entry of the tier after `after`, in catalog order.
    pub fn next_in_tier(&self, tier: ModelTier, after: &str) -> Option<ModelHandle> {
        let mut seen = false;
        for model in self.models.iter().filter(|m| m.tier == tier) {
            if seen {
                return Some(model.clone());
            }
            if model.id == after {
                seen = true;
            }
        }
        None
    }

    /// Next entry of the tier sharing `after`'s family.
    pub fn next_same_family(&self, tier: ModelTier, after: &str) -> Option<ModelHandle> {
        let family = family_of(after);
        let mut seen = false;
        for model in self.models.iter().filter(|m| m.tier == tier) {
            if seen && model.family == family {
                return Some(model.clone());
            }
            if model.id == after {
                seen = true;
            }
        }
        None
    }

    pub fn first_loaded_with(&self, tier: ModelTier, capability: Capability) -> Option<ModelHandle> {
        self.models
            .iter()
            .find(|m| m.tier == tier && m.loaded && m.capabilities.contains(&capability))
            .cloned()
    }

    /// Moves `id` to the front of its tier, making it the primary. Used to
    /// honor an operator-configured primary model.
    pub fn promote(&mut self, tier: ModelTier, id: &str) {
        let Some(pos) = self
            .models
            .iter()
            .position(|m| m.tier == tier && m.id == id)
        else {
            tracing::warn!(%tier, id, "cannot promote unknown model");
            return;
        };
        let model = self.models.remove(pos);
        let first = self
            .models
            .iter()
            .position(|m| m.tier == tier)
            .unwrap_or(self.models.len());
        self.models.insert(first, model);
    }

    /// Reconciles `loaded` flags against the backend's tag listing.
    pub fn mark_loaded_from(&mut self, available: &[String]) {
        for model in &mut self.models {
            model.loaded = available.iter().any(|tag| tag == &model.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primaries_follow_catalog_order() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog.primary(ModelTier::Balanced).unwrap().id,
            "qwen2.5-coder:14b"
        );
        assert_eq!(
            catalog.primary(ModelTier::Ultra).unwrap().id,
            "qwen3:235b-q4"
        );
    }

    #[test]
    fn next_in_tier_walks_forward_once() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog
                .next_in_tier(ModelTier::Balanced, "qwen2.5-coder:14b")
                .unwrap()
                .id,
            "qwen2.5-coder:7b"
        );
        assert!(catalog.next_in_tier(ModelTier::Balanced, "phi3:14b").is_none());
    }

    #[test]
    fn same_family_fallback_skips_other_families() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog
                .next_same_family(ModelTier::Full, "qwen2.5-coder:32b")
                .unwrap()
                .id,
            "qwen2.5-coder:14b"
        );
        assert!(
            catalog
                .next_same_family(ModelTier::Minimal, "phi3:3.8b")
                .is_none()
        );
    }

    #[test]
    fn capability_routing_prefers_earliest_loaded() {
        let mut catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog
                .first_loaded_with(ModelTier::Full, Capability::Reasoning)
                .unwrap()
                .id,
            "deepseek-r1:32b-q4"
        );

        catalog.mark_loaded_from(&["glm4:9b".to_string()]);
        assert!(
            catalog
                .first_loaded_with(ModelTier::Full, Capability::Reasoning)
                .is_none()
        );
        assert_eq!(
            catalog
                .first_loaded_with(ModelTier::Full, Capability::Chat)
                .unwrap()
                .id,
            "glm4:9b"
        );
    }

    #[test]
    fn tier_parses_case_insensitively() {
        use std::str::FromStr;
        assert_eq!(ModelTier::from_str("BALANCED").unwrap(), ModelTier::Balanced);
        assert_eq!(ModelTier::from_str("minimal").unwrap(), ModelTier::Minimal);
    }
}
