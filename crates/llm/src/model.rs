use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";
pub const OPENROUTER_DEFAULT_MODEL: &str = "openai/gpt-4.1-nano";
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub context_length: Option<u64>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            context_length: None,
        }
    }

    /// A model whose display name is its id.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }
}

/// One entry of an OpenAI-compatible `/models` listing.
///
/// OpenRouter adds `name`, `description` and `context_length`; plain OpenAI
/// endpoints only send `id`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ModelListingEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context_length: Option<u64>,
}

impl ModelListingEntry {
    fn into_model(self) -> Option<Model> {
        let id = non_blank(Some(self.id))?;
        Some(Model {
            name: non_blank(self.name).unwrap_or_else(|| id.clone()),
            description: non_blank(self.description),
            context_length: self.context_length,
            id,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ModelListing {
    #[serde(default)]
    pub data: Vec<ModelListingEntry>,
}

impl ModelListing {
    /// Drops blank ids, dedupes and sorts by id.
    pub(crate) fn into_models(self) -> Vec<Model> {
        let mut models = self
            .data
            .into_iter()
            .filter_map(ModelListingEntry::into_model)
            .collect::<Vec<_>>();
        models.sort_by(|left, right| left.id.cmp(&right.id));
        models.dedup_by(|left, right| left.id == right.id);
        models
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Where a [`ModelCatalog`] came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    /// Why a fallback was served.
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<Model>) -> Self {
        Self::new(models, ModelCatalogSource::ProviderApi, None)
    }

    pub fn from_cache_fresh(models: Vec<Model>) -> Self {
        Self::new(models, ModelCatalogSource::CacheFresh, None)
    }

    pub fn from_cache_stale(models: Vec<Model>, warning: String) -> Self {
        Self::new(models, ModelCatalogSource::CacheStaleFallback, Some(warning))
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self::new(models, ModelCatalogSource::StaticFallback, Some(warning))
    }

    fn new(models: Vec<Model>, source: ModelCatalogSource, warning: Option<String>) -> Self {
        Self {
            models,
            source,
            warning,
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model.id == model_id)
    }
}

/// Result of looking a provider up in the [`ModelCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedModels {
    Fresh(Vec<Model>),
    Stale(Vec<Model>),
    Missing,
}

/// Per-provider model listings with a freshness window.
pub struct ModelCache {
    listings: RwLock<HashMap<String, (Instant, Vec<Model>)>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            listings: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn lookup(&self, provider_id: &str) -> CachedModels {
        match self.listings.read().await.get(provider_id) {
            Some((stored_at, models)) if stored_at.elapsed() < self.ttl => {
                CachedModels::Fresh(models.clone())
            }
            Some((_, models)) => CachedModels::Stale(models.clone()),
            None => CachedModels::Missing,
        }
    }

    pub async fn store(&self, provider_id: &str, models: Vec<Model>) {
        self.listings
            .write()
            .await
            .insert(provider_id.to_string(), (Instant::now(), models));
    }
}

/// Process-wide cache shared by every provider adapter.
pub fn shared_model_cache() -> Arc<ModelCache> {
    static CACHE: OnceLock<Arc<ModelCache>> = OnceLock::new();
    CACHE
        .get_or_init(|| Arc::new(ModelCache::new(MODEL_CACHE_TTL)))
        .clone()
}

pub fn default_models() -> Vec<Model> {
    [
        ("gpt-4.1-nano", "Fast, low-cost default"),
        ("gpt-4.1-mini", "Balanced cost and quality"),
        ("gpt-4o", "General-purpose flagship"),
        ("o4-mini", "Compact reasoning model"),
    ]
    .into_iter()
    .map(|(id, description)| Model::from_id(id).with_description(description))
    .collect()
}

/// [`default_models`] under OpenRouter's vendor-prefixed ids.
pub fn openrouter_default_models() -> Vec<Model> {
    default_models()
        .into_iter()
        .map(|model| {
            let id = format!("openai/{}", model.id);
            Model {
                name: id.clone(),
                id,
                ..model
            }
        })
        .collect()
}
