use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use deeplist_llm::{
    Model, OPENROUTER_DEFAULT_MODEL, OPENROUTER_ENDPOINT, OPENROUTER_PROVIDER_ID, ProviderConfig,
};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::context::UserIdentity;
use super::quota::QuotaSettings;
use super::upload::{DirectoryUploader, UploadSettings};

pub const DEFAULT_PROVIDER_ID: &str = OPENROUTER_PROVIDER_ID;
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 10_000;
pub const SETTINGS_DIRECTORY_NAME: &str = "deeplist";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "deeplist.sqlite3";
pub const ENV_PREFIX: &str = "DEEPLIST_";
pub const DEFAULT_USER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model_name: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: OPENROUTER_DEFAULT_MODEL.to_string(),
            max_tokens: None,
        }
    }
}

impl ModelSettings {
    pub fn to_model(&self) -> Model {
        let model = Model::from_id(self.model_name.clone());
        match self.max_tokens {
            Some(limit) => model.with_description(format!("up to {limit} tokens per reply")),
            None => model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Blank uses the provider's own endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSettings>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            models: default_models(),
        }
    }
}

impl ProviderSettings {
    /// None until an API key is set.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        (!self.api_key.trim().is_empty())
            .then(|| ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint))
    }

    pub fn configured_models(&self) -> Vec<Model> {
        self.models.iter().map(ModelSettings::to_model).collect()
    }

    /// Per-model completion limits keyed by model id.
    pub fn model_max_tokens(&self) -> HashMap<String, u64> {
        self.models
            .iter()
            .filter_map(|model| Some((model.model_name.clone(), model.max_tokens?)))
            .collect()
    }

    /// Trims every field, drops unnamed models and keeps at least one model.
    pub fn normalized(self) -> Self {
        let provider_id = match self.provider_id.trim() {
            "" => default_provider_id(),
            provider_id => provider_id.to_string(),
        };
        let mut models = self
            .models
            .into_iter()
            .filter_map(|model| {
                let model_name = model.model_name.trim().to_string();
                (!model_name.is_empty()).then_some(ModelSettings {
                    model_name,
                    ..model
                })
            })
            .collect::<Vec<_>>();
        if models.is_empty() {
            models = default_models();
        }

        Self {
            provider_id,
            api_key: self.api_key.trim().to_string(),
            endpoint: self.endpoint.trim().to_string(),
            models,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Falls back to the first configured provider model.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub enable_search: bool,
    #[serde(default)]
    pub custom_system_prompt: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            default_model: None,
            enable_search: false,
            custom_system_prompt: None,
        }
    }
}

impl ChatSettings {
    fn normalized(mut self) -> Self {
        if self.max_message_length == 0 {
            self.max_message_length = DEFAULT_MAX_MESSAGE_LENGTH;
        }
        self.default_model = self
            .default_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self.custom_system_prompt = self
            .custom_system_prompt
            .filter(|prompt| !prompt.trim().is_empty());
        self
    }
}

/// Who the terminal session sends as. A blank id means signed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default = "default_user_id")]
    pub id: String,
    #[serde(default = "default_authenticated")]
    pub authenticated: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            id: default_user_id(),
            authenticated: default_authenticated(),
        }
    }
}

impl UserSettings {
    pub fn identity(&self) -> Option<UserIdentity> {
        let id = self.id.trim();
        if id.is_empty() {
            return None;
        }
        Some(if self.authenticated {
            UserIdentity::authenticated(id)
        } else {
            UserIdentity::guest(id)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Defaults to the data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub uploads: UploadSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub user: UserSettings,
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();
        self.chat = self.chat.normalized();
        self.uploads = self.uploads.normalized();
        self
    }

    pub fn default_model(&self) -> String {
        self.chat
            .default_model
            .clone()
            .or_else(|| {
                self.provider
                    .models
                    .first()
                    .map(|model| model.model_name.clone())
            })
            .unwrap_or_else(|| OPENROUTER_DEFAULT_MODEL.to_string())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_data_dir().join(DATABASE_FILE_NAME))
    }

    pub fn upload_directory(&self) -> PathBuf {
        self.uploads
            .directory
            .clone()
            .unwrap_or_else(DirectoryUploader::default_root)
    }
}

/// Settings layered as defaults, then the JSON file, then `DEEPLIST_` variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
    env: Env,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".deeplist"))
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".deeplist"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_env(config_path, Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub(crate) fn with_env(config_path: PathBuf, env: Env) -> Self {
        let settings = Self::load_layers(&config_path, env.clone());
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            env,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn file_layers(path: &Path) -> Figment {
        let defaults = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            defaults.merge(Json::file(path))
        } else {
            tracing::info!(?path, "settings file not found, using defaults");
            defaults
        }
    }

    fn load_layers(path: &Path, env: Env) -> AppSettings {
        Self::file_layers(path)
            .merge(env)
            .extract::<AppSettings>()
            .map(AppSettings::normalized)
            .unwrap_or_else(|error| {
                tracing::warn!(?path, %error, "failed to parse settings, using defaults");
                AppSettings::default()
            })
    }

    /// Writes `settings` with every environment-provided value put back to its file value.
    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let mut document = serde_json::to_value(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        let overrides = Figment::from(self.env.clone())
            .extract::<serde_json::Value>()
            .unwrap_or_default();
        if overrides.as_object().is_some_and(|keys| !keys.is_empty()) {
            let file_only = Self::file_layers(&self.config_path)
                .extract::<AppSettings>()
                .map(AppSettings::normalized)
                .unwrap_or_default();
            let file_only = serde_json::to_value(file_only).context(SerializeConfigSnafu {
                stage: "serialize-file-settings",
            })?;
            restore_overridden(&mut document, &overrides, &file_only);
        }

        let content = serde_json::to_string_pretty(&document).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;
        write_atomically(&self.config_path, content.as_bytes())?;
        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

fn restore_overridden(
    document: &mut serde_json::Value,
    overrides: &serde_json::Value,
    file_only: &serde_json::Value,
) {
    let (Some(document), Some(overrides)) = (document.as_object_mut(), overrides.as_object())
    else {
        return;
    };

    for (key, overridden) in overrides {
        let original = file_only.get(key);
        if let Some(current) = document.get_mut(key) {
            if overridden.is_object() && current.is_object() {
                let fallback = original.cloned().unwrap_or_default();
                restore_overridden(current, overridden, &fallback);
                continue;
            }
            if let Some(original) = original {
                *current = original.clone();
                continue;
            }
        }
        document.remove(key);
    }
}

/// Writes `<path>.tmp` next to `path` and renames it over `path`.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent,
        })?;
    }

    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, content).context(WriteFileSnafu {
        stage: "write-staged-settings",
        path: &staging,
    })?;
    std::fs::rename(&staging, path).context(RenameTempFileSnafu {
        stage: "replace-settings-file",
        from: &staging,
        to: path,
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    OPENROUTER_ENDPOINT.to_string()
}

fn default_models() -> Vec<ModelSettings> {
    vec![ModelSettings::default()]
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

fn default_authenticated() -> bool {
    true
}
