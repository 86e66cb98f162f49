use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct NexusConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub insights: InsightConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/nexus.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Reasoning engine endpoint. Opaque to the pipeline beyond these fields.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    /// Model used for document extraction (must accept image parts).
    pub vision_model: String,
    /// Model used for insights and conversation.
    pub reasoning_model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "ARK_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_request_timeout_secs() -> u64 {
    180
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Upper bound on a single base64-encoded image payload.
    pub max_image_bytes: usize,
    pub max_text_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 4 * 1024 * 1024,
            max_text_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Every extraction appends its records as-is.
    #[default]
    Append,
    /// Skip records whose kind+timestamp+label already exist in the session.
    Dedupe,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimelineConfig {
    pub label_max_chars: usize,
    pub merge_policy: MergePolicy,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            label_max_chars: 50,
            merge_policy: MergePolicy::Append,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InsightConfig {
    /// Regenerate insights automatically after every record mutation.
    pub auto_refresh: bool,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self { auto_refresh: true }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SessionConfig {
    /// Assistant turn seeded into every fresh conversation. Empty disables it.
    #[serde(default)]
    pub greeting: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl NexusConfig {
    /// Load `path` (TOML), then apply `NEXUS__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("NEXUS").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// API key from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.engine.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}
