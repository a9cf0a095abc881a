//! Viewer configuration.
//!
//! Sources, later overriding earlier: built-in defaults, `group-viewer.toml`
//! in the working directory, then `VIEWER_*` environment variables.

use crate::assets::RetrievalMode;
use crate::error::ViewerResult;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"
api_base = "http://localhost:3000/api"
push_url = "ws://localhost:3000/attachments"
retrieval_mode = "direct"
image_duration_ms = 5000
cache_dir = "./cache"
cache_enabled = true
cache_memory_entries = 8
cache_memory_bytes = 67108864
reconnect_base_delay_ms = 1000
reconnect_max_attempts = 5
headless_clip_ms = 10000
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    /// REST base, without trailing slash.
    pub api_base: String,
    /// Push channel endpoint (namespace included).
    pub push_url: String,
    #[serde(default)]
    pub group_key: Option<String>,
    pub retrieval_mode: RetrievalMode,
    pub image_duration_ms: u64,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub cache_memory_entries: usize,
    /// Byte cap for the in-memory front; larger blobs are read from disk.
    pub cache_memory_bytes: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Skip an unplayable item after this long. Unset means the item stalls.
    #[serde(default)]
    pub unplayable_skip_ms: Option<u64>,
    pub headless_clip_ms: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl ViewerConfig {
    /// Load defaults, the optional local file and the environment.
    pub fn load() -> ViewerResult<Self> {
        let builder = defaults()
            .add_source(File::with_name("group-viewer").required(false))
            .add_source(environment());
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load defaults overridden by a single TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ViewerResult<Self> {
        let builder =
            defaults().add_source(File::from(path.as_ref()).format(FileFormat::Toml));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn image_duration(&self) -> Duration {
        Duration::from_millis(self.image_duration_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn unplayable_skip(&self) -> Option<Duration> {
        self.unplayable_skip_ms.map(Duration::from_millis)
    }

    pub fn headless_clip(&self) -> Duration {
        Duration::from_millis(self.headless_clip_ms)
    }
}

fn defaults() -> ConfigBuilder<DefaultState> {
    Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
}

fn environment() -> Environment {
    Environment::with_prefix("VIEWER").try_parsing(true)
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000/api".into(),
            push_url: "ws://localhost:3000/attachments".into(),
            group_key: None,
            retrieval_mode: RetrievalMode::Direct,
            image_duration_ms: 5000,
            cache_dir: PathBuf::from("./cache"),
            cache_enabled: true,
            cache_memory_entries: 8,
            cache_memory_bytes: crate::cache::DEFAULT_MEMORY_BUDGET,
            reconnect_base_delay_ms: 1000,
            reconnect_max_attempts: 5,
            unplayable_skip_ms: None,
            headless_clip_ms: 10_000,
            auth_token: None,
        }
    }
}
