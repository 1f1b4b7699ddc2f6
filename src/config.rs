pub mod channel;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub use channel::ChannelDefinition;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub journal: JournalSettings,
    #[serde(default)]
    pub channel_definition_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalSettings {
    #[serde(default = "default_journal_dir")]
    pub dir: String,
    #[serde(default)]
    pub queue_poll_interval_millis: Option<u64>,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dir: default_journal_dir(),
            queue_poll_interval_millis: None,
        }
    }
}

impl JournalSettings {
    /// Journal file backing one destination's durable queue.
    pub fn queue_path(&self, channel: &str, destination: &str) -> PathBuf {
        PathBuf::from(&self.dir)
            .join(channel)
            .join(format!("{destination}.queue"))
    }

    pub fn queue_poll_interval(&self) -> Duration {
        self.queue_poll_interval_millis
            .map(Duration::from_millis)
            .unwrap_or(crate::channel::DEFAULT_QUEUE_POLL_INTERVAL)
    }
}

fn default_journal_dir() -> String {
    "data/journal".to_string()
}

impl EngineSettings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("COURIER").separator("__"))
            .build()?
            .try_deserialize()
    }
}
