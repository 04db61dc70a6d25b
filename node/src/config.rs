use crate::messaging::{PipelineConfig, DEFAULT_PAGE_SIZE};
use anyhow::Context;
use deskchat_messaging::ValidationOptions;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

/// Runtime configuration for the node service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub build_id: String,
    pub storage_path: PathBuf,
    pub workspace_id: String,
    pub page_size: usize,
    pub encryption_enabled: bool,
    pub max_message_length: usize,
    pub block_words: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            build_id: Uuid::new_v4().to_string(),
            storage_path: PathBuf::from("data/deskchat"),
            workspace_id: "default".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            encryption_enabled: true,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            block_words: Vec::new(),
        }
    }
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        _ => Ok(default),
    }
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .map(str::to_owned)
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let build_id = env::var("DESKCHAT_BUILD_ID").unwrap_or(defaults.build_id);
        let storage_path = env::var_os("DESKCHAT_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_path);
        let workspace_id = env::var("DESKCHAT_WORKSPACE_ID").unwrap_or(defaults.workspace_id);
        let block_words = env::var("DESKCHAT_BLOCK_WORDS")
            .map(|raw| split_words(&raw))
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            build_id,
            storage_path,
            workspace_id,
            page_size: parsed("DESKCHAT_PAGE_SIZE", defaults.page_size)?,
            encryption_enabled: parsed("DESKCHAT_ENCRYPTION", defaults.encryption_enabled)?,
            max_message_length: parsed(
                "DESKCHAT_MAX_MESSAGE_LENGTH",
                defaults.max_message_length,
            )?,
            block_words,
        })
    }

    /// Orchestrator settings derived from this configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            page_size: self.page_size,
            validation: ValidationOptions {
                max_length: self.max_message_length,
                block_words: self.block_words.clone(),
                ..ValidationOptions::default()
            },
            encryption_enabled: self.encryption_enabled,
            ..PipelineConfig::default()
        }
    }
}
