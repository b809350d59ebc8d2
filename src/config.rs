use crate::document::StoreError;
use crate::storage::LocalDocumentStore;
use std::{env, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_PATH: &str = "data/sales-data.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Documents persisted to a JSON file.
    File(PathBuf),
    /// Documents kept in process memory.
    Memory,
    /// No document store; counters run in degraded mode.
    Disabled,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("APP_STORE must be 'file', 'memory' or 'none', got '{0}'")]
    UnknownStore(String),

    #[error("failed to open document store: {0}")]
    Connect(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub backend: Backend,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = lookup("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let store = lookup("APP_STORE").unwrap_or_else(|| "file".to_string());
        let backend = match store.trim() {
            "file" => Backend::File(
                lookup("APP_DATA_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH)),
            ),
            "memory" => Backend::Memory,
            "none" => Backend::Disabled,
            other => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        Ok(Self { port, backend })
    }

    /// Builds the document store client, `None` in degraded mode.
    pub async fn connect(&self) -> Result<Option<Arc<LocalDocumentStore>>, ConfigError> {
        let store = match &self.backend {
            Backend::File(path) => LocalDocumentStore::open(path.clone()).await?,
            Backend::Memory => {
                info!("using in-memory document store");
                LocalDocumentStore::in_memory()
            }
            Backend::Disabled => return Ok(None),
        };
        Ok(Some(Arc::new(store)))
    }
}
