use std::time::Duration;

use thiserror::Error;
use yadisk_core::{YadiskClient, YadiskError};

use crate::builder::BuilderConfig;
use crate::cache::CacheConfig;
use crate::transport::YadiskTransport;

const DEFAULT_PAGE_SIZE: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YADISK_TOKEN is not set")]
    MissingToken,
    #[error("invalid api configuration: {0}")]
    Client(#[from] YadiskError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub token: String,
    pub api_url: Option<String>,
    pub page_size: u32,
    pub cache: CacheConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`; zero or unparsable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("YADISK_TOKEN")
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        let api_url = lookup("YADISK_API_URL").filter(|url| !url.trim().is_empty());

        let defaults = CacheConfig::default();
        let builder = BuilderConfig {
            tick: Duration::from_millis(read_u64(
                &lookup,
                "YADISK_BUILDER_TICK_MS",
                defaults.builder.tick.as_millis() as u64,
            )),
            flush_every: read_u64(
                &lookup,
                "YADISK_BUILDER_FLUSH_EVERY",
                defaults.builder.flush_every as u64,
            ) as usize,
        };
        let cache = CacheConfig {
            ttl: Duration::from_secs(read_u64(
                &lookup,
                "YADISK_CACHE_TTL_SECS",
                defaults.ttl.as_secs(),
            )),
            max_entries: read_u64(
                &lookup,
                "YADISK_CACHE_MAX_ENTRIES",
                defaults.max_entries as u64,
            ) as usize,
            builder,
        };
        let page_size = read_u64(&lookup, "YADISK_PAGE_SIZE", DEFAULT_PAGE_SIZE)
            .min(u32::MAX as u64) as u32;

        Ok(Self {
            token,
            api_url,
            page_size,
            cache,
        })
    }

    pub fn client(&self) -> Result<YadiskClient, ConfigError> {
        let client = match self.api_url.as_deref() {
            Some(url) => YadiskClient::with_base_url(url, self.token.clone())?,
            None => YadiskClient::new(self.token.clone())?,
        };
        Ok(client)
    }

    pub fn transport(&self) -> Result<YadiskTransport, ConfigError> {
        Ok(YadiskTransport::new(self.client()?).with_page_size(self.page_size))
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
