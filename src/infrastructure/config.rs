//! Configuration infrastructure
//!
//! Configuration is organized into three sections:
//! 1. `crawl`: query, concurrency and timing of one crawl run
//! 2. `persistence`: flush interval and sink destinations
//! 3. `logging`: subscriber setup
//!
//! Every section is `#[serde(default)]`, so a partial file loads with the
//! missing fields taken from `defaults`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::crawling::endpoints::SiteEndpoints;
use crate::crawling::orchestrator::CrawlOptions;
use crate::crawling::producer::ProducerOptions;
use crate::crawling::workers::{DrainPolicy, WorkerOptions};
use crate::domain::{SearchQuery, SortDirection, SortSpec};
use crate::infrastructure::fetcher::FetcherConfig;
use crate::infrastructure::persistence::{FanoutSink, JsonFileSink, PersistenceSink, SqliteSink};

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crawl: CrawlConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// Query and runtime parameters of a crawl run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Site root, e.g. `https://barbechli.tn`
    pub base_url: String,

    pub free_text: String,
    pub category: String,
    pub subcategories: Vec<String>,
    pub sources: Vec<String>,
    pub sort_kind: String,
    pub sort_direction: SortDirection,

    /// Listing rows per page; a shorter page ends the crawl
    pub page_size: u32,

    pub worker_count: usize,
    pub start_page: u32,

    /// Stop after this many listing pages
    pub max_pages: Option<u32>,

    /// Budget for one listing or detail fetch
    pub fetch_timeout_ms: u64,

    /// Attempts per listing page, including the first
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,

    /// How long an idle worker waits on the frontier before re-checking
    pub poll_interval_ms: u64,

    pub queue_capacity: usize,
    pub max_open_contexts: Option<usize>,
    pub max_navigations_per_second: Option<u32>,
    pub drain_policy: DrainPolicy,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            free_text: String::new(),
            category: String::new(),
            subcategories: Vec::new(),
            sources: Vec::new(),
            sort_kind: defaults::SORT_KIND.to_string(),
            sort_direction: SortDirection::Desc,
            page_size: defaults::PAGE_SIZE,
            worker_count: defaults::WORKER_COUNT,
            start_page: defaults::START_PAGE,
            max_pages: None,
            fetch_timeout_ms: defaults::FETCH_TIMEOUT_MS,
            max_attempts: defaults::MAX_ATTEMPTS,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            max_open_contexts: None,
            max_navigations_per_second: None,
            drain_policy: DrainPolicy::Drain,
        }
    }
}

impl CrawlConfig {
    #[must_use]
    pub fn to_search_query(&self) -> SearchQuery {
        SearchQuery {
            free_text: self.free_text.clone(),
            category: self.category.clone(),
            subcategories: self.subcategories.clone(),
            sources: self.sources.clone(),
            sort: SortSpec {
                kind: self.sort_kind.clone(),
                direction: self.sort_direction,
            },
            page_size: self.page_size.max(1),
        }
    }

    #[must_use]
    pub fn to_crawl_options(&self, persistence: &PersistenceConfig) -> CrawlOptions {
        let fetch_timeout = Duration::from_millis(self.fetch_timeout_ms);
        CrawlOptions {
            producer: ProducerOptions {
                fetch_timeout,
                max_attempts: self.max_attempts,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
                max_pages: self.max_pages,
            },
            workers: WorkerOptions {
                worker_count: self.worker_count,
                fetch_timeout,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                drain_policy: self.drain_policy,
            },
            fetcher: FetcherConfig {
                max_open_contexts: self.max_open_contexts,
                max_navigations_per_second: self.max_navigations_per_second,
            },
            queue_capacity: self.queue_capacity,
            flush_interval: Duration::from_millis(persistence.flush_interval_ms),
            start_page: self.start_page,
        }
    }

    pub fn endpoints(&self) -> Result<SiteEndpoints> {
        SiteEndpoints::new(&self.base_url).with_context(|| format!("Invalid base_url: {}", self.base_url))
    }
}

/// Where and how often the catalog is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub flush_interval_ms: u64,

    /// Catalog JSON file; `None` disables the JSON sink
    pub json_output_path: Option<PathBuf>,

    /// e.g. `sqlite://catalog.db`; `None` disables the SQLite sink
    pub sqlite_url: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: defaults::FLUSH_INTERVAL_MS,
            json_output_path: Some(PathBuf::from(defaults::JSON_OUTPUT_FILE)),
            sqlite_url: None,
        }
    }
}

impl PersistenceConfig {
    /// Builds the configured sinks, fanning out when both are set.
    /// Returns `None` when persistence is disabled entirely.
    pub async fn build_sink(&self) -> Result<Option<Arc<dyn PersistenceSink>>> {
        let mut sinks: Vec<Arc<dyn PersistenceSink>> = Vec::new();

        if let Some(path) = &self.json_output_path {
            sinks.push(Arc::new(JsonFileSink::new(path)));
        }
        if let Some(url) = &self.sqlite_url {
            let sink = SqliteSink::connect(url)
                .await
                .with_context(|| format!("Failed to open SQLite sink at {url}"))?;
            sinks.push(Arc::new(sink));
        }

        let names: Vec<&str> = sinks.iter().map(|sink| sink.name()).collect();
        info!(sinks = ?names, "💾 Persistence sinks configured");

        Ok(match sinks.len() {
            0 => None,
            1 => sinks.pop(),
            _ => Some(Arc::new(FanoutSink::new(sinks))),
        })
    }
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,

    /// Defaults to `logs/` next to the working directory
    pub log_directory: Option<PathBuf>,
    pub file_name: String,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,
    pub auto_cleanup_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_directory: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: true,
        }
    }
}

/// Loads and saves `AppConfig` as pretty JSON
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Manager for the default config file under the user config directory
    pub fn new() -> Result<Self> {
        Ok(Self::with_path(Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME)))
    }

    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file, creating default if it doesn't exist.
    ///
    /// A file that cannot be parsed is copied to `*.json.corrupted` and
    /// replaced by the defaults.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file could not be parsed: {}", parse_error);
                warn!("⚠️  Resetting to default configuration");

                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                let default_config = AppConfig::default();
                self.save_config(&default_config)
                    .await
                    .context("Failed to save default configuration")?;
                info!("✅ Reset to default configuration");
                Ok(default_config)
            }
        }
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    pub async fn update_config<F>(&self, updater: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.load_config().await?;
        updater(&mut config);
        self.save_config(&config).await?;
        Ok(config)
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "pricewatch-crawler";
    pub const CONFIG_FILE_NAME: &str = "pricewatch_config.json";

    pub const BASE_URL: &str = crate::crawling::endpoints::DEFAULT_BASE_URL;
    pub const SORT_KIND: &str = "popularity";
    pub const PAGE_SIZE: u32 = crate::domain::query::DEFAULT_PAGE_SIZE;
    pub const WORKER_COUNT: usize = 5;
    pub const START_PAGE: u32 = 1;

    pub const FETCH_TIMEOUT_MS: u64 = 30_000;
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF_MS: u64 = 2_000;
    pub const POLL_INTERVAL_MS: u64 = 1_000;
    pub const QUEUE_CAPACITY: usize = crate::crawling::frontier::DEFAULT_FRONTIER_CAPACITY;

    pub const FLUSH_INTERVAL_MS: u64 = 2_000;
    pub const JSON_OUTPUT_FILE: &str = "catalog.json";

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "pricewatch.log";
    pub const LOG_MAX_FILES: u32 = 5;
}
