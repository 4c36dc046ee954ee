//! Infrastructure layer: rendering engine seam, the response-correlated
//! fetcher, persistence sinks, configuration and logging.

pub mod config;
pub mod fetcher;
pub mod logging;
pub mod persistence;
pub mod render;
pub mod scripted_engine;

pub use config::{AppConfig, ConfigManager, CrawlConfig, LoggingConfig, PersistenceConfig};
pub use fetcher::{FetchError, FetcherConfig, ResponseCorrelatedFetcher, ResponseMatcher};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use persistence::{FanoutSink, JsonFileSink, PersistenceSink, SinkError, SqliteSink};
pub use render::{ObservedResponse, RenderContext, RenderEngine, RenderError};
pub use scripted_engine::{ScriptedNavigation, ScriptedRenderEngine};
