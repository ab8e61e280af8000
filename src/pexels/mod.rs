//! Pexels downloader engine
//! Concurrent per-category downloads with cross-session de-duplication

pub mod category_worker;
pub mod config_loader;
pub mod coordinator;
pub mod dedup_store;
pub mod events;
pub mod logger;
pub mod search_api;
pub mod tui;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigError, ConfigManager, ConfigResult, init_config};

pub use logger::{Logger, LoggerError, LoggerResult};

pub use search_api::{
    ApiError, ApiResult, PexelsClient, Photo, PhotoSource, Quality, SearchPage,
    extension_from_url,
};

pub use dedup_store::{Claim, DedupError, DedupResult, DedupStore, ImageRecord};

pub use events::{EndReason, EventReceiver, EventSender, SessionEvent, StatusLevel, event_channel};

pub use category_worker::{
    CancelToken, CategoryReport, CategoryStatus, CategoryTask, CategoryWorker, ProgressObserver,
    WorkerError, WorkerResult, WorkerSettings,
};

pub use coordinator::{
    CoordinatorError, CoordinatorResult, DownloadCoordinator, DownloadRequest, RequestLimits,
    SessionHandle, SessionSummary, ValidationError, parse_categories, parse_count,
};
