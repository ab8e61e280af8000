//! Category Worker
//!
//! Owns the fetch, paginate and download loop for one search keyword. Work inside a category is
//! strictly sequential: one search page, then each of its photos in API order, then the next page.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::pexels::{
    AppConfig, ApiError, Claim, DedupStore, EventSender, Photo, PhotoSource, Quality,
    extension_from_url,
};

/// Timestamp suffix of session folders.
const FOLDER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Error types for a single image download
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0}")]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Lifecycle of a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryStatus {
    Pending,
    Fetching,
    Downloading,
    Completed,
    Stopped,
    Failed,
}

impl fmt::Display for CategoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryStatus::Pending => write!(f, "pending"),
            CategoryStatus::Fetching => write!(f, "fetching"),
            CategoryStatus::Downloading => write!(f, "downloading"),
            CategoryStatus::Completed => write!(f, "completed"),
            CategoryStatus::Stopped => write!(f, "stopped"),
            CategoryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable state of one category, owned by its worker.
#[derive(Debug, Clone)]
pub struct CategoryTask {
    pub category: String,
    pub target: u32,
    pub quality: Quality,
    pub page: u32,
    pub downloaded: u32,
}

impl CategoryTask {
    pub fn new(category: impl Into<String>, target: u32, quality: Quality) -> Self {
        Self {
            category: category.into(),
            target,
            quality,
            page: 1,
            downloaded: 0,
        }
    }

    fn remaining(&self) -> u32 {
        self.target.saturating_sub(self.downloaded)
    }
}

/// What a worker hands back when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryReport {
    pub category: String,
    pub downloaded: u32,
    pub target: u32,
    pub status: CategoryStatus,
    pub folder: Option<PathBuf>,
}

impl CategoryReport {
    /// Report for a worker that died without returning one.
    pub fn failed(category: impl Into<String>, target: u32) -> Self {
        Self {
            category: category.into(),
            downloaded: 0,
            target,
            status: CategoryStatus::Failed,
            folder: None,
        }
    }
}

/// Tunables shared by every worker of a session.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub output_dir: PathBuf,
    /// Page-size ceiling of the search API.
    pub max_per_page: u32,
    pub rate_limit_backoff: Duration,
    /// Pause after every successful download.
    pub item_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            max_per_page: 80,
            rate_limit_backoff: Duration::from_secs(60),
            item_delay: Duration::from_millis(100),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.output_directory(),
            max_per_page: config.api.max_per_page.max(1),
            rate_limit_backoff: config.rate_limit_backoff(),
            item_delay: config.item_delay(),
        }
    }
}

/// Read side of a session's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set. Never resolves if the flag's owner is gone.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Receives per-category progress as downloads succeed.
pub trait ProgressObserver: Send + Sync {
    fn on_worker_progress(&self, category: &str, downloaded: u32, target: u32);
}

/// Folder-safe form of a category: spaces and path separators become underscores.
pub fn sanitize_category(category: &str) -> String {
    category
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// `{sanitized category}_{YYYY-MM-DD_HH-MM-SS}` under `output_dir`.
pub fn session_folder(output_dir: &Path, category: &str) -> PathBuf {
    let timestamp = Local::now().format(FOLDER_TIMESTAMP_FORMAT);
    output_dir.join(format!("{}_{}", sanitize_category(category), timestamp))
}

fn part_path(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{}.part", file_name))
}

pub struct CategoryWorker<S: PhotoSource> {
    task: CategoryTask,
    status: CategoryStatus,
    source: Arc<S>,
    dedup: Arc<DedupStore>,
    settings: Arc<WorkerSettings>,
    events: EventSender,
    cancel: CancelToken,
}

impl<S: PhotoSource> CategoryWorker<S> {
    pub fn new(
        task: CategoryTask,
        source: Arc<S>,
        dedup: Arc<DedupStore>,
        settings: Arc<WorkerSettings>,
        events: EventSender,
        cancel: CancelToken,
    ) -> Self {
        Self {
            task,
            status: CategoryStatus::Pending,
            source,
            dedup,
            settings,
            events,
            cancel,
        }
    }

    /// Runs the category to a terminal state.
    #[instrument(skip_all, fields(category = %self.task.category, target = self.task.target))]
    pub async fn run(mut self, observer: Arc<dyn ProgressObserver>) -> CategoryReport {
        let category = self.task.category.clone();

        let folder = session_folder(&self.settings.output_dir, &category);
        if let Err(e) = tokio::fs::create_dir_all(&folder).await {
            self.events.error(
                Some(&category),
                format!("Error creating folder for {}: {}", category, e),
            );
            self.status = CategoryStatus::Failed;
            return self.report(None);
        }
        self.events.info(Some(&category), format!("Created folder: {}", folder.display()));

        self.fetch_loop(&folder, observer.as_ref()).await;

        let summary = format!(
            "'{}': {}/{} images",
            category, self.task.downloaded, self.task.target
        );
        if self.cancel.is_cancelled() {
            self.status = CategoryStatus::Stopped;
            self.events.info(Some(&category), format!("Stopped {}", summary));
        } else if self.status == CategoryStatus::Failed {
            self.events.error(Some(&category), format!("Failed {}", summary));
        } else {
            self.status = CategoryStatus::Completed;
            self.events.info(Some(&category), format!("Completed {}", summary));
        }

        self.report(Some(folder))
    }

    fn report(&self, folder: Option<PathBuf>) -> CategoryReport {
        CategoryReport {
            category: self.task.category.clone(),
            downloaded: self.task.downloaded,
            target: self.task.target,
            status: self.status,
            folder,
        }
    }

    async fn fetch_loop(&mut self, folder: &Path, observer: &dyn ProgressObserver) {
        let category = self.task.category.clone();

        while self.task.downloaded < self.task.target && !self.cancel.is_cancelled() {
            self.status = CategoryStatus::Fetching;
            let per_page = self.settings.max_per_page.min(self.task.remaining());
            debug!(page = self.task.page, per_page, "Requesting search page");

            match self.source.search(&category, per_page, self.task.page).await {
                Err(ApiError::RateLimited) => {
                    self.events.warning(
                        Some(&category),
                        format!(
                            "Rate limit reached for {}, waiting {}s...",
                            category,
                            self.settings.rate_limit_backoff.as_secs()
                        ),
                    );
                    if self.wait_out_rate_limit().await {
                        break;
                    }
                }
                Err(ApiError::Status(code)) => {
                    self.events.error(
                        Some(&category),
                        format!("API Error for {}: {}", category, code),
                    );
                    self.status = CategoryStatus::Failed;
                    break;
                }
                Err(e) => {
                    self.events.error(
                        Some(&category),
                        format!("Error downloading {}: {}", category, e),
                    );
                    self.status = CategoryStatus::Failed;
                    break;
                }
                Ok(page) if page.photos.is_empty() => {
                    self.events.info(
                        Some(&category),
                        format!("No more images found for '{}'", category),
                    );
                    break;
                }
                Ok(page) => {
                    self.status = CategoryStatus::Downloading;
                    self.download_batch(folder, &page.photos, observer).await;
                    self.task.page += 1;
                }
            }
        }
    }

    /// Sleeps through the rate-limit backoff.
    /// Returns true when the session was cancelled meanwhile.
    async fn wait_out_rate_limit(&mut self) -> bool {
        let backoff = self.settings.rate_limit_backoff;
        tokio::select! {
            _ = sleep(backoff) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    async fn download_batch(
        &mut self,
        folder: &Path,
        photos: &[Photo],
        observer: &dyn ProgressObserver,
    ) {
        let category = self.task.category.clone();

        for photo in photos {
            if self.task.downloaded >= self.task.target || self.cancel.is_cancelled() {
                break;
            }

            let id = photo.identifier();
            match self.dedup.try_claim(&id) {
                Claim::Claimed => {}
                Claim::AlreadyRecorded => {
                    self.events.info(
                        Some(&category),
                        format!("Skipped duplicate image {} in '{}'", id, category),
                    );
                    continue;
                }
                Claim::InFlight => {
                    self.events.info(
                        Some(&category),
                        format!(
                            "Skipped image {} in '{}', another category is downloading it",
                            id, category
                        ),
                    );
                    continue;
                }
            }

            let Some(url) = photo.resolve_url(self.task.quality) else {
                self.dedup.release(&id);
                self.events.warning(
                    Some(&category),
                    format!(
                        "Failed to download image {}: no '{}' or 'large' source",
                        id, self.task.quality
                    ),
                );
                continue;
            };

            let destination = folder.join(format!("{}{}", id, extension_from_url(url)));
            if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                self.dedup.mark_present(&id);
                self.events.info(
                    Some(&category),
                    format!("Image {} already exists at {}", id, destination.display()),
                );
                continue;
            }

            match self.download_one(url, &destination).await {
                Ok(bytes) => {
                    self.task.downloaded += 1;
                    debug!(id = %id, bytes, "Saved {}", destination.display());

                    if let Err(e) = self.dedup.record(&id, &category, &destination) {
                        self.events.warning(
                            Some(&category),
                            format!("Could not record image {}: {}", id, e),
                        );
                    }

                    self.events
                        .category_progress(&category, self.task.downloaded, self.task.target);
                    observer.on_worker_progress(&category, self.task.downloaded, self.task.target);

                    if !self.settings.item_delay.is_zero() {
                        sleep(self.settings.item_delay).await;
                    }
                }
                Err(e) => {
                    self.dedup.release(&id);
                    self.events.warning(
                        Some(&category),
                        format!("Failed to download image {}: {}", id, e),
                    );
                }
            }
        }
    }

    /// Fetches one image and writes it next to its destination before renaming it into place.
    async fn download_one(&self, url: &str, destination: &Path) -> WorkerResult<u64> {
        let bytes = self.source.fetch_image(url).await?;

        let part = part_path(destination);
        let written = async {
            tokio::fs::write(&part, &bytes).await?;
            tokio::fs::rename(&part, destination).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }

        Ok(bytes.len() as u64)
    }
}
