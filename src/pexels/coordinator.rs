//! Download Coordinator
//!
//! This module:
//! 1. Validates a download request before any work starts
//! 2. Launches one category worker per category, all running concurrently
//! 3. Aggregates per-category progress into overall session progress
//! 4. Owns the cancellation flag of the running session
//! 5. Emits exactly one terminal event per session and then accepts a new start

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::pexels::{
    AppConfig, CancelToken, CategoryReport, CategoryTask, CategoryWorker,
    DedupStore, EndReason, EventReceiver, EventSender, PhotoSource, ProgressObserver, Quality,
    WorkerSettings, event_channel,
};

/// Rejected download requests. Nothing has been started when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter at least one category.")]
    NoCategories,

    #[error("Please enter a valid positive number for image count.")]
    InvalidCount,

    #[error("Maximum {max} images per category allowed.")]
    CountTooLarge { count: u32, max: u32 },

    #[error("Maximum {max} categories allowed.")]
    TooManyCategories { count: usize, max: usize },
}

/// Error types for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("A download session is already running")]
    AlreadyRunning,

    #[error("Session task failed: {0}")]
    Join(String),
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Upper bounds applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_categories: usize,
    pub max_images_per_category: u32,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_categories: 10,
            max_images_per_category: 1000,
        }
    }
}

impl RequestLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_categories: config.limits.max_categories,
            max_images_per_category: config.limits.max_images_per_category,
        }
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub categories: Vec<String>,
    pub count: u32,
    pub quality: Quality,
}

impl DownloadRequest {
    pub fn validate(
        categories: Vec<String>,
        count: u32,
        quality: Quality,
        limits: &RequestLimits,
    ) -> Result<Self, ValidationError> {
        let categories: Vec<String> = categories
            .into_iter()
            .map(|category| category.trim().to_string())
            .filter(|category| !category.is_empty())
            .collect();

        if categories.is_empty() {
            return Err(ValidationError::NoCategories);
        }
        if count == 0 {
            return Err(ValidationError::InvalidCount);
        }
        if count > limits.max_images_per_category {
            return Err(ValidationError::CountTooLarge {
                count,
                max: limits.max_images_per_category,
            });
        }
        if categories.len() > limits.max_categories {
            return Err(ValidationError::TooManyCategories {
                count: categories.len(),
                max: limits.max_categories,
            });
        }

        Ok(Self { categories, count, quality })
    }

    /// Total images the session aims for.
    pub fn total_images(&self) -> u64 {
        self.categories.len() as u64 * self.count as u64
    }
}

/// Splits comma separated shell input into categories.
pub fn parse_categories(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|category| !category.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses the image count typed into the shell.
pub fn parse_count(text: &str) -> Result<u32, ValidationError> {
    match text.trim().parse::<i64>() {
        Ok(count) if count > 0 => Ok(u32::try_from(count).unwrap_or(u32::MAX)),
        _ => Err(ValidationError::InvalidCount),
    }
}

/// Aggregate state of one session.
#[derive(Debug)]
pub struct DownloadSession {
    pub id: Uuid,
    pub total_categories: usize,
    pub completed_categories: usize,
    active_workers: usize,
    /// Fraction done of each unfinished worker, by worker slot.
    in_flight: HashMap<usize, f64>,
    progress: f64,
}

impl DownloadSession {
    fn new(id: Uuid, total_categories: usize) -> Self {
        Self {
            id,
            total_categories,
            completed_categories: 0,
            active_workers: total_categories,
            in_flight: (0..total_categories).map(|slot| (slot, 0.0)).collect(),
            progress: 0.0,
        }
    }

    /// Recomputes overall progress; never moves backwards.
    fn recompute(&mut self) -> f64 {
        if self.total_categories == 0 {
            return self.progress;
        }
        let partial: f64 = self.in_flight.values().sum();
        let overall = (self.completed_categories as f64 + partial) / self.total_categories as f64;
        self.progress = self.progress.max(overall.min(1.0));
        self.progress
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }
}

/// Write side of the cancellation flag plus the id of the session it belongs to.
struct ActiveSession {
    id: Uuid,
    cancel: watch::Sender<bool>,
}

/// Shared bookkeeping of one session. Worker callbacks land here.
struct SessionTracker {
    session: Mutex<DownloadSession>,
    events: EventSender,
    cancel: watch::Sender<bool>,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl SessionTracker {
    fn on_worker_progress(&self, slot: usize, downloaded: u32, target: u32) {
        let mut session = self.session.lock();
        if let Some(fraction) = session.in_flight.get_mut(&slot) {
            *fraction = if target == 0 {
                1.0
            } else {
                (downloaded as f64 / target as f64).min(1.0)
            };
        }
        let progress = session.recompute();
        self.events.progress(progress);
    }

    /// Accounts for one finished worker. Returns the end reason once the last one is done.
    fn on_worker_done(&self, slot: usize) -> Option<EndReason> {
        let mut session = self.session.lock();
        if session.in_flight.remove(&slot).is_none() {
            return None;
        }
        session.active_workers = session.active_workers.saturating_sub(1);
        session.completed_categories =
            (session.completed_categories + 1).min(session.total_categories);
        let progress = session.recompute();
        self.events.progress(progress);

        if session.active_workers > 0 {
            return None;
        }

        let reason = self.current_reason();

        // Accept a new start before announcing the end.
        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|current| current.id == session.id) {
                *active = None;
            }
        }

        self.events.progress(1.0);
        match reason {
            EndReason::Completed => self.events.info(None, "All downloads completed successfully!"),
            EndReason::Stopped => self.events.info(None, "Downloads stopped by user"),
        }
        self.events.session_end(reason);
        info!(session = %session.id, %reason, "Session finished");

        Some(reason)
    }

    fn current_reason(&self) -> EndReason {
        if *self.cancel.borrow() {
            EndReason::Stopped
        } else {
            EndReason::Completed
        }
    }

    /// Ends the session for every worker that never reported back.
    fn force_end(&self) -> EndReason {
        let slots: Vec<usize> = self.session.lock().in_flight.keys().copied().collect();
        let mut reason = self.current_reason();
        for slot in slots {
            if let Some(end) = self.on_worker_done(slot) {
                reason = end;
            }
        }
        reason
    }
}

/// Progress callback handed to one worker.
struct SlotObserver {
    slot: usize,
    tracker: Arc<SessionTracker>,
}

impl ProgressObserver for SlotObserver {
    fn on_worker_progress(&self, category: &str, downloaded: u32, target: u32) {
        debug!(category, downloaded, target, "Worker progress");
        self.tracker.on_worker_progress(self.slot, downloaded, target);
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub reason: EndReason,
    /// One report per requested category, in request order.
    pub reports: Vec<CategoryReport>,
}

impl SessionSummary {
    pub fn total_downloaded(&self) -> u64 {
        self.reports.iter().map(|report| report.downloaded as u64).sum()
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    id: Uuid,
    task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits until every worker has finished and the terminal event was sent.
    pub async fn wait(self) -> CoordinatorResult<SessionSummary> {
        self.task.await.map_err(|e| CoordinatorError::Join(e.to_string()))
    }
}

pub struct DownloadCoordinator<S: PhotoSource> {
    source: Arc<S>,
    dedup: Arc<DedupStore>,
    settings: Arc<WorkerSettings>,
    limits: RequestLimits,
    events: EventSender,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl<S: PhotoSource> DownloadCoordinator<S> {
    /// Creates a coordinator and the receiver the shell reads events from.
    pub fn new(
        source: Arc<S>,
        dedup: Arc<DedupStore>,
        settings: WorkerSettings,
        limits: RequestLimits,
    ) -> (Self, EventReceiver) {
        let (events, rx) = event_channel();

        for warning in dedup.load_warnings() {
            events.warning(None, format!("Warning: {}", warning));
        }
        if !dedup.is_empty() {
            events.info(None, format!("Loaded {} previously downloaded images", dedup.len()));
        }

        let coordinator = Self {
            source,
            dedup,
            settings: Arc::new(settings),
            limits,
            events,
            active: Arc::new(Mutex::new(None)),
        };

        (coordinator, rx)
    }

    pub fn from_config(
        source: Arc<S>,
        dedup: Arc<DedupStore>,
        config: &AppConfig,
    ) -> (Self, EventReceiver) {
        Self::new(
            source,
            dedup,
            WorkerSettings::from_config(config),
            RequestLimits::from_config(config),
        )
    }

    pub fn limits(&self) -> &RequestLimits {
        &self.limits
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Validates the request and launches one worker per category.
    pub fn start(
        &self,
        categories: Vec<String>,
        count: u32,
        quality: Quality,
    ) -> CoordinatorResult<SessionHandle> {
        let request = match DownloadRequest::validate(categories, count, quality, &self.limits) {
            Ok(request) => request,
            Err(e) => {
                self.events.error(None, format!("Error: {}", e));
                return Err(e.into());
            }
        };

        let mut active = self.active.lock();
        if active.is_some() {
            return Err(CoordinatorError::AlreadyRunning);
        }

        let id = Uuid::new_v4();
        let (cancel, _) = watch::channel(false);
        *active = Some(ActiveSession { id, cancel: cancel.clone() });
        drop(active);

        self.events.progress(0.0);
        self.events.info(
            None,
            format!("Starting download for {} categories...", request.categories.len()),
        );
        self.events.info(None, format!("Total images to download: {}", request.total_images()));

        let tracker = Arc::new(SessionTracker {
            session: Mutex::new(DownloadSession::new(id, request.categories.len())),
            events: self.events.clone(),
            cancel: cancel.clone(),
            active: self.active.clone(),
        });

        let span = info_span!("session", id = %id);
        let mut workers = JoinSet::new();
        for (slot, category) in request.categories.iter().enumerate() {
            let worker = CategoryWorker::new(
                CategoryTask::new(category.clone(), request.count, request.quality),
                self.source.clone(),
                self.dedup.clone(),
                self.settings.clone(),
                self.events.clone(),
                CancelToken::new(cancel.subscribe()),
            );
            let observer = Arc::new(SlotObserver { slot, tracker: tracker.clone() });

            let task = tokio::spawn(worker.run(observer).instrument(span.clone()));
            workers.spawn(async move { (slot, task.await) });
        }

        let events = self.events.clone();
        let categories = request.categories.clone();
        let count = request.count;
        let supervisor = tokio::spawn(
            async move {
                let mut reports: Vec<Option<CategoryReport>> = vec![None; categories.len()];
                let mut end = None;

                while let Some(joined) = workers.join_next().await {
                    let (slot, outcome) = match joined {
                        Ok(joined) => joined,
                        Err(e) => {
                            error!("Worker wrapper failed: {}", e);
                            continue;
                        }
                    };

                    let report = match outcome {
                        Ok(report) => report,
                        Err(e) => {
                            events.error(
                                Some(categories[slot].as_str()),
                                format!("Worker for '{}' crashed: {}", categories[slot], e),
                            );
                            CategoryReport::failed(categories[slot].clone(), count)
                        }
                    };
                    reports[slot] = Some(report);

                    if let Some(reason) = tracker.on_worker_done(slot) {
                        end = Some(reason);
                    }
                }

                let reason = match end {
                    Some(reason) => reason,
                    // Only reachable if a wrapper task itself vanished.
                    None => tracker.force_end(),
                };

                SessionSummary {
                    id,
                    reason,
                    reports: reports
                        .into_iter()
                        .enumerate()
                        .map(|(slot, report)| {
                            report.unwrap_or_else(|| {
                                CategoryReport::failed(categories[slot].clone(), count)
                            })
                        })
                        .collect(),
                }
            }
            .instrument(span),
        );

        Ok(SessionHandle { id, task: supervisor })
    }

    /// Asks every worker of the running session to wind down. Idempotent.
    pub fn stop(&self) {
        let active = self.active.lock();
        match active.as_ref() {
            Some(session) => {
                let already = session.cancel.send_replace(true);
                if !already {
                    self.events.info(None, "Stopping downloads...");
                }
            }
            None => debug!("Stop requested with no session running"),
        }
    }
}
