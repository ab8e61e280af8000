//! Events flowing from the download engine to whatever shell renders them.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Tracing target of mirrored status lines.
pub const SESSION_TARGET: &str = "pexels_downloader::session";

/// Severity of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Stopped,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Completed => write!(f, "completed"),
            EndReason::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A human readable status line.
    Status {
        level: StatusLevel,
        category: Option<String>,
        message: String,
    },
    /// Per-category counts after each successful download.
    CategoryProgress {
        category: String,
        downloaded: u32,
        target: u32,
    },
    /// Overall session progress in `0.0..=1.0`.
    Progress(f64),
    /// Terminal event, emitted exactly once per session.
    SessionEnd(EndReason),
}

/// Sending half of the event channel.
///
/// Every status line is traced as well, so the log file holds the same history the shell shows.
/// A shell that dropped its receiver only loses the rendering.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn status(&self, level: StatusLevel, category: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let label = category.unwrap_or("-");
        match level {
            StatusLevel::Info => info!(target: SESSION_TARGET, category = label, "{}", message),
            StatusLevel::Warning => warn!(target: SESSION_TARGET, category = label, "{}", message),
            StatusLevel::Error => error!(target: SESSION_TARGET, category = label, "{}", message),
        }
        self.send(SessionEvent::Status {
            level,
            category: category.map(str::to_string),
            message,
        });
    }

    pub fn info(&self, category: Option<&str>, message: impl Into<String>) {
        self.status(StatusLevel::Info, category, message);
    }

    pub fn warning(&self, category: Option<&str>, message: impl Into<String>) {
        self.status(StatusLevel::Warning, category, message);
    }

    pub fn error(&self, category: Option<&str>, message: impl Into<String>) {
        self.status(StatusLevel::Error, category, message);
    }

    pub fn category_progress(&self, category: &str, downloaded: u32, target: u32) {
        self.send(SessionEvent::CategoryProgress {
            category: category.to_string(),
            downloaded,
            target,
        });
    }

    pub fn progress(&self, fraction: f64) {
        self.send(SessionEvent::Progress(fraction.clamp(0.0, 1.0)));
    }

    pub fn session_end(&self, reason: EndReason) {
        self.send(SessionEvent::SessionEnd(reason));
    }

    fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}
