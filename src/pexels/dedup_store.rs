//! Dedup Store
//!
//! Tracks every image identifier ever downloaded. The set is seeded at startup from the session
//! folders already on disk and from the append-only download log, then shared by all category
//! workers. Claiming an identifier is a single atomic operation so two workers can never fetch
//! the same image concurrently.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Image extensions picked up when scanning session folders.
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Session folders are named `{category}_{YYYY-MM-DD_HH-MM-SS}`.
static SESSION_DIR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.+_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}$")
        .expect("session folder pattern is valid")
});

/// Error types for the dedup store
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Failed to append to download log {path}: {source}")]
    LogWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for dedup store operations
pub type DedupResult<T> = Result<T, DedupError>;

/// One successfully downloaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub identifier: String,
    pub category: String,
    pub path: PathBuf,
}

impl ImageRecord {
    fn to_log_line(&self, timestamp: &str) -> String {
        format!("{},{},{},{}\n", timestamp, self.identifier, self.category, self.path.display())
    }

    /// Parses `timestamp,identifier,category,path`. The path may itself contain commas.
    fn parse_log_line(line: &str) -> Option<Self> {
        let mut fields = line.splitn(4, ',');
        let _timestamp = fields.next()?;
        let identifier = fields.next()?.trim();
        let category = fields.next()?;
        let path = fields.next()?.trim_end();
        if identifier.is_empty() || path.is_empty() {
            return None;
        }

        Some(Self {
            identifier: identifier.to_string(),
            category: category.to_string(),
            path: PathBuf::from(path),
        })
    }
}

/// State of an identifier in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// A worker is downloading it right now.
    Pending,
    /// Present on disk or in the log.
    Recorded,
}

/// Outcome of [`DedupStore::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the download of this identifier.
    Claimed,
    /// Already downloaded in this or a previous run.
    AlreadyRecorded,
    /// Another worker is downloading it.
    InFlight,
}

pub struct DedupStore {
    entries: DashMap<String, EntryState>,
    log_path: PathBuf,
    log_lock: Mutex<()>,
    load_warnings: Vec<String>,
}

impl DedupStore {
    /// Creates an empty store that appends to `log_path`.
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            entries: DashMap::new(),
            log_path: log_path.into(),
            log_lock: Mutex::new(()),
            load_warnings: Vec::new(),
        }
    }

    /// Builds the index from the session folders under `output_dir` and the download log.
    ///
    /// Never fails: unreadable folders and malformed log lines are skipped and reported through
    /// [`DedupStore::load_warnings`].
    pub fn load(output_dir: &Path, log_path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(log_path);

        let scanned = store.scan_session_folders(output_dir);
        let logged = store.read_log();

        info!(
            scanned,
            logged,
            known = store.entries.len(),
            warnings = store.load_warnings.len(),
            "Dedup store loaded"
        );

        store
    }

    fn scan_session_folders(&mut self, output_dir: &Path) -> usize {
        if !output_dir.is_dir() {
            let message = format!("Output directory {} does not exist yet", output_dir.display());
            warn!("{}", message);
            self.load_warnings.push(message);
            return 0;
        }

        let mut found = 0;
        // Depth 1 must be yielded so the name filter can prune non-session folders.
        let walker = WalkDir::new(output_dir)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || is_session_dir(entry));

        for entry_result in walker {
            match entry_result {
                Ok(entry) => {
                    if entry.depth() != 2
                        || !entry.file_type().is_file()
                        || !has_image_extension(entry.path())
                    {
                        continue;
                    }
                    if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                        self.entries.insert(stem.to_string(), EntryState::Recorded);
                        found += 1;
                    }
                }
                Err(err) => {
                    let message = format!("Could not scan existing downloads: {}", err);
                    warn!("{}", message);
                    self.load_warnings.push(message);
                }
            }
        }

        found
    }

    fn read_log(&mut self) -> usize {
        let content = match fs::read_to_string(&self.log_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No download log at {}", self.log_path.display());
                return 0;
            }
            Err(err) => {
                let message = format!(
                    "Could not read download log {}: {}",
                    self.log_path.display(),
                    err
                );
                warn!("{}", message);
                self.load_warnings.push(message);
                return 0;
            }
        };

        let mut found = 0;
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match ImageRecord::parse_log_line(line) {
                Some(record) => {
                    self.entries.insert(record.identifier, EntryState::Recorded);
                    found += 1;
                }
                None => {
                    let message = format!(
                        "Skipping malformed download log line {}: {:?}",
                        index + 1,
                        line
                    );
                    warn!("{}", message);
                    self.load_warnings.push(message);
                }
            }
        }

        found
    }

    /// Warnings collected while loading.
    pub fn load_warnings(&self) -> &[String] {
        &self.load_warnings
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// True when `id` has been downloaded, in this run or a previous one.
    pub fn contains(&self, id: &str) -> bool {
        matches!(self.entries.get(id).map(|state| *state), Some(EntryState::Recorded))
    }

    /// Atomically checks `id` and reserves it for the caller when it is unknown.
    pub fn try_claim(&self, id: &str) -> Claim {
        match self.entries.entry(id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(EntryState::Pending);
                Claim::Claimed
            }
            Entry::Occupied(occupied) => match occupied.get() {
                EntryState::Recorded => Claim::AlreadyRecorded,
                EntryState::Pending => Claim::InFlight,
            },
        }
    }

    /// Drops a claim whose download did not succeed.
    pub fn release(&self, id: &str) {
        self.entries.remove_if(id, |_, state| *state == EntryState::Pending);
    }

    /// Marks `id` as downloaded without appending to the log.
    pub fn mark_present(&self, id: &str) {
        self.entries.insert(id.to_string(), EntryState::Recorded);
    }

    /// Marks `id` as downloaded and appends it to the log.
    ///
    /// The in-memory index is updated even when the append fails, so the error only means the
    /// record will not survive to the next run.
    pub fn record(&self, id: &str, category: &str, path: &Path) -> DedupResult<()> {
        self.entries.insert(id.to_string(), EntryState::Recorded);

        let record = ImageRecord {
            identifier: id.to_string(),
            category: category.to_string(),
            path: path.to_path_buf(),
        };
        let line = record.to_log_line(&Local::now().format(LOG_TIMESTAMP_FORMAT).to_string());

        let _guard = self.log_lock.lock();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|source| DedupError::LogWrite {
                path: self.log_path.clone(),
                source,
            })
    }

    /// Number of identifiers known to be downloaded.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| *entry.value() == EntryState::Recorded)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_session_folder(name: &str) -> bool {
    SESSION_DIR_PATTERN.is_match(name)
}

fn is_session_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && is_session_folder(&entry.file_name().to_string_lossy())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_load_scans_session_folders_and_log() {
        let root = tempdir().unwrap();
        let session = root.path().join("nature_2024-05-01_10-00-00");
        fs::create_dir(&session).unwrap();
        fs::write(session.join("101.jpeg"), b"x").unwrap();
        fs::write(session.join("102.PNG"), b"x").unwrap();
        fs::write(session.join("notes.txt"), b"x").unwrap();
        fs::write(session.join(".103.jpg.part"), b"x").unwrap();

        // Not a session folder.
        let other = root.path().join("random");
        fs::create_dir(&other).unwrap();
        fs::write(other.join("999.jpg"), b"x").unwrap();

        let log = root.path().join("download_log.txt");
        fs::write(
            &log,
            "2024-05-01 10:00:01,200,cars,cars_2024-05-01_10-00-00/200.jpeg\n\
             garbage line\n\
             \n\
             2024-05-01 10:00:02,201,cars,some,path/with,commas.jpg\n",
        )
        .unwrap();

        let store = DedupStore::load(root.path(), &log);

        assert!(store.contains("101"));
        assert!(store.contains("102"));
        assert!(store.contains("200"));
        assert!(store.contains("201"));
        assert!(!store.contains("999"));
        assert!(!store.contains("notes"));
        assert!(!store.contains(".103.jpg"));
        assert_eq!(store.len(), 4);
        assert_eq!(store.load_warnings().len(), 1);
        assert!(store.load_warnings()[0].contains("line 2"));
    }

    #[test]
    fn test_load_ignores_images_outside_session_folders() {
        let root = tempdir().unwrap();
        let session = root.path().join("cats_2024-05-01_10-00-00");
        fs::create_dir(&session).unwrap();
        fs::write(session.join("1.jpg"), b"x").unwrap();

        for folder in ["random", "logs", "config"] {
            fs::create_dir(root.path().join(folder)).unwrap();
            fs::write(root.path().join(folder).join("999.jpg"), b"x").unwrap();
        }
        // Session-like names only count for folders.
        fs::write(root.path().join("dogs_2024-05-01_10-00-00"), b"x").unwrap();
        fs::write(root.path().join("998.jpg"), b"x").unwrap();
        // Deeper than one level inside a session folder is not scanned.
        fs::create_dir(session.join("nested")).unwrap();
        fs::write(session.join("nested").join("997.jpg"), b"x").unwrap();

        let store = DedupStore::load(root.path(), root.path().join("download_log.txt"));

        assert!(store.contains("1"));
        assert!(!store.contains("999"));
        assert!(!store.contains("998"));
        assert!(!store.contains("997"));
        assert_eq!(store.len(), 1);
        assert!(store.load_warnings().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_session_folder_is_a_warning() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempdir().unwrap();
        let readable = root.path().join("cats_2024-05-01_10-00-00");
        fs::create_dir(&readable).unwrap();
        fs::write(readable.join("1.jpg"), b"x").unwrap();

        let locked = root.path().join("dogs_2024-05-01_10-00-00");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("2.jpg"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through the mode bits; nothing to observe then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let store = DedupStore::load(root.path(), root.path().join("download_log.txt"));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(store.contains("1"));
        assert!(!store.contains("2"));
        assert_eq!(store.load_warnings().len(), 1);
        assert!(store.load_warnings()[0].contains("Could not scan existing downloads"));
    }

    #[test]
    fn test_load_with_nothing_on_disk() {
        let root = tempdir().unwrap();
        let store = DedupStore::load(root.path(), root.path().join("missing_log.txt"));
        assert!(store.is_empty());
        assert!(store.load_warnings().is_empty());
    }

    #[test]
    fn test_missing_output_dir_is_a_warning() {
        let root = tempdir().unwrap();
        let store = DedupStore::load(&root.path().join("nope"), root.path().join("log.txt"));
        assert!(store.is_empty());
        assert_eq!(store.load_warnings().len(), 1);
    }

    #[test]
    fn test_record_appends_log_line() {
        let root = tempdir().unwrap();
        let log = root.path().join("download_log.txt");
        let store = DedupStore::new(&log);

        store.record("7", "sea life", Path::new("sea_life_2024-01-01_00-00-00/7.jpg")).unwrap();
        store.record("8", "sea life", Path::new("sea_life_2024-01-01_00-00-00/8.jpg")).unwrap();

        let content = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let fields: Vec<&str> = lines[0].split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].len(), "2024-01-01 00:00:00".len());
        assert_eq!(fields[1], "7");
        assert_eq!(fields[2], "sea life");
        assert_eq!(fields[3], "sea_life_2024-01-01_00-00-00/7.jpg");

        // The next run sees both identifiers.
        let reloaded = DedupStore::load(root.path(), &log);
        assert!(reloaded.contains("7"));
        assert!(reloaded.contains("8"));
    }

    #[test]
    fn test_record_failure_keeps_in_memory_entry() {
        let root = tempdir().unwrap();
        // A directory cannot be opened for appending.
        let store = DedupStore::new(root.path());

        let result = store.record("5", "cats", Path::new("cats/5.jpg"));

        assert!(matches!(result, Err(DedupError::LogWrite { .. })));
        assert!(store.contains("5"));
    }

    #[test]
    fn test_claim_lifecycle() {
        let root = tempdir().unwrap();
        let store = DedupStore::new(root.path().join("log.txt"));

        assert_eq!(store.try_claim("1"), Claim::Claimed);
        assert_eq!(store.try_claim("1"), Claim::InFlight);
        assert!(!store.contains("1"));

        store.release("1");
        assert_eq!(store.try_claim("1"), Claim::Claimed);

        store.mark_present("1");
        assert_eq!(store.try_claim("1"), Claim::AlreadyRecorded);

        // Releasing a recorded identifier does nothing.
        store.release("1");
        assert!(store.contains("1"));
        assert!(!root.path().join("log.txt").exists());
    }

    #[test]
    fn test_concurrent_claims_grant_exactly_one_owner() {
        let root = tempdir().unwrap();
        let store = Arc::new(DedupStore::new(root.path().join("log.txt")));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_claim("shared") == Claim::Claimed)
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_session_folder_pattern() {
        assert!(is_session_folder("cats_2024-05-01_10-00-00"));
        assert!(is_session_folder("sea_life_2023-12-31_23-59-59"));
        assert!(!is_session_folder("cats_2024"));
        assert!(!is_session_folder("_2024-05-01_10-00-00"));
        assert!(!is_session_folder("logs"));
    }
}
