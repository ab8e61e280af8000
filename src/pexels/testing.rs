//! Scripted photo source used by the engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::pexels::{ApiError, ApiResult, Photo, PhotoSource, ProgressObserver, SearchPage};

pub enum ScriptedResponse {
    Page(Vec<Photo>),
    RateLimited,
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCall {
    pub query: String,
    pub per_page: u32,
    pub page: u32,
}

/// Replays queued responses per query; an exhausted queue answers with an empty page.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    searches: Mutex<Vec<SearchCall>>,
    fetches: Mutex<Vec<String>>,
    failing: Mutex<HashSet<u64>>,
    fetch_delay: Mutex<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, query: &str, responses: Vec<ScriptedResponse>) {
        self.scripts
            .lock()
            .entry(query.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn fail_fetch_for(&self, id: u64) {
        self.failing.lock().insert(id);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn search_calls(&self) -> Vec<SearchCall> {
        self.searches.lock().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetches.lock().clone()
    }

    pub fn fetched_ids(&self) -> Vec<u64> {
        self.fetched_urls().iter().filter_map(|url| id_from_url(url)).collect()
    }
}

impl PhotoSource for ScriptedSource {
    async fn search(&self, query: &str, per_page: u32, page: u32) -> ApiResult<SearchPage> {
        self.searches.lock().push(SearchCall {
            query: query.to_string(),
            per_page,
            page,
        });

        let next = self.scripts.lock().get_mut(query).and_then(VecDeque::pop_front);
        match next {
            Some(ScriptedResponse::Page(photos)) => Ok(SearchPage {
                per_page,
                page,
                total_results: photos.len() as u64,
                photos,
                next_page: None,
            }),
            Some(ScriptedResponse::RateLimited) => Err(ApiError::RateLimited),
            Some(ScriptedResponse::Status(code)) => Err(ApiError::Status(code)),
            None => Ok(SearchPage::default()),
        }
    }

    async fn fetch_image(&self, url: &str) -> ApiResult<Vec<u8>> {
        self.fetches.lock().push(url.to_string());

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = id_from_url(url).is_some_and(|id| self.failing.lock().contains(&id));
        if failing {
            return Err(ApiError::Status(404));
        }

        Ok(format!("image bytes of {}", url).into_bytes())
    }
}

/// Photo with all three quality variants, served as `.jpeg`.
pub fn photo(id: u64) -> Photo {
    photo_with_sources(
        id,
        &[
            ("original", &format!("https://images.test/{}/original.jpeg", id)),
            ("large", &format!("https://images.test/{}/large.jpeg?h=650", id)),
            ("medium", &format!("https://images.test/{}/medium.jpeg?h=350", id)),
        ],
    )
}

pub fn photo_with_sources(id: u64, sources: &[(&str, &str)]) -> Photo {
    Photo {
        id,
        src: sources
            .iter()
            .map(|(quality, url)| (quality.to_string(), url.to_string()))
            .collect(),
        alt: None,
        photographer: None,
    }
}

fn id_from_url(url: &str) -> Option<u64> {
    url.strip_prefix("https://images.test/")?
        .split('/')
        .next()?
        .parse()
        .ok()
}

pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_worker_progress(&self, _category: &str, _downloaded: u32, _target: u32) {}
}
