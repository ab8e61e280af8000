//! Pexels search API client
//!
//! The download engine only talks to the [`PhotoSource`] trait, so it can run against the live
//! API through [`PexelsClient`] or against scripted sources in tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::pexels::AppConfig;

/// Extension used when the image URL carries none.
pub const DEFAULT_EXTENSION: &str = ".jpg";

/// Error types for API calls
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Named resolution variant of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Original,
    #[default]
    Large,
    Medium,
}

impl Quality {
    pub fn variants() -> &'static [Quality] {
        &[Quality::Original, Quality::Large, Quality::Medium]
    }

    /// Key of this variant in a photo's `src` mapping.
    pub fn key(&self) -> &'static str {
        match self {
            Quality::Original => "original",
            Quality::Large => "large",
            Quality::Medium => "medium",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(Quality::Original),
            "large" => Ok(Quality::Large),
            "medium" => Ok(Quality::Medium),
            other => Err(format!("Unknown image quality '{}'", other)),
        }
    }
}

/// A photo as returned by the search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    #[serde(default)]
    pub src: HashMap<String, String>,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(default)]
    pub photographer: Option<String>,
}

impl Photo {
    /// Stable deduplication key of this photo.
    pub fn identifier(&self) -> String {
        self.id.to_string()
    }

    /// URL for the requested quality, falling back to `large` when the variant is missing.
    pub fn resolve_url(&self, quality: Quality) -> Option<&str> {
        self.src
            .get(quality.key())
            .or_else(|| self.src.get(Quality::Large.key()))
            .map(String::as_str)
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub next_page: Option<String>,
}

/// Source of photo metadata and image bytes.
pub trait PhotoSource: Send + Sync + 'static {
    /// Fetch one page of results for `query`.
    fn search(
        &self,
        query: &str,
        per_page: u32,
        page: u32,
    ) -> impl Future<Output = ApiResult<SearchPage>> + Send;

    /// Fetch the binary content behind an image URL.
    fn fetch_image(&self, url: &str) -> impl Future<Output = ApiResult<Vec<u8>>> + Send;
}

/// Derives the file extension (leading dot included) from the path of an image URL.
pub fn extension_from_url(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    Path::new(&path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// HTTP client for the Pexels API
#[derive(Clone)]
pub struct PexelsClient {
    client: Client,
    endpoint: String,
    api_key: String,
    api_timeout: Duration,
    image_timeout: Duration,
}

impl PexelsClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        user_agent: &str,
        api_timeout: Duration,
        image_timeout: Duration,
    ) -> ApiResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            api_timeout,
            image_timeout,
        })
    }

    pub fn from_config(config: &AppConfig) -> ApiResult<Self> {
        Self::new(
            config.api.search_endpoint.clone(),
            config.api.api_key.clone(),
            &config.api.user_agent,
            config.api_timeout(),
            config.image_timeout(),
        )
    }
}

impl PhotoSource for PexelsClient {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn search(&self, query: &str, per_page: u32, page: u32) -> ApiResult<SearchPage> {
        let per_page = per_page.to_string();
        let page_number = page.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .header("Authorization", &self.api_key)
            .query(&[
                ("query", query),
                ("per_page", per_page.as_str()),
                ("page", page_number.as_str()),
            ])
            .timeout(self.api_timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Search rate limited");
                Err(ApiError::RateLimited)
            }
            status if !status.is_success() => Err(ApiError::Status(status.as_u16())),
            _ => {
                let page: SearchPage = response.json().await?;
                debug!(photos = page.photos.len(), "Search page received");
                Ok(page)
            }
        }
    }

    async fn fetch_image(&self, url: &str) -> ApiResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(self.image_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::InvalidResponse(format!("Empty body from {}", url)));
        }

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo_with(src: &[(&str, &str)]) -> Photo {
        Photo {
            id: 42,
            src: src.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            alt: None,
            photographer: None,
        }
    }

    #[test]
    fn test_resolve_requested_quality() {
        let photo = photo_with(&[
            ("original", "https://img/original.png"),
            ("large", "https://img/large.jpeg"),
            ("medium", "https://img/medium.jpeg"),
        ]);
        assert_eq!(photo.resolve_url(Quality::Medium), Some("https://img/medium.jpeg"));
        assert_eq!(photo.resolve_url(Quality::Original), Some("https://img/original.png"));
    }

    #[test]
    fn test_missing_quality_falls_back_to_large() {
        let photo = photo_with(&[
            ("original", "https://img/o.png"),
            ("large", "https://img/l.jpeg"),
        ]);
        assert_eq!(photo.resolve_url(Quality::Medium), Some("https://img/l.jpeg"));
    }

    #[test]
    fn test_missing_large_and_requested_resolves_nothing() {
        let photo = photo_with(&[("tiny", "https://img/t.jpeg")]);
        assert_eq!(photo.resolve_url(Quality::Original), None);
    }

    #[test]
    fn test_extension_ignores_query_string() {
        assert_eq!(
            extension_from_url(
                "https://images.pexels.com/photos/1/pexels-photo-1.jpeg?auto=compress&h=650"
            ),
            ".jpeg"
        );
        assert_eq!(extension_from_url("https://images.pexels.com/photos/1/photo.png"), ".png");
    }

    #[test]
    fn test_extension_defaults_to_jpg() {
        assert_eq!(extension_from_url("https://images.pexels.com/photos/1/photo"), ".jpg");
        assert_eq!(extension_from_url("https://images.pexels.com/"), ".jpg");
        assert_eq!(extension_from_url("not a url"), ".jpg");
    }

    #[test]
    fn test_quality_parsing() {
        assert_eq!("Original".parse::<Quality>(), Ok(Quality::Original));
        assert_eq!(" medium ".parse::<Quality>(), Ok(Quality::Medium));
        assert!("huge".parse::<Quality>().is_err());
        assert_eq!(Quality::default(), Quality::Large);
        assert_eq!(Quality::Large.to_string(), "large");
    }

    #[test]
    fn test_search_page_deserializes_pexels_payload() {
        let json = r#"{
            "page": 1,
            "per_page": 2,
            "total_results": 1000,
            "photos": [
                {
                    "id": 1,
                    "src": {"original": "https://a/1.jpeg", "large": "https://a/1l.jpeg"},
                    "photographer": "x"
                },
                {"id": 2, "src": {"large": "https://a/2l.jpeg"}}
            ],
            "next_page": "https://api.pexels.com/v1/search/?page=2"
        }"#;
        let page: SearchPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.photos.len(), 2);
        assert_eq!(page.photos[1].identifier(), "2");
        assert_eq!(page.photos[0].photographer.as_deref(), Some("x"));
    }

    #[test]
    fn test_empty_payload_deserializes_to_empty_page() {
        let page: SearchPage = serde_json::from_str("{}").unwrap();
        assert!(page.photos.is_empty());
    }
}
