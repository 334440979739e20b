//! Kodik catalog mirror
//!
//! [`KodikClient`] pages through the Kodik `list` API with retries, and
//! [`KodikImporter`] upserts every result, with its translation, genres and
//! seasons, into the local materials tables.

use crate::config::KodikConfig;
use crate::db::repositories::MaterialRepository;
use crate::models::{clamp_page, Genre, KodikPage, Material, MaterialFilter, PagedResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const USER_AGENT: &str = "aki-importer/1.0";

/// Shortest pause between pages
pub const MIN_PAGE_SLEEP: Duration = Duration::from_millis(500);

/// Upstream statuses worth another attempt
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, thiserror::Error)]
pub enum KodikError {
    #[error("Kodik request failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Kodik returned status {0}")]
    Status(StatusCode),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Comma-separated translation ids, duplicates dropped, order kept
pub fn translation_csv(ids: &[i64]) -> Option<String> {
    let mut seen = HashSet::new();
    let unique: Vec<String> = ids
        .iter()
        .filter(|id| seen.insert(**id))
        .map(|id| id.to_string())
        .collect();
    if unique.is_empty() {
        None
    } else {
        Some(unique.join(","))
    }
}

/// Wait before retry number `attempt` (1-based)
pub fn backoff_delay(factor: f64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs_f64((factor * f64::from(1u32 << exp)).max(0.0))
}

/// One page of the upstream list
#[async_trait]
pub trait PageSource: Send + Sync {
    /// `None` requests the first page; later pages use the `next_page` URL
    async fn fetch(&self, next_url: Option<&str>) -> Result<KodikPage, KodikError>;
}

pub struct KodikClient {
    http: reqwest::Client,
    config: KodikConfig,
}

impl KodikClient {
    pub fn new(config: KodikConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build Kodik HTTP client")?;
        Ok(Self { http, config })
    }

    /// Query of the first page; `next_page` URLs already carry theirs
    pub fn first_page_params(&self) -> Vec<(&'static str, String)> {
        let config = &self.config;
        let mut params = vec![
            ("limit", config.limit.clamp(1, 100).to_string()),
            ("sort", "updated_at".to_string()),
            ("order", "desc".to_string()),
            ("types", config.types.clone()),
            ("with_material_data", "true".to_string()),
        ];
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            params.insert(0, ("token", token.to_string()));
        }
        if let Some(csv) = translation_csv(&config.translation_ids) {
            params.push(("translation_id", csv));
        }
        if config.with_episodes {
            params.push(("with_episodes_data", "true".to_string()));
        }
        if let Some(country) = config.not_blocked_in.as_deref().filter(|c| !c.is_empty()) {
            params.push(("not_blocked_in", country.to_string()));
        }
        params
    }

    async fn get_once(&self, url: &str, first: bool) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let request = self.http.get(url);
        let request = if first {
            request.query(&self.first_page_params())
        } else {
            request
        };
        request.send().await
    }
}

#[async_trait]
impl PageSource for KodikClient {
    async fn fetch(&self, next_url: Option<&str>) -> Result<KodikPage, KodikError> {
        let url = next_url.unwrap_or(&self.config.base_url);
        let attempts = self.config.max_retries.max(1);

        let mut attempt = 1;
        loop {
            let retry_reason = match self.get_once(url, next_url.is_none()).await {
                Ok(response) if RETRY_STATUSES.contains(&response.status()) => {
                    format!("status {}", response.status())
                }
                Ok(response) if !response.status().is_success() => {
                    return Err(KodikError::Status(response.status()));
                }
                Ok(response) => {
                    return Ok(response
                        .json::<KodikPage>()
                        .await
                        .context("Failed to decode Kodik page")?);
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => e.to_string(),
                Err(e) => return Err(anyhow::Error::new(e).context("Kodik request failed").into()),
            };

            if attempt >= attempts {
                return Err(KodikError::RetriesExhausted {
                    attempts,
                    reason: retry_reason,
                });
            }
            let delay = backoff_delay(self.config.backoff_factor, attempt);
            tracing::warn!(url, attempt, reason = %retry_reason, ?delay, "Retrying Kodik request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub max_pages: Option<u32>,
    pub dry_run: bool,
    pub sleep: Duration,
    /// Budget for storing one page; the rest of a slow page is skipped
    pub page_timeout: Duration,
}

impl ImportOptions {
    pub fn from_config(config: &KodikConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            dry_run: false,
            sleep: Duration::from_secs_f64(config.sleep_seconds.max(0.0)).max(MIN_PAGE_SLEEP),
            page_timeout: Duration::from_secs(config.page_timeout_seconds),
        }
    }
}

/// Totals of one import run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub pages: u32,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

pub struct KodikImporter<S: PageSource> {
    source: S,
    material_repo: Arc<dyn MaterialRepository>,
    options: ImportOptions,
}

impl<S: PageSource> KodikImporter<S> {
    pub fn new(source: S, material_repo: Arc<dyn MaterialRepository>, options: ImportOptions) -> Self {
        Self {
            source,
            material_repo,
            options,
        }
    }

    /// Walk `next_page` links until they run out, repeat, or `max_pages`
    /// is reached
    pub async fn run(&self) -> Result<ImportStats, KodikError> {
        let mut stats = ImportStats::default();
        let mut seen = HashSet::new();
        let mut next_url: Option<String> = None;

        tracing::info!(dry_run = self.options.dry_run, max_pages = ?self.options.max_pages, "Kodik import started");
        loop {
            if self.options.max_pages.is_some_and(|max| stats.pages >= max) {
                break;
            }

            let page = self.source.fetch(next_url.as_deref()).await?;
            stats.pages += 1;
            tracing::info!(page = stats.pages, results = page.results.len(), "Fetched Kodik page");

            if !self.options.dry_run {
                self.store_page(page.results, stats.pages, &mut stats).await;
            } else {
                stats.processed += page.results.len() as u64;
            }

            match page.next_page.filter(|url| !url.is_empty()) {
                Some(url) if !seen.insert(url.clone()) => {
                    tracing::warn!(url, "Repeated next_page, stopping");
                    break;
                }
                Some(url) => next_url = Some(url),
                None => break,
            }

            if !self.options.sleep.is_zero() {
                tokio::time::sleep(self.options.sleep).await;
            }
        }

        tracing::info!(
            pages = stats.pages,
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            failed = stats.failed,
            "Kodik import finished"
        );
        Ok(stats)
    }

    async fn store_page(
        &self,
        items: Vec<crate::models::KodikItem>,
        page: u32,
        stats: &mut ImportStats,
    ) {
        let started = Instant::now();
        let synced_at = Utc::now();
        stats.processed += items.len() as u64;

        for item in items {
            if started.elapsed() > self.options.page_timeout {
                tracing::warn!(page, timeout = ?self.options.page_timeout, "Page timeout, skipping the rest");
                break;
            }
            let material = item.into_material(synced_at);
            match self.material_repo.upsert(&material).await {
                Ok(true) => stats.created += 1,
                Ok(false) => stats.updated += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(page, kodik_id = %material.kodik_id, error = %e, "Failed to store material");
                }
            }
        }
    }
}

/// Read side of the mirror
pub struct CatalogService {
    material_repo: Arc<dyn MaterialRepository>,
}

impl CatalogService {
    pub fn new(material_repo: Arc<dyn MaterialRepository>) -> Self {
        Self { material_repo }
    }

    pub async fn list(
        &self,
        filter: &MaterialFilter,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<PagedResult<Material>, KodikError> {
        let (page, page_size) = clamp_page(page, page_size, 20);
        let (results, count) = self.material_repo.list(filter, page, page_size).await?;
        Ok(PagedResult::new(results, page, page_size, count))
    }

    pub async fn get(&self, kodik_id: &str) -> Result<Option<Material>, KodikError> {
        Ok(self.material_repo.get(kodik_id).await?)
    }

    pub async fn genres(
        &self,
        source: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<Genre>, KodikError> {
        Ok(self.material_repo.genres(source, search).await?)
    }
}
