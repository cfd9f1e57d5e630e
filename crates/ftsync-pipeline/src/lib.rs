//! Run coordination: env configuration, the sync loop, and run counters.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ftsync_core::{should_write, ExtractionPolicy, RunSummary};
use ftsync_shopify::{
    first_text, truncate_to, CatalogService, ProductPager, ShopifyClient, ShopifyConfig,
    WriteOutcome, DEFAULT_MAX_LEN,
};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ftsync-pipeline";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub shop_domain: String,
    pub api_version: String,
    pub access_token: String,
    pub namespace: String,
    pub key: String,
    pub page_size: u32,
    pub updated_since: Option<DateTime<Utc>>,
    pub extraction_policy: ExtractionPolicy,
    pub max_len: usize,
    pub page_delay: Option<Duration>,
    pub title_fallback: bool,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    /// Reads configuration from the environment. The shop domain and the
    /// Admin API token are required and checked before any request is made;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        let shop_domain = std::env::var("SHOP_DOMAIN").context("SHOP_DOMAIN must be set")?;
        let access_token =
            std::env::var("SHOP_ADMIN_API_TOKEN").context("SHOP_ADMIN_API_TOKEN must be set")?;

        let updated_since = match std::env::var("UPDATED_SINCE") {
            Ok(raw) => Some(raw.parse::<DateTime<Utc>>().with_context(|| {
                format!("UPDATED_SINCE is not a valid RFC 3339 timestamp: {raw}")
            })?),
            Err(_) => None,
        };
        let extraction_policy = match std::env::var("EXTRACTION_POLICY") {
            Ok(raw) => raw
                .parse::<ExtractionPolicy>()
                .context("parsing EXTRACTION_POLICY")?,
            Err(_) => ExtractionPolicy::default(),
        };

        Ok(Self {
            shop_domain,
            api_version: std::env::var("API_VERSION").unwrap_or_else(|_| "2024-10".to_string()),
            access_token,
            namespace: std::env::var("MF_NAMESPACE").unwrap_or_else(|_| "custom".to_string()),
            key: std::env::var("MF_KEY")
                .unwrap_or_else(|_| "friendly_title_first_line".to_string()),
            page_size: std::env::var("PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            updated_since,
            extraction_policy,
            max_len: std::env::var("MAX_TITLE_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_LEN),
            page_delay: std::env::var("PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            title_fallback: std::env::var("TITLE_FALLBACK")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }

    fn shopify_config(&self) -> ShopifyConfig {
        ShopifyConfig {
            shop_domain: self.shop_domain.clone(),
            api_version: self.api_version.clone(),
            access_token: self.access_token.clone(),
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            page_size: self.page_size,
            updated_since: self.updated_since,
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// Drives reader, extractor, comparator and writer, strictly in pagination
/// order with at most one request in flight. Safe to re-run after any
/// abort: every write is derived from current remote state.
pub struct SyncPipeline<S> {
    service: S,
    extraction_policy: ExtractionPolicy,
    max_len: usize,
    title_fallback: bool,
    page_delay: Option<Duration>,
    dry_run: bool,
}

impl<S: CatalogService> SyncPipeline<S> {
    pub fn new(service: S, config: &SyncConfig) -> Self {
        Self {
            service,
            extraction_policy: config.extraction_policy,
            max_len: config.max_len,
            title_fallback: config.title_fallback,
            page_delay: config.page_delay,
            dry_run: false,
        }
    }

    /// Full read/extract/compare pass with the final mutation suppressed.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("catalog_sync", %run_id);
        let _guard = span.enter();

        let mut pager = ProductPager::new(&self.service).with_page_delay(self.page_delay);
        let mut scanned = 0usize;
        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        loop {
            let item = match pager.next_item().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        scanned,
                        updated,
                        skipped,
                        failed,
                        "aborting after transport failure; earlier writes stand"
                    );
                    return Err(err).context("pulling next catalog page");
                }
            };
            scanned += 1;

            let mut candidate =
                first_text(&item.description_html, self.extraction_policy, self.max_len);
            if candidate.is_empty() && self.title_fallback {
                candidate = truncate_to(item.title.trim(), self.max_len);
            }

            if !should_write(item.current_value.as_deref(), &candidate) {
                skipped += 1;
                debug!(id = %item.id, "no change");
                continue;
            }

            if self.dry_run {
                updated += 1;
                info!(id = %item.id, title = %item.title, value = %candidate, "would update friendly title");
                continue;
            }

            let outcome = self
                .service
                .upsert_metafield(&item.id, &candidate)
                .await
                .with_context(|| format!("writing metafield for {}", item.id))?;
            match outcome {
                WriteOutcome::Applied => {
                    updated += 1;
                    info!(id = %item.id, title = %item.title, value = %candidate, "updated friendly title");
                }
                WriteOutcome::Rejected(errors) => {
                    failed += 1;
                    warn!(id = %item.id, title = %item.title, ?errors, "metafield write rejected");
                }
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scanned,
            updated,
            skipped,
            failed,
        };
        info!(
            scanned = summary.scanned,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "catalog sync finished"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let client = ShopifyClient::new(config.shopify_config())?;
    let pipeline = SyncPipeline::new(client, &config).with_dry_run(dry_run);
    pipeline.run_once().await
}
