//! Crawl orchestration: listing expansion, row extraction, detail enrichment and output assembly.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use scholar_core::{
    citation_detail_url, profile_listing_url, CrawlMode, OutputDocument, SITE_ORIGIN,
};
use scholar_extract::{
    parse_detail_page, parse_listing, DetailPage, ExtractContext, ExtractError, FieldExtractor,
    RecordSummaryExtractor,
};
use scholar_storage::{
    ArtifactStore, BrowserError, BrowserSession, BrowserSessionConfig, ChromeSession,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "scholar-crawl";

/// DOM id of the listing's "Show more" button.
pub const LOAD_MORE_CONTROL_ID: &str = "gsc_bpf_more";

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlConfig {
    pub site_origin: String,
    pub load_more_id: String,
    pub settle_delay: Duration,
    pub max_load_more: usize,
    pub detail_enrichment: bool,
    pub artifacts_dir: PathBuf,
    pub not_found_marker: String,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub navigation_timeout: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            site_origin: SITE_ORIGIN.to_string(),
            load_more_id: LOAD_MORE_CONTROL_ID.to_string(),
            settle_delay: Duration::from_millis(500),
            max_load_more: 500,
            detail_enrichment: false,
            artifacts_dir: PathBuf::from("."),
            not_found_marker: "404".to_string(),
            headless: true,
            chrome_executable: None,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            site_origin: lookup("SCHOLAR_SITE_ORIGIN").unwrap_or(defaults.site_origin),
            load_more_id: defaults.load_more_id,
            settle_delay: lookup("SCHOLAR_SETTLE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),
            max_load_more: lookup("SCHOLAR_MAX_LOAD_MORE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_load_more),
            detail_enrichment: lookup("SCHOLAR_DETAIL_ENRICHMENT")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.detail_enrichment),
            artifacts_dir: lookup("SCHOLAR_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            not_found_marker: lookup("SCHOLAR_NOT_FOUND_MARKER")
                .unwrap_or(defaults.not_found_marker),
            headless: lookup("SCHOLAR_HEADLESS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.headless),
            chrome_executable: lookup("SCHOLAR_CHROME_PATH").map(PathBuf::from),
            navigation_timeout: defaults.navigation_timeout,
        }
    }

    /// Overlay whatever keys a YAML config file sets.
    pub fn with_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: CrawlConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(self.with_overrides(file))
    }

    pub fn with_overrides(mut self, file: CrawlConfigFile) -> Self {
        if let Some(v) = file.site_origin {
            self.site_origin = v;
        }
        if let Some(v) = file.settle_delay_ms {
            self.settle_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.max_load_more {
            self.max_load_more = v;
        }
        if let Some(v) = file.detail_enrichment {
            self.detail_enrichment = v;
        }
        if let Some(v) = file.artifacts_dir {
            self.artifacts_dir = v;
        }
        if let Some(v) = file.not_found_marker {
            self.not_found_marker = v;
        }
        if let Some(v) = file.headless {
            self.headless = v;
        }
        if let Some(v) = file.chrome_executable {
            self.chrome_executable = Some(v);
        }
        if let Some(v) = file.navigation_timeout_secs {
            self.navigation_timeout = Duration::from_secs(v);
        }
        self
    }

    pub fn browser_config(&self) -> BrowserSessionConfig {
        BrowserSessionConfig {
            headless: self.headless,
            chrome_executable: self.chrome_executable.clone(),
            navigation_timeout: self.navigation_timeout,
        }
    }

    pub fn extract_context(&self) -> ExtractContext {
        ExtractContext {
            site_origin: self.site_origin.clone(),
        }
    }
}

/// On-disk shape of the optional YAML config. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlConfigFile {
    pub site_origin: Option<String>,
    pub settle_delay_ms: Option<u64>,
    pub max_load_more: Option<usize>,
    pub detail_enrichment: Option<bool>,
    pub artifacts_dir: Option<PathBuf>,
    pub not_found_marker: Option<String>,
    pub headless: Option<bool>,
    pub chrome_executable: Option<PathBuf>,
    pub navigation_timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("profile page not found: {url}")]
    ProfileNotFound { url: String },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrawlStage {
    Navigating,
    ExistenceCheck,
    Paginating,
    Snapshotting,
    ExtractingRows,
    Assembling,
    Done,
}

impl fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrawlStage::Navigating => "navigating",
            CrawlStage::ExistenceCheck => "existence-check",
            CrawlStage::Paginating => "paginating",
            CrawlStage::Snapshotting => "snapshotting",
            CrawlStage::ExtractingRows => "extracting-rows",
            CrawlStage::Assembling => "assembling",
            CrawlStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaginationStop {
    /// The control rendered disabled; the listing is complete.
    Exhausted,
    /// No control on the page, so nothing more to load.
    ControlMissing,
    /// Gave up after the configured number of clicks with a partial listing.
    CapReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaginationOutcome {
    pub clicks: usize,
    pub stop: PaginationStop,
}

/// Clicks the load-more control until it disappears or disables itself.
#[derive(Debug, Clone)]
pub struct PaginationDriver {
    control_id: String,
    settle_delay: Duration,
    max_clicks: usize,
}

impl PaginationDriver {
    pub fn new(control_id: impl Into<String>, settle_delay: Duration, max_clicks: usize) -> Self {
        Self {
            control_id: control_id.into(),
            settle_delay,
            max_clicks,
        }
    }

    pub fn from_config(config: &CrawlConfig) -> Self {
        Self::new(
            config.load_more_id.clone(),
            config.settle_delay,
            config.max_load_more,
        )
    }

    pub async fn exhaust<S>(&self, session: &S) -> Result<PaginationOutcome, BrowserError>
    where
        S: BrowserSession + ?Sized,
    {
        let mut clicks = 0usize;
        loop {
            if !session.has_element(&self.control_id).await? {
                warn!(control = %self.control_id, clicks, "no load-more control found");
                return Ok(PaginationOutcome {
                    clicks,
                    stop: PaginationStop::ControlMissing,
                });
            }
            if session
                .element_attribute(&self.control_id, "disabled")
                .await?
                .is_some()
            {
                debug!(clicks, "load-more control disabled");
                return Ok(PaginationOutcome {
                    clicks,
                    stop: PaginationStop::Exhausted,
                });
            }
            if clicks >= self.max_clicks {
                warn!(
                    clicks,
                    "load-more control still enabled after cap; continuing with a partial listing"
                );
                return Ok(PaginationOutcome {
                    clicks,
                    stop: PaginationStop::CapReached,
                });
            }

            session.click_element(&self.control_id).await?;
            clicks += 1;
            tokio::time::sleep(self.settle_delay).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DetailAnomaly {
    NotFound { url: String },
    MissingPanel { url: String, artifact: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailOutcome {
    /// The panel was parsed and merged; the row still has to pass validation.
    Merged,
    Dropped(DetailAnomaly),
}

/// Fetches one detail page per row and merges its panel into the row.
#[derive(Debug, Clone)]
pub struct DetailEnricher {
    site_origin: String,
    not_found_marker: String,
    ctx: ExtractContext,
    artifacts: ArtifactStore,
}

impl DetailEnricher {
    pub fn new(config: &CrawlConfig) -> Self {
        Self {
            site_origin: config.site_origin.clone(),
            not_found_marker: config.not_found_marker.clone(),
            ctx: config.extract_context(),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
        }
    }

    pub async fn enrich<S>(
        &self,
        session: &S,
        row: &mut RecordSummaryExtractor,
    ) -> Result<DetailOutcome, CrawlError>
    where
        S: BrowserSession + ?Sized,
    {
        let Some(local_id) = row.local_id() else {
            return Ok(DetailOutcome::Merged);
        };
        let url = citation_detail_url(&self.site_origin, local_id);

        session.navigate(&url).await?;
        let title = session.title().await?;
        let html = session.page_source().await?;

        match parse_detail_page(title.as_deref(), &html, &self.not_found_marker, &self.ctx)? {
            DetailPage::NotFound => {
                warn!(%url, "detail page not found; skipping record");
                Ok(DetailOutcome::Dropped(DetailAnomaly::NotFound { url }))
            }
            DetailPage::MissingPanel => {
                let artifact = match self.artifacts.store_warning_page(&html).await {
                    Ok(stored) => {
                        warn!(
                            %url,
                            artifact = %stored.absolute_path.display(),
                            content_hash = %stored.content_hash,
                            bytes = stored.byte_size,
                            "detail page has no details; raw page saved"
                        );
                        Some(stored.absolute_path)
                    }
                    Err(err) => {
                        warn!(%url, "detail page has no details; saving raw page failed: {err:#}");
                        None
                    }
                };
                Ok(DetailOutcome::Dropped(DetailAnomaly::MissingPanel { url, artifact }))
            }
            DetailPage::Parsed(detail) => {
                row.enrich(detail);
                Ok(DetailOutcome::Merged)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub rows_seen: usize,
    pub records_emitted: usize,
    pub records_invalid: usize,
    pub detail_anomalies: Vec<DetailAnomaly>,
    pub pagination: Option<PaginationOutcome>,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub document: OutputDocument,
    pub summary: CrawlSummary,
}

/// Runs one profile crawl over an exclusively owned browser session.
pub struct CrawlPipeline<S: BrowserSession> {
    config: CrawlConfig,
    session: S,
    pagination: PaginationDriver,
    enricher: Option<DetailEnricher>,
}

impl<S: BrowserSession> CrawlPipeline<S> {
    pub fn new(config: CrawlConfig, session: S) -> Self {
        let pagination = PaginationDriver::from_config(&config);
        let enricher = config
            .detail_enrichment
            .then(|| DetailEnricher::new(&config));
        Self {
            config,
            session,
            pagination,
            enricher,
        }
    }

    /// Run the crawl, then close the session whatever the outcome.
    pub async fn run_and_close(self, scholar_id: &str, mode: CrawlMode) -> Result<CrawlReport, CrawlError> {
        let result = self.run(scholar_id, mode).await;
        if let Err(err) = self.session.close().await {
            warn!("closing browser session: {err}");
        }
        result
    }

    pub async fn run(&self, scholar_id: &str, mode: CrawlMode) -> Result<CrawlReport, CrawlError> {
        let url = profile_listing_url(&self.config.site_origin, scholar_id);
        let mut summary = CrawlSummary::default();

        enter(CrawlStage::Navigating);
        self.session.navigate(&url).await?;

        enter(CrawlStage::ExistenceCheck);
        let title = self.session.title().await?;
        if title
            .as_deref()
            .is_some_and(|t| t.contains(&self.config.not_found_marker))
        {
            error!(%url, "profile page not found");
            return Err(CrawlError::ProfileNotFound { url });
        }

        if mode == CrawlMode::FullListing {
            enter(CrawlStage::Paginating);
            summary.pagination = Some(self.pagination.exhaust(&self.session).await?);
        }

        enter(CrawlStage::Snapshotting);
        let html = self.session.page_source().await?;
        let snapshot = parse_listing(&html, &self.config.extract_context())?;
        let profile = snapshot.profile.extract();

        let document = match mode {
            CrawlMode::ProfileOnly => {
                enter(CrawlStage::Assembling);
                OutputDocument::Profile(profile.stamp(Utc::now()))
            }
            CrawlMode::FullListing => {
                enter(CrawlStage::ExtractingRows);
                let papers = self.extract_rows(snapshot.rows, &mut summary).await?;
                info!("found {} publications", papers.len());

                enter(CrawlStage::Assembling);
                OutputDocument::Full {
                    metadata: profile.stamp(Utc::now()),
                    papers,
                }
            }
        };

        enter(CrawlStage::Done);
        info!(
            rows = summary.rows_seen,
            emitted = summary.records_emitted,
            invalid = summary.records_invalid,
            anomalies = summary.detail_anomalies.len(),
            "crawl finished"
        );
        Ok(CrawlReport { document, summary })
    }

    async fn extract_rows(
        &self,
        rows: Vec<RecordSummaryExtractor>,
        summary: &mut CrawlSummary,
    ) -> Result<Vec<scholar_core::PublicationRecord>, CrawlError> {
        let mut papers = Vec::new();
        for mut row in rows {
            summary.rows_seen += 1;
            if !row.is_valid() {
                summary.records_invalid += 1;
                continue;
            }

            if let Some(enricher) = &self.enricher {
                if let DetailOutcome::Dropped(anomaly) = enricher.enrich(&self.session, &mut row).await? {
                    summary.detail_anomalies.push(anomaly);
                    continue;
                }
                if !row.is_valid() {
                    summary.records_invalid += 1;
                    continue;
                }
            }

            papers.push(row.extract());
        }
        summary.records_emitted = papers.len();
        Ok(papers)
    }
}

fn enter(stage: CrawlStage) {
    debug!(%stage, "crawl stage");
}

/// Launch a Chromium session and crawl one profile with it.
pub async fn crawl_profile(
    config: CrawlConfig,
    scholar_id: &str,
    mode: CrawlMode,
) -> Result<CrawlReport, CrawlError> {
    let session = ChromeSession::launch(&config.browser_config()).await?;
    CrawlPipeline::new(config, session)
        .run_and_close(scholar_id, mode)
        .await
}

fn sort_keys(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<String, JsonValue> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            JsonValue::Object(sorted.into_iter().collect())
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Pretty-printed JSON with every object's keys in sorted order.
pub fn render_document(document: &OutputDocument) -> Result<String> {
    let value = serde_json::to_value(document).context("serializing output document")?;
    serde_json::to_string_pretty(&sort_keys(value)).context("rendering output document")
}

/// Write to `output`, or to stdout when no path is given.
pub fn write_document(document: &OutputDocument, output: Option<&Path>) -> Result<()> {
    let rendered = render_document(document)?;
    match output {
        Some(path) => std::fs::write(path, rendered.as_bytes())
            .with_context(|| format!("writing {}", path.display())),
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            lock.write_all(rendered.as_bytes())
                .and_then(|_| lock.write_all(b"\n"))
                .and_then(|_| lock.flush())
                .context("writing output document to stdout")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use scholar_core::{Citation, ProfileInfo, PublicationRecord};
    use tempfile::tempdir;

    /// A page holding nothing but the load-more control.
    struct ControlOnly {
        present: bool,
        enabled_for: usize,
        clicks: Mutex<usize>,
    }

    impl ControlOnly {
        fn new(present: bool, enabled_for: usize) -> Self {
            Self {
                present,
                enabled_for,
                clicks: Mutex::new(0),
            }
        }

        fn clicks(&self) -> usize {
            *self.clicks.lock().unwrap()
        }
    }

    #[async_trait]
    impl BrowserSession for ControlOnly {
        async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn title(&self) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }

        async fn page_source(&self) -> Result<String, BrowserError> {
            Ok(String::new())
        }

        async fn has_element(&self, element_id: &str) -> Result<bool, BrowserError> {
            Ok(self.present && element_id == LOAD_MORE_CONTROL_ID)
        }

        async fn element_attribute(
            &self,
            _element_id: &str,
            attribute: &str,
        ) -> Result<Option<String>, BrowserError> {
            let disabled = self.clicks() >= self.enabled_for;
            Ok((attribute == "disabled" && disabled).then(String::new))
        }

        async fn click_element(&self, element_id: &str) -> Result<(), BrowserError> {
            if !self.present {
                return Err(BrowserError::ElementNotFound(element_id.to_string()));
            }
            *self.clicks.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn driver(max_clicks: usize) -> PaginationDriver {
        PaginationDriver::new(LOAD_MORE_CONTROL_ID, Duration::ZERO, max_clicks)
    }

    #[tokio::test]
    async fn pagination_stops_once_control_disables() {
        let session = ControlOnly::new(true, 2);
        let outcome = driver(100).exhaust(&session).await.unwrap();
        assert_eq!(
            outcome,
            PaginationOutcome {
                clicks: 2,
                stop: PaginationStop::Exhausted
            }
        );
        assert_eq!(session.clicks(), 2);
    }

    #[tokio::test]
    async fn missing_control_means_nothing_to_load() {
        let session = ControlOnly::new(false, 5);
        let outcome = driver(100).exhaust(&session).await.unwrap();
        assert_eq!(outcome.stop, PaginationStop::ControlMissing);
        assert_eq!(outcome.clicks, 0);
    }

    #[tokio::test]
    async fn stuck_control_is_capped() {
        let session = ControlOnly::new(true, usize::MAX);
        let outcome = driver(3).exhaust(&session).await.unwrap();
        assert_eq!(
            outcome,
            PaginationOutcome {
                clicks: 3,
                stop: PaginationStop::CapReached
            }
        );
    }

    #[test]
    fn config_reads_lookup_and_falls_back_to_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCHOLAR_SETTLE_DELAY_MS", "50"),
            ("SCHOLAR_DETAIL_ENRICHMENT", "true"),
            ("SCHOLAR_MAX_LOAD_MORE", "not-a-number"),
            ("SCHOLAR_ARTIFACTS_DIR", "/tmp/warnings"),
        ]);
        let config = CrawlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.settle_delay, Duration::from_millis(50));
        assert!(config.detail_enrichment);
        assert_eq!(config.max_load_more, 500);
        assert_eq!(config.artifacts_dir, PathBuf::from("/tmp/warnings"));
        assert_eq!(config.site_origin, SITE_ORIGIN);
        assert!(config.headless);
    }

    #[test]
    fn yaml_file_overlays_only_the_keys_it_sets() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("crawl.yaml");
        std::fs::write(&path, "max_load_more: 7\nheadless: false\nsite_origin: https://mirror.example\n")
            .unwrap();
        let config = CrawlConfig::default().with_file(&path).unwrap();
        assert_eq!(config.max_load_more, 7);
        assert!(!config.headless);
        assert_eq!(config.site_origin, "https://mirror.example");
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.extract_context().site_origin, "https://mirror.example");
    }

    #[test]
    fn yaml_file_rejects_unknown_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("crawl.yaml");
        std::fs::write(&path, "max_clicks: 7\n").unwrap();
        assert!(CrawlConfig::default().with_file(&path).is_err());
    }

    #[test]
    fn rendered_document_has_sorted_keys_and_two_space_indent() {
        let document = OutputDocument::Full {
            metadata: ProfileInfo {
                name: Some("Ada".into()),
                ..Default::default()
            }
            .stamp(Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()),
            papers: vec![PublicationRecord {
                year: Some("2016".into()),
                title: Some("Zeta".into()),
                citation: Some(Citation::Zero),
                local_id: Some("u:1".into()),
                ..Default::default()
            }],
        };
        let rendered = render_document(&document).unwrap();
        let citation = rendered.find("\"citation\"").unwrap();
        let local_id = rendered.find("\"local_id\"").unwrap();
        let title = rendered.find("\"title\"").unwrap();
        let year = rendered.find("\"year\"").unwrap();
        assert!(citation < local_id && local_id < title && title < year);
        assert!(rendered.find("\"metadata\"").unwrap() < rendered.find("\"papers\"").unwrap());
        assert!(rendered.contains("\n  \"metadata\": {\n    \"name\": \"Ada\""));
        assert!(rendered.contains("\"citation\": 0"));
    }

    #[test]
    fn document_is_written_to_a_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let document = OutputDocument::Profile(
            ProfileInfo {
                name: Some("Zoë Ünicode".into()),
                ..Default::default()
            }
            .stamp(Utc::now()),
        );
        write_document(&document, Some(&path)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Zoë Ünicode"));
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        assert!(value.get("time").is_some());
    }
}
