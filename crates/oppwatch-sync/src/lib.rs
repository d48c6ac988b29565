//! Ingestion pipeline orchestration: refresh coordination, enrichment and
//! scoring, and alert generation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oppwatch_core::{
    EnrichedOpportunity, PersistedOpportunity, Source, SourceFormat, UserPreferences,
};
use oppwatch_storage::{
    Fetch, FetchError, HttpClientConfig, HttpFetcher, NewAlert, StorageError, Store,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppwatch-sync";

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    /// Staleness window in minutes before an auto-refresh becomes eligible.
    pub refresh_minutes: u64,
    /// Per-source retention cap.
    pub max_per_source: u32,
    pub auto_refresh: bool,
    pub auto_approve: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub page_size: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("OPPWATCH_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:oppwatch.db".to_string()),
            sources_file: std::env::var("OPPWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            refresh_minutes: env_parse("OPPWATCH_REFRESH_MINUTES", 720),
            max_per_source: env_parse("OPPWATCH_MAX_PER_SOURCE", 200),
            auto_refresh: env_flag("OPPWATCH_AUTO_REFRESH", false),
            auto_approve: env_flag("OPPWATCH_AUTO_APPROVE", true),
            http_timeout_secs: env_parse("OPPWATCH_HTTP_TIMEOUT_SECS", 15),
            user_agent: std::env::var("OPPWATCH_USER_AGENT")
                .unwrap_or_else(|_| "oppwatch-bot/0.1".to_string()),
            page_size: env_parse("OPPWATCH_PAGE_SIZE", 24),
            scheduler_enabled: env_flag("OPPWATCH_SCHEDULER_ENABLED", false),
            sync_cron_1: std::env::var("OPPWATCH_SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("OPPWATCH_SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub endpoint: String,
    pub format: SourceFormat,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    /// The feeds every fresh deployment starts with.
    pub fn builtin() -> Self {
        let spec = |name: &str, endpoint: &str, format| SourceSpec {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            format,
            enabled: true,
        };
        Self {
            sources: vec![
                spec("RemoteOK Jobs", "https://remoteok.com/api", SourceFormat::Json),
                spec(
                    "We Work Remotely",
                    "https://weworkremotely.com/categories/remote-programming-jobs.rss",
                    SourceFormat::Rss,
                ),
                spec(
                    "Arbeitnow Job Board",
                    "https://www.arbeitnow.com/api/job-board-api",
                    SourceFormat::Json,
                ),
            ],
        }
    }

    /// Read the registry from a YAML file, falling back to the built-in list
    /// when no file is present.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Register any sources the store does not know yet (keyed by endpoint).
    /// Returns how many were added.
    pub async fn seed(&self, store: &Store) -> Result<usize, StorageError> {
        let mut added = 0;
        for spec in &self.sources {
            if store
                .ensure_source(&spec.name, &spec.endpoint, spec.format, spec.enabled)
                .await?
            {
                added += 1;
            }
        }
        Ok(added)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub failed_sources: usize,
    pub inserted: usize,
}

pub struct IngestPipeline {
    store: Store,
    fetcher: Arc<dyn Fetch>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(store: Store, fetcher: Arc<dyn Fetch>, config: IngestConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// One full refresh: every enabled source is fetched, parsed,
    /// deduplicated, upserted, and trimmed. Failures are isolated per source.
    pub async fn run_once(&self) -> Result<IngestRunSummary, StorageError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let sources = self.store.enabled_sources().await?;

        let mut inserted = 0usize;
        let mut failed_sources = 0usize;
        for source in &sources {
            match self.ingest_source(run_id, source).await {
                Ok(count) => inserted += count,
                Err(err) => {
                    warn!(source = %source.name, error = %err, "source skipped this cycle");
                    failed_sources += 1;
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            %run_id,
            sources = sources.len(),
            failed_sources,
            inserted,
            "ingest run finished"
        );
        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: sources.len(),
            failed_sources,
            inserted,
        })
    }

    async fn ingest_source(&self, run_id: Uuid, source: &Source) -> Result<usize, IngestError> {
        let payload = self
            .fetcher
            .fetch(run_id, &source.name, &source.endpoint)
            .await?;

        // A payload that fails to parse still counts as a completed (empty)
        // cycle for the source; only fetch failures leave last_fetched alone.
        let records = match oppwatch_adapters::parse(source.format, &payload, &source.name) {
            Ok(records) => records,
            Err(err) => {
                warn!(source = %source.name, error = %err, "unparseable payload");
                Vec::new()
            }
        };

        let fetched_at = Utc::now();
        let mut inserted = 0;
        for record in &records {
            if record.title.trim().is_empty() {
                continue;
            }
            if self
                .store
                .insert_opportunity(source.id, record, self.config.auto_approve, fetched_at)
                .await?
            {
                inserted += 1;
            }
        }

        self.store
            .touch_source_last_fetched(source.id, Utc::now())
            .await?;
        self.store
            .trim_source(source.id, self.config.max_per_source)
            .await?;
        Ok(inserted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshOutcome {
    Started,
    AlreadyRunning,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Started => "started",
            RefreshOutcome::AlreadyRunning => "already-running",
        }
    }
}

/// Single-flight refresh trigger. At most one ingest run is in flight
/// process-wide; concurrent requests are answered synchronously with
/// `AlreadyRunning` and never block.
pub struct RefreshCoordinator {
    pipeline: Arc<IngestPipeline>,
    in_flight: Arc<AtomicBool>,
}

struct InFlightReset(Arc<AtomicBool>);

impl Drop for InFlightReset {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshCoordinator {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            pipeline,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the in-flight flag and launch the pipeline on a background task.
    /// The drop guard clears the flag on every exit path, panics included.
    pub fn request_refresh(&self) -> RefreshOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefreshOutcome::AlreadyRunning;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let reset = InFlightReset(Arc::clone(&self.in_flight));
        tokio::spawn(async move {
            let _reset = reset;
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    failed_sources = summary.failed_sources,
                    "background refresh finished"
                ),
                Err(err) => warn!(error = %err, "background refresh failed"),
            }
        });
        RefreshOutcome::Started
    }
}

/// Everything a caller needs to serve and refresh opportunities.
#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub config: IngestConfig,
    pub pipeline: Arc<IngestPipeline>,
    pub coordinator: Arc<RefreshCoordinator>,
}

/// Wire up store, registry, fetcher, pipeline, and coordinator from config.
pub async fn bootstrap(config: IngestConfig) -> Result<AppContext> {
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    let registry = SourceRegistry::load_or_builtin(&config.sources_file)?;
    let added = registry.seed(&store).await?;
    if added > 0 {
        info!(added, "seeded default sources");
    }

    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        fetcher,
        config.clone(),
    ));
    let coordinator = Arc::new(RefreshCoordinator::new(Arc::clone(&pipeline)));
    Ok(AppContext {
        store,
        config,
        pipeline,
        coordinator,
    })
}

/// Run a single foreground ingest with everything built from the
/// environment.
pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let ctx = bootstrap(IngestConfig::from_env()).await?;
    Ok(ctx.pipeline.run_once().await?)
}

/// Decide whether the read path should kick off a background refresh:
/// always when the cache is empty, otherwise only when auto-refresh is on
/// and the newest successful fetch is older than the staleness window.
/// Never blocks; the caller serves whatever is cached right now.
pub async fn maybe_trigger_refresh(
    ctx: &AppContext,
) -> Result<Option<RefreshOutcome>, StorageError> {
    if !ctx.store.has_enabled_sources().await? {
        return Ok(None);
    }
    if ctx.store.count_opportunities().await? == 0 {
        return Ok(Some(ctx.coordinator.request_refresh()));
    }
    if ctx.config.auto_refresh {
        if let Some(latest) = ctx.store.latest_fetch_timestamp().await? {
            let window = chrono::Duration::minutes(ctx.config.refresh_minutes as i64);
            if Utc::now() - latest > window {
                return Ok(Some(ctx.coordinator.request_refresh()));
            }
        }
    }
    Ok(None)
}

/// The live list: cached rows when there are any, the fallback seed list
/// otherwise, enriched against the user's preferences either way.
pub async fn live_opportunities(
    ctx: &AppContext,
    user_id: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<EnrichedOpportunity>, StorageError> {
    let _ = maybe_trigger_refresh(ctx).await?;

    let prefs = match user_id {
        Some(id) => ctx.store.preferences(id).await?,
        None => None,
    };
    let cached = ctx.store.recent_opportunities(limit, false).await?;
    if !cached.is_empty() {
        return Ok(enrich(cached, prefs.as_ref()));
    }

    let mut seeds = fallback_opportunities();
    if let Some(limit) = limit {
        seeds.truncate(limit.max(0) as usize);
    }
    Ok(enrich(seeds, prefs.as_ref()))
}

/// Lowercase and drop everything but alphanumerics and spaces; the building
/// block of the cross-source dedup key.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Fixed ordered keyword match over title + description; first hit wins.
pub fn categorize(title: &str, description: &str) -> &'static str {
    let text = format!("{title} {description}").to_lowercase();
    let hits = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));
    if hits(&["intern", "internship", "summer intern"]) {
        "Internship"
    } else if hits(&["scholarship", "grant", "fellowship"]) {
        "Scholarship/Fellowship"
    } else if hits(&["hackathon", "competition"]) {
        "Hackathon"
    } else if hits(&["bootcamp", "training", "academy"]) {
        "Training"
    } else {
        "Opportunity"
    }
}

/// Whitespace-collapsed description truncated to 160 chars, with an ellipsis
/// when something was cut.
pub fn summarize(description: &str) -> String {
    let clean = description.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.chars().count() > 160 {
        let mut summary: String = clean.chars().take(160).collect();
        summary.push('…');
        summary
    } else {
        clean
    }
}

/// Relative ranking signal: +2 per keyword found in title or company, +1 per
/// region hit, +1 per type hit. No preferences means 0.
pub fn relevance(opp: &PersistedOpportunity, prefs: Option<&UserPreferences>) -> u32 {
    let Some(prefs) = prefs else {
        return 0;
    };
    let title = opp.title.to_lowercase();
    let company = opp.company.to_lowercase();
    let region = opp.region.to_lowercase();
    let kind = opp.kind.to_lowercase();

    let mut score = 0;
    for keyword in prefs.keyword_tokens() {
        if title.contains(&keyword) || company.contains(&keyword) {
            score += 2;
        }
    }
    for wanted in prefs.region_tokens() {
        if region.contains(&wanted) {
            score += 1;
        }
    }
    for wanted in prefs.type_tokens() {
        if kind.contains(&wanted) {
            score += 1;
        }
    }
    score
}

/// Cross-source merge + enrichment. The dedup key here is
/// normalized(title)|normalized(company) with the first occurrence winning,
/// distinct from the per-source (title, url) key applied at ingestion time.
pub fn enrich(
    opportunities: Vec<PersistedOpportunity>,
    prefs: Option<&UserPreferences>,
) -> Vec<EnrichedOpportunity> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for opp in opportunities {
        let key = format!(
            "{}|{}",
            normalize_text(&opp.title),
            normalize_text(&opp.company)
        );
        if !seen.insert(key) {
            continue;
        }
        let category = categorize(&opp.title, &opp.description).to_string();
        let summary = summarize(&opp.description);
        let relevance = relevance(&opp, prefs);
        out.push(EnrichedOpportunity {
            opportunity: opp,
            category,
            summary,
            relevance,
        });
    }
    out
}

#[derive(Debug, Default, Clone)]
pub struct OpportunityFilter {
    /// Substring match over title or company.
    pub query: Option<String>,
    pub region: Option<String>,
    pub kind: Option<String>,
}

pub fn filter_opportunities(
    opportunities: &[EnrichedOpportunity],
    filter: &OpportunityFilter,
) -> Vec<EnrichedOpportunity> {
    let query = filter.query.as_deref().map(str::to_lowercase);
    let region = filter.region.as_deref().map(str::to_lowercase);
    let kind = filter.kind.as_deref().map(str::to_lowercase);

    opportunities
        .iter()
        .filter(|e| {
            let opp = &e.opportunity;
            if let Some(q) = &query {
                if !opp.title.to_lowercase().contains(q) && !opp.company.to_lowercase().contains(q)
                {
                    return false;
                }
            }
            if let Some(r) = &region {
                if !opp.region.to_lowercase().contains(r) {
                    return false;
                }
            }
            if let Some(k) = &kind {
                if !opp.kind.to_lowercase().contains(k) {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect()
}

/// Generate alert-queue entries for a user from the live enriched list.
/// Stops once `limit` opportunities have generated; when a preferences row
/// exists, opportunities scoring below 2 are skipped. Inserts are idempotent,
/// so re-runs are no-ops. Returns how many opportunities produced at least
/// one alert attempt.
pub async fn generate_alerts(
    ctx: &AppContext,
    user_id: i64,
    limit: usize,
) -> Result<usize, StorageError> {
    let prefs = ctx.store.preferences(user_id).await?;
    let channels = prefs
        .as_ref()
        .map(UserPreferences::channels)
        .unwrap_or_else(|| vec!["email".to_string()]);

    let opportunities = live_opportunities(ctx, Some(user_id), None).await?;
    let mut generated = 0;
    for enriched in &opportunities {
        if generated >= limit {
            break;
        }
        if prefs.is_some() && enriched.relevance < 2 {
            continue;
        }
        let opp = &enriched.opportunity;
        let source_name = if opp.source_name.is_empty() {
            "external".to_string()
        } else {
            opp.source_name.clone()
        };
        for channel in &channels {
            ctx.store
                .enqueue_alert(&NewAlert {
                    user_id,
                    channel: channel.clone(),
                    source_name: source_name.clone(),
                    source_opportunity_id: opp.id,
                    title: opp.title.clone(),
                    url: opp.url.clone(),
                })
                .await?;
        }
        generated += 1;
    }
    Ok(generated)
}

/// Optional fixed-schedule refresh. Jobs route through the coordinator, so
/// the single-flight invariant holds for scheduled and read-triggered
/// refreshes alike.
pub async fn maybe_build_scheduler(
    config: &IngestConfig,
    coordinator: Arc<RefreshCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let coordinator = Arc::clone(&coordinator);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let coordinator = Arc::clone(&coordinator);
            Box::pin(async move {
                match coordinator.request_refresh() {
                    RefreshOutcome::Started => info!("scheduled refresh started"),
                    RefreshOutcome::AlreadyRunning => {
                        warn!("scheduled refresh skipped; one is already in flight")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Served when storage holds nothing yet: the list is never empty-by-error.
pub fn fallback_opportunities() -> Vec<PersistedOpportunity> {
    let seed = |title: &str,
                company: &str,
                kind: &str,
                region: &str,
                deadline: &str,
                url: &str,
                description: &str,
                salary: &str,
                duration: &str,
                online: bool| PersistedOpportunity {
        id: 0,
        source_id: 0,
        title: title.to_string(),
        company: company.to_string(),
        kind: kind.to_string(),
        region: region.to_string(),
        deadline: deadline.to_string(),
        url: url.to_string(),
        description: description.to_string(),
        salary: salary.to_string(),
        duration: duration.to_string(),
        online,
        source_name: "Official".to_string(),
        approved: true,
        fetched_at: Utc::now(),
    };

    vec![
        seed(
            "Google Summer Internship 2026",
            "Google",
            "Internship",
            "Multiple (Global)",
            "2026-03-15",
            "https://careers.google.com/internships/",
            "Paid internship at Google offices worldwide",
            "$25-35/hour",
            "12 weeks",
            true,
        ),
        seed(
            "Microsoft TEALS Fellowship",
            "Microsoft",
            "Fellowship",
            "USA + International",
            "2026-04-01",
            "https://www.microsoft.com/en-us/teals",
            "Tech education and mentorship program",
            "Scholarship",
            "Full Year",
            true,
        ),
        seed(
            "Goldman Sachs Internship Program",
            "Goldman Sachs",
            "Internship",
            "USA, Europe, Asia",
            "2026-02-28",
            "https://www.goldmansachs.com/careers/",
            "Summer analyst program with mentorship",
            "$30-40/hour",
            "10 weeks",
            false,
        ),
        seed(
            "Accenture Cloud Academy",
            "Accenture",
            "Training + Internship",
            "India, USA",
            "2026-03-31",
            "https://www.accenture.com/careers/",
            "Cloud technology training and internship",
            "Stipend + Offer",
            "3-6 months",
            true,
        ),
        seed(
            "McKinsey Forward Program",
            "McKinsey & Company",
            "Consulting Internship",
            "Global",
            "2026-03-20",
            "https://www.mckinsey.com/careers/",
            "Leadership development and consulting experience",
            "$40-50/hour",
            "8-12 weeks",
            false,
        ),
        seed(
            "Amazon Leadership Development Internship",
            "Amazon",
            "Internship",
            "USA, Europe, India",
            "2026-04-10",
            "https://www.amazon.jobs/internships",
            "Tech and business internship with leadership focus",
            "$28-38/hour",
            "12 weeks",
            false,
        ),
        seed(
            "JPMorgan Chase Code for Good",
            "JPMorgan Chase",
            "Hackathon + Internship",
            "USA, Europe, Asia",
            "2026-03-15",
            "https://www.jpmorganchase.com/careers",
            "Tech hackathon for social impact + job opportunities",
            "Award + Internship",
            "Variable",
            true,
        ),
        seed(
            "IBM Accelerate Program",
            "IBM",
            "Early Talent",
            "USA, Europe",
            "2026-03-10",
            "https://www.ibm.com/careers/",
            "Early talent program with mentorship and skills training",
            "Stipend",
            "8 weeks",
            true,
        ),
        seed(
            "NVIDIA Deep Learning Institute Internship",
            "NVIDIA",
            "Research Internship",
            "USA, Taiwan",
            "2026-03-28",
            "https://www.nvidia.com/en-us/about-nvidia/careers/",
            "AI research internship with GPU computing focus",
            "$32-45/hour",
            "12 weeks",
            false,
        ),
        seed(
            "Stripe University Internship",
            "Stripe",
            "Internship",
            "USA, Ireland",
            "2026-03-18",
            "https://stripe.com/jobs",
            "Engineering and product internships with impact projects",
            "$35-50/hour",
            "12 weeks",
            false,
        ),
        seed(
            "UNICEF Innovation Internship",
            "UNICEF",
            "Nonprofit Internship",
            "Global",
            "2026-03-14",
            "https://www.unicef.org/careers",
            "Innovation and digital development internships",
            "Stipend",
            "12 weeks",
            true,
        ),
        seed(
            "NASA Pathways Internship",
            "NASA",
            "Government Internship",
            "USA",
            "2026-02-26",
            "https://www.nasa.gov/careers/",
            "STEM internships with NASA centers",
            "$22-30/hour",
            "10-16 weeks",
            false,
        ),
    ]
}
