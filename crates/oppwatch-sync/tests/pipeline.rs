//! End-to-end pipeline behavior against an in-memory store and canned
//! payloads: dedup idempotence, retention, failure isolation, single-flight
//! refresh, and alert generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oppwatch_core::{RawOpportunity, SourceFormat, UserPreferences};
use oppwatch_storage::{Fetch, FetchError, Store};
use oppwatch_sync::{
    generate_alerts, live_opportunities, maybe_trigger_refresh, AppContext, IngestConfig,
    IngestPipeline, RefreshCoordinator, RefreshOutcome,
};
use uuid::Uuid;

struct StaticFetcher {
    payloads: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl StaticFetcher {
    fn new(payloads: HashMap<String, Vec<u8>>) -> Self {
        Self {
            payloads,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for StaticFetcher {
    async fn fetch(
        &self,
        _run_id: Uuid,
        _source_name: &str,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.payloads.get(url).cloned().ok_or(FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

fn test_config(max_per_source: u32, auto_refresh: bool) -> IngestConfig {
    IngestConfig {
        database_url: "sqlite::memory:".to_string(),
        sources_file: "sources.yaml".into(),
        refresh_minutes: 720,
        max_per_source,
        auto_refresh,
        auto_approve: true,
        http_timeout_secs: 15,
        user_agent: "oppwatch-test".to_string(),
        page_size: 24,
        scheduler_enabled: false,
        sync_cron_1: "0 0 6 * * *".to_string(),
        sync_cron_2: "0 0 18 * * *".to_string(),
    }
}

fn context_with(store: Store, fetcher: Arc<StaticFetcher>, config: IngestConfig) -> AppContext {
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        fetcher as Arc<dyn Fetch>,
        config.clone(),
    ));
    let coordinator = Arc::new(RefreshCoordinator::new(Arc::clone(&pipeline)));
    AppContext {
        store,
        config,
        pipeline,
        coordinator,
    }
}

async fn wait_until_idle(ctx: &AppContext) {
    for _ in 0..500 {
        if !ctx.coordinator.is_refreshing() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("background refresh did not finish in time");
}

const JSON_URL: &str = "https://jobs.example/api";
const RSS_URL: &str = "https://feed.example/jobs.rss";

fn two_source_payloads() -> HashMap<String, Vec<u8>> {
    let mut payloads = HashMap::new();
    payloads.insert(
        JSON_URL.to_string(),
        br#"{"jobs":[
            {"position":"Backend Engineer","company_name":"Acme","location":"Berlin","url":"https://jobs.example/1"},
            {"position":"Data Intern","company_name":"Initech","url":"https://jobs.example/2"}
        ]}"#
        .to_vec(),
    );
    payloads.insert(
        RSS_URL.to_string(),
        br#"<?xml version="1.0"?><rss version="2.0"><channel>
            <item><title>Remote Rust Developer</title><link>https://feed.example/rust</link>
            <description>Write Rust all day</description></item>
        </channel></rss>"#
            .to_vec(),
    );
    payloads
}

#[tokio::test]
async fn double_ingest_of_unchanged_feeds_adds_nothing() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    store
        .ensure_source("Jobs Feed", RSS_URL, SourceFormat::Rss, true)
        .await
        .unwrap();
    let fetcher = Arc::new(StaticFetcher::new(two_source_payloads()));
    let ctx = context_with(store, fetcher, test_config(200, false));

    let first = ctx.pipeline.run_once().await.unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.failed_sources, 0);
    assert_eq!(ctx.store.count_opportunities().await.unwrap(), 3);

    let second = ctx.pipeline.run_once().await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(ctx.store.count_opportunities().await.unwrap(), 3);
}

#[tokio::test]
async fn ingest_updates_last_fetched_and_approves_per_policy() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let fetcher = Arc::new(StaticFetcher::new(two_source_payloads()));
    let mut config = test_config(200, false);
    config.auto_approve = false;
    let ctx = context_with(store, fetcher, config);

    ctx.pipeline.run_once().await.unwrap();

    let source = &ctx.store.enabled_sources().await.unwrap()[0];
    assert!(source.last_fetched.is_some());
    // Nothing approved, so the default listing is empty.
    assert!(ctx.store.recent_opportunities(None, false).await.unwrap().is_empty());
    assert_eq!(ctx.store.recent_opportunities(None, true).await.unwrap().len(), 2);
}

#[tokio::test]
async fn retention_keeps_only_the_newest_cap_rows() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();

    let mut payloads = HashMap::new();
    let jobs: Vec<String> = (0..5)
        .map(|i| format!(r#"{{"title":"Role {i}","url":"https://jobs.example/{i}"}}"#))
        .collect();
    payloads.insert(
        JSON_URL.to_string(),
        format!(r#"{{"items":[{}]}}"#, jobs.join(",")).into_bytes(),
    );
    let fetcher = Arc::new(StaticFetcher::new(payloads));
    let ctx = context_with(store, fetcher, test_config(3, false));

    ctx.pipeline.run_once().await.unwrap();

    let source_id = ctx.store.enabled_sources().await.unwrap()[0].id;
    assert_eq!(ctx.store.count_for_source(source_id).await.unwrap(), 3);
    let survivors = ctx.store.opportunities_for_source(source_id).await.unwrap();
    let titles: Vec<_> = survivors.iter().map(|o| o.title.as_str()).collect();
    assert_eq!(titles, vec!["Role 4", "Role 3", "Role 2"]);
}

#[tokio::test]
async fn one_failing_source_does_not_abort_the_others() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Dead Feed", "https://dead.example/api", SourceFormat::Json, true)
        .await
        .unwrap();
    store
        .ensure_source("Jobs Feed", RSS_URL, SourceFormat::Rss, true)
        .await
        .unwrap();
    let fetcher = Arc::new(StaticFetcher::new(two_source_payloads()));
    let ctx = context_with(store, fetcher, test_config(200, false));

    let summary = ctx.pipeline.run_once().await.unwrap();
    assert_eq!(summary.failed_sources, 1);
    assert_eq!(summary.inserted, 1);

    let sources = ctx.store.enabled_sources().await.unwrap();
    let dead = sources.iter().find(|s| s.name == "Dead Feed").unwrap();
    let live = sources.iter().find(|s| s.name == "Jobs Feed").unwrap();
    // A fetch failure skips the source before any write.
    assert!(dead.last_fetched.is_none());
    assert!(live.last_fetched.is_some());
}

#[tokio::test]
async fn unparseable_payload_counts_as_an_empty_cycle() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Broken API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let mut payloads = HashMap::new();
    payloads.insert(JSON_URL.to_string(), b"{definitely not json".to_vec());
    let fetcher = Arc::new(StaticFetcher::new(payloads));
    let ctx = context_with(store, fetcher, test_config(200, false));

    let summary = ctx.pipeline.run_once().await.unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.failed_sources, 0);
    // The source completed an (empty) cycle, so its timestamp advances.
    assert!(ctx.store.enabled_sources().await.unwrap()[0].last_fetched.is_some());
}

#[tokio::test]
async fn concurrent_refresh_requests_run_the_pipeline_once() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let fetcher = Arc::new(
        StaticFetcher::new(two_source_payloads()).with_delay(Duration::from_millis(50)),
    );
    let ctx = context_with(store, Arc::clone(&fetcher), test_config(200, false));

    assert_eq!(ctx.coordinator.request_refresh(), RefreshOutcome::Started);
    assert_eq!(
        ctx.coordinator.request_refresh(),
        RefreshOutcome::AlreadyRunning
    );
    wait_until_idle(&ctx).await;

    // One source, one fetch: the second request never launched a run.
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(ctx.store.count_opportunities().await.unwrap(), 2);

    // The flag cleared, so a later request starts a fresh run.
    assert_eq!(ctx.coordinator.request_refresh(), RefreshOutcome::Started);
    wait_until_idle(&ctx).await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn empty_cache_triggers_refresh_and_serves_seeds_meanwhile() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Dead Feed", "https://dead.example/api", SourceFormat::Json, true)
        .await
        .unwrap();
    let fetcher = Arc::new(StaticFetcher::new(HashMap::new()));
    let ctx = context_with(store, Arc::clone(&fetcher), test_config(200, false));

    let served = live_opportunities(&ctx, None, None).await.unwrap();
    assert!(served
        .iter()
        .any(|e| e.opportunity.title == "Google Summer Internship 2026"));
    assert!(served.iter().all(|e| e.opportunity.id == 0));

    wait_until_idle(&ctx).await;
    // The trigger fired even though the source then failed to fetch.
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(ctx.store.count_opportunities().await.unwrap(), 0);
}

#[tokio::test]
async fn staleness_window_gates_the_auto_refresh_trigger() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let source_id = store.enabled_sources().await.unwrap()[0].id;
    let raw = RawOpportunity::titled("Cached Role", "Jobs API");
    store
        .insert_opportunity(source_id, &raw, true, Utc::now())
        .await
        .unwrap();

    let fetcher = Arc::new(StaticFetcher::new(two_source_payloads()));
    let ctx = context_with(store, Arc::clone(&fetcher), test_config(200, true));

    // Fresh fetch timestamp: nothing to do.
    ctx.store
        .touch_source_last_fetched(source_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(maybe_trigger_refresh(&ctx).await.unwrap(), None);

    // Older than the 720 minute window: refresh starts.
    let stale = Utc::now() - chrono::Duration::minutes(721);
    ctx.store
        .touch_source_last_fetched(source_id, stale)
        .await
        .unwrap();
    assert_eq!(
        maybe_trigger_refresh(&ctx).await.unwrap(),
        Some(RefreshOutcome::Started)
    );
    wait_until_idle(&ctx).await;
}

#[tokio::test]
async fn alert_generation_is_idempotent_and_threshold_gated() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let source_id = store.enabled_sources().await.unwrap()[0].id;

    let mut relevant = RawOpportunity::titled("Google Summer Internship", "Jobs API");
    relevant.company = "Google".to_string();
    relevant.url = "https://jobs.example/google".to_string();
    let mut irrelevant = RawOpportunity::titled("Knitting Circle", "Jobs API");
    irrelevant.company = "Crafts Co".to_string();
    store
        .insert_opportunity(source_id, &relevant, true, Utc::now())
        .await
        .unwrap();
    store
        .insert_opportunity(source_id, &irrelevant, true, Utc::now())
        .await
        .unwrap();

    let fetcher = Arc::new(StaticFetcher::new(HashMap::new()));
    let ctx = context_with(store, fetcher, test_config(200, false));
    ctx.store
        .upsert_preferences(&UserPreferences {
            user_id: 7,
            regions: String::new(),
            types: String::new(),
            keywords: "google".to_string(),
            alert_channels: "email, sms".to_string(),
        })
        .await
        .unwrap();

    let generated = generate_alerts(&ctx, 7, 20).await.unwrap();
    assert_eq!(generated, 1);
    let entries = ctx.store.alerts_for_user(7).await.unwrap();
    assert_eq!(entries.len(), 2);
    let channels: Vec<_> = entries.iter().map(|e| e.channel.as_str()).collect();
    assert!(channels.contains(&"email") && channels.contains(&"sms"));

    // Re-running changes nothing: the uniqueness key absorbs the inserts.
    let generated = generate_alerts(&ctx, 7, 20).await.unwrap();
    assert_eq!(generated, 1);
    assert_eq!(ctx.store.alerts_for_user(7).await.unwrap().len(), 2);
}

#[tokio::test]
async fn users_without_preferences_get_ungated_email_alerts() {
    let store = Store::memory().await.unwrap();
    store
        .ensure_source("Jobs API", JSON_URL, SourceFormat::Json, true)
        .await
        .unwrap();
    let source_id = store.enabled_sources().await.unwrap()[0].id;
    for i in 0..3 {
        let raw = RawOpportunity::titled(format!("Role {i}"), "Jobs API");
        store
            .insert_opportunity(source_id, &raw, true, Utc::now())
            .await
            .unwrap();
    }

    let fetcher = Arc::new(StaticFetcher::new(HashMap::new()));
    let ctx = context_with(store, fetcher, test_config(200, false));

    let generated = generate_alerts(&ctx, 9, 2).await.unwrap();
    assert_eq!(generated, 2);
    let entries = ctx.store.alerts_for_user(9).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.channel == "email"));
}
