//! Ingestion scheduler: fixed-interval cycles over registered source
//! adapters, with per-source and per-item fault containment.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sigstack_adapters::{
    bbc_world_rss_adapter, hacker_news_adapter, HttpClientConfig, SourceAdapter,
};
use sigstack_core::{normalize, NewItem};
use sigstack_store::{PersistenceError, Store};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sigstack-ingest";

/// Worker configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl IngestConfig {
    /// Reads the worker configuration. `DATABASE_URL` is required; the
    /// remaining knobs default.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            interval: Duration::from_secs(
                std::env::var("INGEST_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("SIGSTACK_USER_AGENT")
                .unwrap_or_else(|_| "signalstack-worker/0.1".to_string()),
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Upsert seam between the scheduler and the store, so cycle semantics stay
/// testable without a database.
#[async_trait]
pub trait ItemSink: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn upsert(&self, item: &NewItem, fetched_at: DateTime<Utc>)
        -> Result<(), Self::Error>;
}

#[async_trait]
impl ItemSink for Store {
    type Error = PersistenceError;

    async fn upsert(
        &self,
        item: &NewItem,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        Store::upsert(self, item, fetched_at).await
    }
}

/// Outcome of one pass over all registered adapters.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub failed_items: usize,
}

pub struct Ingestor<S: ItemSink> {
    sink: S,
    adapters: Vec<Box<dyn SourceAdapter>>,
    interval: Duration,
}

impl<S: ItemSink> Ingestor<S> {
    pub fn new(sink: S, adapters: Vec<Box<dyn SourceAdapter>>, interval: Duration) -> Self {
        Self {
            sink,
            adapters,
            interval,
        }
    }

    /// Runs one cycle: fetch, normalize, upsert, in fixed adapter order.
    ///
    /// A failing adapter skips to the next source; a failing upsert skips to
    /// the next record. Neither aborts the cycle — the next cycle retries,
    /// since sources re-offer their items and upserts are idempotent.
    pub async fn run_cycle(&self) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut sources_ok = 0usize;
        let mut sources_failed = 0usize;
        let mut upserted = 0usize;
        let mut rejected = 0usize;
        let mut failed_items = 0usize;

        for adapter in &self.adapters {
            let source = adapter.source();
            let records = match adapter.fetch().await {
                Ok(records) => records,
                Err(err) => {
                    warn!(%run_id, source, error = %err, "source fetch failed; retrying next cycle");
                    sources_failed += 1;
                    continue;
                }
            };
            sources_ok += 1;

            for record in records {
                let Some(item) = normalize(source, record) else {
                    rejected += 1;
                    continue;
                };
                match self.sink.upsert(&item, Utc::now()).await {
                    Ok(()) => upserted += 1,
                    Err(err) => {
                        warn!(
                            %run_id,
                            source,
                            external_id = %item.external_id,
                            error = %err,
                            "item upsert failed; retrying next cycle"
                        );
                        failed_items += 1;
                    }
                }
            }
        }

        CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources_ok,
            sources_failed,
            upserted,
            rejected,
            failed_items,
        }
    }

    /// Cycles indefinitely with a fixed sleep between passes. Never returns;
    /// termination is external (process signal handled by the binary).
    pub async fn run_forever(&self) {
        loop {
            let summary = self.run_cycle().await;
            info!(
                run_id = %summary.run_id,
                sources_ok = summary.sources_ok,
                sources_failed = summary.sources_failed,
                upserted = summary.upserted,
                rejected = summary.rejected,
                failed_items = summary.failed_items,
                "ingest cycle complete"
            );
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Fixed adapter registration order: feed first, then the page scrape.
pub fn default_adapters(
    http: &HttpClientConfig,
) -> Result<Vec<Box<dyn SourceAdapter>>, sigstack_adapters::FetchError> {
    Ok(vec![
        Box::new(bbc_world_rss_adapter(http)?),
        Box::new(hacker_news_adapter(http)?),
    ])
}

async fn ingestor_from_env(config: &IngestConfig) -> anyhow::Result<Ingestor<Store>> {
    let store = Store::connect(&config.database_url)
        .await
        .context("connecting to the item store")?;
    // Schema failure here is fatal: the worker must not cycle without it.
    store
        .ensure_schema()
        .await
        .context("initializing the item schema")?;
    let adapters = default_adapters(&config.http_config()).context("building source adapters")?;
    Ok(Ingestor::new(store, adapters, config.interval))
}

/// Worker entry point: connect, bootstrap the schema, then cycle forever.
pub async fn run_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;
    let ingestor = ingestor_from_env(&config).await?;
    ingestor.run_forever().await;
    Ok(())
}

/// Single-cycle entry point for ad-hoc runs.
pub async fn run_once_from_env() -> anyhow::Result<CycleSummary> {
    let config = IngestConfig::from_env()?;
    let ingestor = ingestor_from_env(&config).await?;
    Ok(ingestor.run_cycle().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigstack_adapters::FetchError;
    use sigstack_core::RawRecord;
    use std::collections::BTreeMap;
    use std::fmt;
    use std::sync::Mutex;

    struct StaticAdapter {
        source: &'static str,
        records: Vec<RawRecord>,
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source(&self) -> &str {
            self.source
        }

        async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
            Ok(self.records.clone())
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self) -> Result<Vec<RawRecord>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: "http://flaky/".to_string(),
            })
        }
    }

    #[derive(Debug)]
    struct SinkRefused;

    impl fmt::Display for SinkRefused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "sink refused the item")
        }
    }

    impl std::error::Error for SinkRefused {}

    /// In-memory sink keyed like the real table's uniqueness constraint.
    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<BTreeMap<(String, String), (NewItem, DateTime<Utc>)>>,
        refuse_source: Option<&'static str>,
    }

    #[async_trait]
    impl ItemSink for MemorySink {
        type Error = SinkRefused;

        async fn upsert(
            &self,
            item: &NewItem,
            fetched_at: DateTime<Utc>,
        ) -> Result<(), Self::Error> {
            if self.refuse_source == Some(item.source.as_str()) {
                return Err(SinkRefused);
            }
            self.rows.lock().unwrap().insert(
                (item.source.clone(), item.external_id.clone()),
                (item.clone(), fetched_at),
            );
            Ok(())
        }
    }

    fn raw(id: Option<&str>, title: &str, url: &str) -> RawRecord {
        RawRecord {
            external_id: id.map(String::from),
            title: Some(title.to_string()),
            url: Some(url.to_string()),
            published_at: None,
        }
    }

    fn ingestor(
        adapters: Vec<Box<dyn SourceAdapter>>,
        sink: MemorySink,
    ) -> Ingestor<MemorySink> {
        Ingestor::new(sink, adapters, Duration::from_secs(60))
    }

    #[test]
    fn config_requires_database_url() {
        // Single test owns this variable so parallel tests never race on it.
        std::env::remove_var("DATABASE_URL");
        assert!(IngestConfig::from_env().is_err());

        std::env::set_var("DATABASE_URL", "postgres://w:w@localhost:5432/w");
        let config = IngestConfig::from_env().expect("set url");
        assert_eq!(config.database_url, "postgres://w:w@localhost:5432/w");
        assert_eq!(config.interval, Duration::from_secs(60));
        std::env::remove_var("DATABASE_URL");
    }

    #[tokio::test]
    async fn repeated_cycles_keep_one_row_per_key() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(StaticAdapter {
            source: "feed",
            records: vec![raw(Some("abc"), "Hello", "http://x/1")],
        })];
        let ingestor = ingestor(adapters, MemorySink::default());

        let first = ingestor.run_cycle().await;
        assert_eq!(first.upserted, 1);
        let first_fetched = {
            let rows = ingestor.sink.rows.lock().unwrap();
            rows[&("feed".to_string(), "abc".to_string())].1
        };

        let second = ingestor.run_cycle().await;
        assert_eq!(second.upserted, 1);
        let rows = ingestor.sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[&("feed".to_string(), "abc".to_string())].1 >= first_fetched);
    }

    #[tokio::test]
    async fn invalid_records_never_reach_the_sink() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(StaticAdapter {
            source: "feed",
            records: vec![
                raw(Some("ok"), "Fine", "http://x/ok"),
                raw(Some("no-title"), "   ", "http://x/bad"),
                raw(Some("no-url"), "Missing link", ""),
            ],
        })];
        let ingestor = ingestor(adapters, MemorySink::default());

        let summary = ingestor.run_cycle().await;
        assert_eq!(summary.upserted, 1);
        assert_eq!(summary.rejected, 2);
        assert_eq!(ingestor.sink.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_source_does_not_abort_the_cycle() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(StaticAdapter {
                source: "first",
                records: vec![raw(Some("a"), "A", "http://x/a")],
            }),
            Box::new(FailingAdapter),
            Box::new(StaticAdapter {
                source: "last",
                records: vec![raw(Some("b"), "B", "http://x/b")],
            }),
        ];
        let ingestor = ingestor(adapters, MemorySink::default());

        let summary = ingestor.run_cycle().await;
        assert_eq!(summary.sources_ok, 2);
        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.upserted, 2);

        let rows = ingestor.sink.rows.lock().unwrap();
        assert!(rows.contains_key(&("first".to_string(), "a".to_string())));
        assert!(rows.contains_key(&("last".to_string(), "b".to_string())));
    }

    #[tokio::test]
    async fn failed_upsert_skips_only_that_item() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(StaticAdapter {
                source: "refused",
                records: vec![raw(Some("x"), "X", "http://x/x")],
            }),
            Box::new(StaticAdapter {
                source: "accepted",
                records: vec![raw(Some("y"), "Y", "http://x/y")],
            }),
        ];
        let sink = MemorySink {
            refuse_source: Some("refused"),
            ..MemorySink::default()
        };
        let ingestor = ingestor(adapters, sink);

        let summary = ingestor.run_cycle().await;
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.upserted, 1);
        let rows = ingestor.sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.contains_key(&("accepted".to_string(), "y".to_string())));
    }

    #[tokio::test]
    async fn scrape_identity_is_the_link_itself() {
        // Latent gap kept as designed: a changed link on a scraped source
        // creates a second row because the link is the identity.
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(StaticAdapter {
            source: "scrape",
            records: vec![
                raw(None, "Same story", "http://x/old"),
                raw(None, "Same story", "http://x/new"),
            ],
        })];
        let ingestor = ingestor(adapters, MemorySink::default());

        ingestor.run_cycle().await;
        assert_eq!(ingestor.sink.rows.lock().unwrap().len(), 2);
    }
}
