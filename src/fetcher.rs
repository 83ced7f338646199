use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    assets::Asset,
    config::Settings,
    errors::SourceError,
    sources::{SourceRegistry, SourceSpec},
    store::{Health, SqliteStore, KEY_LAST_PRICES},
    transport::HttpTransport,
    utils::{jitter, now_ms},
};

/// Provenance of a quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum QuoteSource {
    Live(String),
    LastKnownGood,
    Simulated,
}

impl QuoteSource {
    pub fn label(&self) -> &str {
        match self {
            QuoteSource::Live(name) => name,
            QuoteSource::LastKnownGood => "last_known_good",
            QuoteSource::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset: String,
    pub value: f64,
    pub timestamp_ms: i64,
    pub source: QuoteSource,
}

impl PriceQuote {
    /// Every live source failed and the value came from a fallback.
    pub fn is_degraded(&self) -> bool {
        !matches!(self.source, QuoteSource::Live(_))
    }
}

/// Shared asset -> price map.
#[derive(Clone, Default)]
pub struct PriceBook {
    inner: Arc<RwLock<HashMap<String, f64>>>,
}

impl PriceBook {
    pub fn from_map(map: HashMap<String, f64>) -> Self {
        Self { inner: Arc::new(RwLock::new(map)) }
    }

    pub fn upsert(&self, asset: &str, price: f64) {
        self.inner.write().insert(asset.to_string(), price);
    }

    pub fn get(&self, asset: &str) -> Option<f64> {
        self.inner.read().get(asset).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.inner.read().clone()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallbacks: u64,
}

pub struct PriceFetcher {
    registry: SourceRegistry,
    transport: Arc<dyn HttpTransport>,
    store: SqliteStore,
    timeout: Duration,
    jitter_pct: f64,
    last_good: PriceBook,
    stats: Arc<Mutex<FetchStats>>,
}

impl PriceFetcher {
    pub fn new(
        settings: &Settings,
        registry: SourceRegistry,
        transport: Arc<dyn HttpTransport>,
        store: SqliteStore,
    ) -> Self {
        let persisted: HashMap<String, f64> = store.load_or(KEY_LAST_PRICES, HashMap::new());
        let persisted = persisted
            .into_iter()
            .filter(|(_, p)| p.is_finite() && *p > 0.0)
            .collect::<HashMap<_, _>>();
        log::debug!("fetch.last_good.rehydrated assets={}", persisted.len());

        Self {
            registry,
            transport,
            store,
            timeout: settings.fetch_timeout(),
            jitter_pct: settings.fallback_jitter_pct,
            last_good: PriceBook::from_map(persisted),
            stats: Arc::new(Mutex::new(FetchStats::default())),
        }
    }

    pub fn stats(&self) -> FetchStats {
        self.stats.lock().clone()
    }

    async fn try_source(&self, asset: &Asset, spec: &SourceSpec) -> Result<f64, SourceError> {
        self.stats.lock().total_calls += 1;

        let raw = tokio::time::timeout(self.timeout, self.transport.get_json(&spec.url))
            .await
            .map_err(|_| SourceError::Timeout(self.timeout.as_millis() as u64))??;

        let price = spec.parser.parse(&raw)?;
        if !asset.is_plausible(price) {
            return Err(SourceError::Implausible {
                value: price,
                min: asset.min_plausible,
                max: asset.max_plausible,
            });
        }
        Ok(price)
    }

    /// Tries each source in order; never fails. Falls back to the
    /// last-known-good price, then to a perturbed reference price.
    pub async fn fetch_price(&self, asset: &Asset) -> PriceQuote {
        match self.registry.sources_for(&asset.id) {
            Ok(sources) => {
                if let Some(quote) = self.try_sources(asset, sources).await {
                    return quote;
                }
                self.store
                    .record_status("fetch", Health::Warn, "all_sources_failed", Some(&asset.id))
                    .ok();
            }
            Err(e) => log::debug!("fetch.skip_live asset={} reason={}", asset.id, e),
        }

        self.stats.lock().fallbacks += 1;
        let (value, source) = match self.last_good.get(&asset.id) {
            Some(p) => (p, QuoteSource::LastKnownGood),
            None => {
                let mut rng = rand::rng();
                let p = jitter(&mut rng, asset.fallback_price, self.jitter_pct);
                (p.max(f64::MIN_POSITIVE), QuoteSource::Simulated)
            }
        };
        log::info!("fetch.fallback asset={} source={} price={}", asset.id, source.label(), value);

        PriceQuote {
            asset: asset.id.clone(),
            value,
            timestamp_ms: now_ms(),
            source,
        }
    }

    /// First source yielding a valid price, in order.
    async fn try_sources(&self, asset: &Asset, sources: &[SourceSpec]) -> Option<PriceQuote> {
        for spec in sources {
            match self.try_source(asset, spec).await {
                Ok(price) => {
                    self.stats.lock().successes += 1;
                    self.remember(&asset.id, price);
                    log::debug!("fetch.ok asset={} source={} price={}", asset.id, spec.name, price);
                    return Some(PriceQuote {
                        asset: asset.id.clone(),
                        value: price,
                        timestamp_ms: now_ms(),
                        source: QuoteSource::Live(spec.name.clone()),
                    });
                }
                Err(e) => {
                    self.stats.lock().failures += 1;
                    log::warn!("fetch.source.failed asset={} source={} err={}", asset.id, spec.name, e);
                }
            }
        }
        None
    }

    /// One concurrent fetch per asset; one asset's failures never affect another.
    pub async fn fetch_all(&self, assets: &[Asset]) -> BTreeMap<String, PriceQuote> {
        let futs = assets.iter().map(|a| async move { (a.id.clone(), self.fetch_price(a).await) });
        futures::future::join_all(futs).await.into_iter().collect()
    }

    fn remember(&self, asset_id: &str, price: f64) {
        self.last_good.upsert(asset_id, price);
        if let Err(e) = self.store.put_json(KEY_LAST_PRICES, &self.last_good.snapshot()) {
            log::warn!("fetch.last_good.persist_failed asset={} err={:#}", asset_id, e);
        }
    }
}
