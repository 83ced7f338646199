use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    alerts::{AlertEngine, FiredAlert},
    assets::AssetCatalog,
    backup::write_auto_backup,
    config::Settings,
    fetcher::{PriceFetcher, PriceQuote, QuoteSource},
    history::{HistoryEntry, HistoryStore},
    preferences::Preferences,
    sink::{PresentationSink, TrackerEvent},
    sources::SourceRegistry,
    store::{Health, SqliteStore, KEY_LAST_PRICES},
    transport::HttpTransport,
};

/// Everything a cycle needs, wired once at startup.
pub struct AppContext {
    pub settings: Settings,
    pub store: SqliteStore,
    pub catalog: AssetCatalog,
    pub fetcher: PriceFetcher,
    pub history: HistoryStore,
    pub sink: Arc<dyn PresentationSink>,
}

impl AppContext {
    pub fn new(
        settings: Settings,
        store: SqliteStore,
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        let catalog = AssetCatalog::builtin();
        let registry = SourceRegistry::standard(&catalog);
        Self::build(settings, store, catalog, registry, transport, sink)
    }

    pub fn build(
        settings: Settings,
        store: SqliteStore,
        catalog: AssetCatalog,
        registry: SourceRegistry,
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        let fetcher = PriceFetcher::new(&settings, registry, transport, store.clone());
        let history = HistoryStore::new(store.clone(), settings.history_cap);
        Self { settings, store, catalog, fetcher, history, sink }
    }
}

/// Previous prices for percent-change rules: the unrounded last-known-good
/// cache first, stored history heads for anything it lacks.
fn seed_previous(ctx: &AppContext) -> HashMap<String, f64> {
    let mut previous: HashMap<String, f64> = ctx.store.load_or(KEY_LAST_PRICES, HashMap::new());
    previous.retain(|_, p| p.is_finite() && *p > 0.0);
    match ctx.history.heads() {
        Ok(heads) => {
            for (asset, price) in heads {
                previous.entry(asset).or_insert(price);
            }
        }
        Err(e) => log::warn!("tracker.seed_previous_failed err={:#}", e),
    }
    previous
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Idle,
    Fetching,
    Updating,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Refresh,
    SelectionChanged(Vec<String>),
    Shutdown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub refreshes_coalesced: u64,
    pub last_cycle_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub quotes: BTreeMap<String, PriceQuote>,
    pub entries: Vec<HistoryEntry>,
    pub fired: Vec<FiredAlert>,
}

pub struct TrackerController {
    ctx: AppContext,
    prefs: Preferences,
    alerts: AlertEngine,
    state: TrackerState,
    /// Prices of the previous cycle, for percent-change rules.
    previous: HashMap<String, f64>,
    current: HashMap<String, f64>,
    stats: CycleStats,
}

impl TrackerController {
    pub fn new(ctx: AppContext) -> Self {
        let prefs = Preferences::load(&ctx.store);
        let alerts = AlertEngine::load(&ctx.store, ctx.settings.alert_reset_band_pct);
        let previous = seed_previous(&ctx);
        log::info!(
            "tracker.init assets={} rules={} seeded={}",
            prefs.selected_assets.join(","),
            alerts.rules().len(),
            previous.len()
        );

        Self {
            ctx,
            prefs,
            alerts,
            state: TrackerState::Idle,
            previous,
            current: HashMap::new(),
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    #[cfg(test)]
    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn current_prices(&self) -> &HashMap<String, f64> {
        &self.current
    }

    #[cfg(test)]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn soft_error(&self, message: String) {
        self.ctx
            .store
            .record_status("tracker", Health::Warn, "soft_error", Some(&message))
            .ok();
        self.ctx.sink.publish(TrackerEvent::SoftError { message });
    }

    /// fetch -> history -> alerts -> sink. An empty fetch keeps the previous
    /// values and reports a soft error.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let started = Instant::now();
        self.state = TrackerState::Fetching;

        let assets = self.ctx.catalog.resolve(&self.prefs.selected_assets);
        let quotes = self.ctx.fetcher.fetch_all(&assets).await;

        if quotes.is_empty() {
            self.state = TrackerState::Idle;
            self.stats.cycles_failed += 1;
            self.soft_error("no prices available this cycle; keeping previous values".to_string());
            return Ok(CycleOutcome::default());
        }

        self.state = TrackerState::Updating;
        let mut outcome = CycleOutcome::default();
        let mut observed: HashMap<String, f64> = HashMap::new();
        let mut append_failures = 0usize;

        for quote in quotes.values() {
            self.current.insert(quote.asset.clone(), quote.value);

            if quote.is_degraded() {
                self.soft_error(format!(
                    "{}: live sources unavailable, showing {} price",
                    quote.asset,
                    quote.source.label().replace('_', " ")
                ));
            }
            // Simulated values are display-only.
            if quote.source == QuoteSource::Simulated {
                self.ctx.sink.publish(TrackerEvent::PriceUpdate {
                    asset: quote.asset.clone(),
                    price: quote.value,
                    change: 0.0,
                    timestamp_ms: quote.timestamp_ms,
                    source: quote.source.label().to_string(),
                });
                continue;
            }

            observed.insert(quote.asset.clone(), quote.value);
            match self.ctx.history.append(&quote.asset, quote.value, quote.timestamp_ms) {
                Ok(entry) => {
                    self.ctx.sink.publish(TrackerEvent::PriceUpdate {
                        asset: entry.asset.clone(),
                        price: entry.price,
                        change: entry.change_from_previous,
                        timestamp_ms: entry.timestamp_ms,
                        source: quote.source.label().to_string(),
                    });
                    outcome.entries.push(entry);
                }
                Err(e) => {
                    append_failures += 1;
                    log::error!("tracker.history_append_failed asset={} err={:#}", quote.asset, e);
                    self.soft_error(format!("{}: could not record price", quote.asset));
                }
            }
        }

        self.alerts.reload(&self.ctx.store);
        outcome.fired = self.alerts.evaluate(&self.ctx.catalog, &observed, &self.previous);
        for fired in &outcome.fired {
            log::info!("alert.fired rule={} asset={} kind={}", fired.rule.id, fired.rule.asset, fired.rule.kind);
            self.ctx.sink.publish(TrackerEvent::AlertFired {
                rule: fired.rule.clone(),
                message: fired.message.clone(),
                sound: self.prefs.sound_enabled,
            });
        }
        if self.alerts.is_dirty() {
            if let Err(e) = self.alerts.sync(&self.ctx.store) {
                log::warn!("alerts.persist_failed err={:#}", e);
            }
        }
        self.previous.extend(observed);
        outcome.quotes = quotes;

        self.state = TrackerState::Idle;
        self.stats.last_cycle_ms = started.elapsed().as_millis() as u64;

        if append_failures > 0 && append_failures == outcome.quotes.len() {
            self.stats.cycles_failed += 1;
            return Err(anyhow!("history unavailable for every asset"));
        }

        self.stats.cycles_ok += 1;
        self.ctx
            .store
            .record_status(
                "tracker",
                Health::Ok,
                "cycle",
                Some(&format!("quotes={} fired={}", outcome.quotes.len(), outcome.fired.len())),
            )
            .ok();
        if self.stats.cycles_ok % self.ctx.settings.stats_log_every.max(1) == 0 {
            self.log_stats();
        }
        Ok(outcome)
    }

    fn log_stats(&self) {
        let f = self.ctx.fetcher.stats();
        log::info!(
            "tracker.stats cycles_ok={} cycles_failed={} coalesced={} last_cycle_ms={} calls={} successes={} failures={} fallbacks={}",
            self.stats.cycles_ok,
            self.stats.cycles_failed,
            self.stats.refreshes_coalesced,
            self.stats.last_cycle_ms,
            f.total_calls,
            f.successes,
            f.failures,
            f.fallbacks
        );
    }

    /// Validates and persists a new selection. Rejected selections change nothing.
    pub fn set_selection(&mut self, ids: Vec<String>) -> Result<()> {
        let mut next = Preferences { selected_assets: ids, ..self.prefs.clone() };
        next.selected_assets = next.unique_selection();
        next.save(&self.ctx.store, &self.ctx.catalog)?;
        self.prefs = next;
        Ok(())
    }

    async fn cycle_logged(&mut self) {
        if let Err(e) = self.run_cycle().await {
            self.state = TrackerState::Idle;
            log::error!("tracker.cycle_failed err={:#}", e);
            let message = format!("refresh failed: {e:#}");
            self.ctx
                .store
                .record_status("tracker", Health::Error, "cycle_failed", Some(&message))
                .ok();
            self.ctx.sink.publish(TrackerEvent::SoftError { message });
        }
    }

    /// Runs a cycle, then folds any commands that queued up meanwhile:
    /// refreshes collapse into the cycle just finished, a selection change
    /// triggers one more cycle. Returns `true` on shutdown.
    async fn cycle_and_coalesce(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
        loop {
            self.cycle_logged().await;

            let mut rerun = false;
            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    Command::Refresh => {
                        self.stats.refreshes_coalesced += 1;
                        log::debug!("tracker.refresh_coalesced");
                    }
                    Command::SelectionChanged(ids) => rerun |= self.apply_selection(ids),
                    Command::Shutdown => return true,
                }
            }
            if !rerun {
                return false;
            }
        }
    }

    fn apply_selection(&mut self, ids: Vec<String>) -> bool {
        match self.set_selection(ids) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("tracker.selection_rejected err={:#}", e);
                self.soft_error(format!("selection rejected: {e:#}"));
                false
            }
        }
    }

    /// Timer, manual refresh, selection change and auto-backup on one task.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) -> Result<()> {
        let period = self.prefs.refresh_interval();
        let mut refresh_tick = tokio::time::interval(period);
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let backup_period = Duration::from_secs(self.ctx.settings.auto_backup_secs);
        let mut backup_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + backup_period, backup_period);
        backup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!(
            "tracker.start refresh_ms={} backup_secs={} store={}",
            period.as_millis(),
            backup_period.as_secs(),
            self.ctx.store.path()
        );

        loop {
            tokio::select! {
                _ = refresh_tick.tick() => {
                    if self.cycle_and_coalesce(&mut cmd_rx).await {
                        break;
                    }
                }
                _ = backup_tick.tick() => {
                    if let Err(e) = write_auto_backup(&self.ctx.store) {
                        log::warn!("backup.auto.failed err={:#}", e);
                    }
                }
                cmd = cmd_rx.recv() => {
                    let run_now = match cmd {
                        None | Some(Command::Shutdown) => break,
                        Some(Command::Refresh) => true,
                        Some(Command::SelectionChanged(ids)) => self.apply_selection(ids),
                    };
                    if run_now {
                        if self.cycle_and_coalesce(&mut cmd_rx).await {
                            break;
                        }
                        refresh_tick.reset();
                    }
                }
            }
        }

        if self.alerts.is_dirty() {
            self.alerts.sync(&self.ctx.store).ok();
        }
        self.ctx
            .store
            .record_status("tracker", Health::Ok, "stopped", None)
            .ok();
        self.log_stats();
        log::info!("tracker.stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alerts::{AlertKind, AlertRule},
        fetcher::testing::{fast_settings, price_source, FakeTransport},
        sink::ChannelSink,
        store::{temp_store, KEY_ALERTS},
    };
    use serde_json::json;

    fn controller(store: SqliteStore, transport: FakeTransport, selection: &[&str]) -> (TrackerController, mpsc::UnboundedReceiver<TrackerEvent>) {
        let catalog = AssetCatalog::builtin();
        Preferences {
            selected_assets: selection.iter().map(|s| s.to_string()).collect(),
            ..Preferences::default()
        }
        .save(&store, &catalog)
        .unwrap();

        let registry = SourceRegistry::default()
            .with_sources("gold", vec![price_source("gold-src")])
            .with_sources("btc", vec![price_source("btc-src")])
            .with_sources("doge", vec![price_source("doge-src")]);
        let (sink, rx) = ChannelSink::channel();
        let ctx = AppContext::build(fast_settings(), store, catalog, registry, Arc::new(transport), Arc::new(sink));
        (TrackerController::new(ctx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TrackerEvent>) -> Vec<TrackerEvent> {
        let mut out = vec![];
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_cycle_records_history_and_fires_default_rule() {
        let store = temp_store();
        let transport = FakeTransport::default().with("http://test/gold-src", json!({"price": 1750.0}));
        let (mut tracker, mut rx) = controller(store.clone(), transport, &["gold"]);

        let outcome = tracker.run_cycle().await.unwrap();
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.fired.len(), 1);
        assert_eq!(tracker.context().history.load("gold")[0].price, 1750.0);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], TrackerEvent::PriceUpdate { asset, price, .. } if asset == "gold" && *price == 1750.0));
        assert!(matches!(&events[1], TrackerEvent::AlertFired { sound: false, .. }));

        // armed flag persisted, so the next cycle stays quiet
        let rules: Vec<AlertRule> = store.get_json(KEY_ALERTS).unwrap().unwrap();
        assert!(rules[0].armed);
        assert!(tracker.run_cycle().await.unwrap().fired.is_empty());
        assert_eq!(tracker.stats().cycles_ok, 2);
    }

    #[tokio::test]
    async fn test_percent_change_uses_seeded_previous_price() {
        let store = temp_store();
        HistoryStore::new(store.clone(), 100).append("btc", 60_000.0, 1).unwrap();
        store
            .put_json(KEY_ALERTS, &vec![AlertRule::new("btc", AlertKind::PercentChangeUp, 3.0)])
            .unwrap();
        let transport = FakeTransport::default().with("http://test/btc-src", json!({"price": "63000"}));
        let (mut tracker, _rx) = controller(store, transport, &["btc"]);

        let outcome = tracker.run_cycle().await.unwrap();
        assert_eq!(outcome.fired.len(), 1);
        assert!(outcome.fired[0].message.contains("increased by 5.00%"));
        assert_eq!(outcome.entries[0].change_from_previous, 3000.0);
    }

    #[tokio::test]
    async fn test_unchanged_price_after_restart_fires_nothing() {
        let store = temp_store();
        HistoryStore::new(store.clone(), 100).append("doge", 0.153, 1).unwrap();
        store.put_json(KEY_LAST_PRICES, &HashMap::from([("doge".to_string(), 0.153)])).unwrap();
        store
            .put_json(KEY_ALERTS, &vec![AlertRule::new("doge", AlertKind::PercentChangeUp, 1.0)])
            .unwrap();
        let transport = FakeTransport::default().with("http://test/doge-src", json!({"price": 0.153}));
        let (mut tracker, _rx) = controller(store, transport, &["doge"]);

        let outcome = tracker.run_cycle().await.unwrap();
        assert_eq!(outcome.quotes["doge"].value, 0.153);
        assert!(outcome.fired.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_keeps_rules_written_by_other_commands() {
        let store = temp_store();
        let transport = FakeTransport::default().with("http://test/gold-src", json!({"price": 1750.0}));
        let (mut tracker, _rx) = controller(store.clone(), transport, &["gold"]);

        let external = vec![
            AlertRule::new("gold", AlertKind::Below, 1800.0),
            AlertRule::new("btc", AlertKind::Above, 100_000.0),
        ];
        store.put_json(KEY_ALERTS, &external).unwrap();

        let outcome = tracker.run_cycle().await.unwrap();
        assert_eq!(outcome.fired.len(), 1);
        assert_eq!(outcome.fired[0].rule.id, external[0].id);

        let rules: Vec<AlertRule> = store.get_json(KEY_ALERTS).unwrap().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].armed);
        assert_eq!(rules[1].id, external[1].id);
    }

    #[tokio::test]
    async fn test_degraded_quote_is_soft_error_not_history() {
        let store = temp_store();
        let (mut tracker, mut rx) = controller(store, FakeTransport::default(), &["btc"]);

        let outcome = tracker.run_cycle().await.unwrap();
        assert_eq!(outcome.quotes["btc"].source, QuoteSource::Simulated);
        assert!(outcome.entries.is_empty());
        assert!(tracker.context().history.load("btc").is_empty());
        assert!(tracker.current_prices()["btc"] > 0.0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, TrackerEvent::SoftError { .. })));
        assert!(events.iter().any(|e| matches!(e, TrackerEvent::PriceUpdate { source, .. } if source == "simulated")));
    }

    #[tokio::test]
    async fn test_empty_fetch_is_soft_error() {
        let store = temp_store();
        let (mut tracker, mut rx) = controller(store.clone(), FakeTransport::default(), &["gold"]);
        // selection no longer resolves to anything in the catalog
        tracker.prefs.selected_assets = vec!["delisted".into()];

        let outcome = tracker.run_cycle().await.unwrap();
        assert!(outcome.quotes.is_empty());
        assert_eq!(tracker.stats().cycles_failed, 1);
        assert!(matches!(drain(&mut rx).as_slice(), [TrackerEvent::SoftError { .. }]));
        assert_eq!(store.component_status("tracker").unwrap().unwrap().level, "warn");
    }

    #[tokio::test]
    async fn test_run_coalesces_queued_refreshes() {
        let store = temp_store();
        let transport = FakeTransport::default().with("http://test/gold-src", json!({"price": 2650.0}));
        let (tracker, _rx) = controller(store.clone(), transport, &["gold"]);

        let (tx, rx) = mpsc::channel(16);
        for _ in 0..3 {
            tx.send(Command::Refresh).await.unwrap();
        }
        tx.send(Command::Shutdown).await.unwrap();
        tracker.run(rx).await.unwrap();

        assert_eq!(HistoryStore::new(store, 100).load("gold").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_selection_keeps_previous() {
        let store = temp_store();
        let transport = FakeTransport::default().with("http://test/gold-src", json!({"price": 2650.0}));
        let (mut tracker, mut rx) = controller(store.clone(), transport, &["gold"]);

        assert!(!tracker.apply_selection(vec![]));
        assert_eq!(tracker.prefs().selected_assets, vec!["gold".to_string()]);
        assert_eq!(Preferences::load(&store).selected_assets, vec!["gold".to_string()]);
        assert!(matches!(drain(&mut rx).as_slice(), [TrackerEvent::SoftError { message }] if message.contains("at least one asset")));

        assert!(tracker.apply_selection(vec!["btc".into(), "gold".into()]));
        assert_eq!(Preferences::load(&store).selected_assets.len(), 2);
    }
}
