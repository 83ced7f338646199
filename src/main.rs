mod alerts;
mod analytics;
mod assets;
mod backup;
mod config;
mod errors;
mod fetcher;
mod history;
mod preferences;
mod sink;
mod sources;
mod store;
mod tracker;
mod transport;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};

use crate::{
    alerts::{AlertEngine, AlertKind},
    analytics::{profit_loss, AnalyticsReport},
    assets::{Asset, AssetCatalog},
    config::Settings,
    errors::ConfigError,
    history::HistoryStore,
    preferences::Preferences,
    sink::LogSink,
    store::{SqliteStore, KEY_LAST_PRICES},
    tracker::{AppContext, Command, TrackerController},
    transport::ReqwestTransport,
    utils::format_ts_ms,
};

#[derive(Debug, Parser)]
#[command(name = "pricewatch", version, about = "Multi-source price tracker with history, analytics and alerts")]
struct Cli {
    /// Override STORE_PATH
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start the refresh loop (default). stdin: r = refresh, s <ids> = select, q = quit
    Run,
    /// Run a single cycle and print the result
    Once,
    /// Print stored history, newest first
    History {
        asset: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete stored history for an asset
    Clear { asset: String },
    /// Print the analytics report for an asset
    Report { asset: String },
    /// Profit/loss of a position against the latest stored price
    Pnl {
        asset: String,
        #[arg(long)]
        buy: f64,
        #[arg(long, default_value_t = 1.0)]
        amount: f64,
    },
    /// Manage alert rules
    Alerts {
        #[command(subcommand)]
        action: Option<AlertsCmd>,
    },
    /// Replace the tracked asset selection
    Select { assets: Vec<String> },
    /// Show or change preferences
    Prefs {
        #[arg(long)]
        refresh_ms: Option<u64>,
        #[arg(long, value_parser = parse_on_off)]
        sound: Option<bool>,
        #[arg(long)]
        theme: Option<String>,
    },
    /// Write a backup document
    Export { path: PathBuf },
    /// Restore from a backup document
    Import { path: PathBuf },
    /// Component health as recorded by the last run
    Status,
    /// Forget preferences, alert rules and last-known prices (keeps history)
    Reset,
}

#[derive(Debug, Subcommand)]
enum AlertsCmd {
    List,
    /// kind: above | below | change_up | change_down
    Add { asset: String, kind: String, threshold: f64 },
    Remove { id: String },
    Toggle { id: String },
}

fn parse_on_off(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on|off, got {other}")),
    }
}

fn asset_or_err<'a>(catalog: &'a AssetCatalog, id: &str) -> Result<&'a Asset> {
    catalog
        .get(id)
        .ok_or_else(|| ConfigError::UnknownAsset(id.to_string()).into())
}

fn spawn_stdin_commands(tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            let cmd = match line.split_once(' ').map(|(c, rest)| (c, rest.trim())).unwrap_or((line, "")) {
                ("r" | "refresh", _) => Command::Refresh,
                ("q" | "quit", _) => Command::Shutdown,
                ("s" | "select", ids) => Command::SelectionChanged(
                    ids.split([',', ' ']).filter(|s| !s.is_empty()).map(|s| s.to_string()).collect(),
                ),
                ("", _) => continue,
                (other, _) => {
                    log::info!("stdin.unknown_command input={} hint=r|s <ids>|q", other);
                    continue;
                }
            };
            let quit = cmd == Command::Shutdown;
            if tx.send(cmd).await.is_err() || quit {
                break;
            }
        }
    });
}

fn spawn_ctrl_c(tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("app.ctrl_c");
            let _ = tx.send(Command::Shutdown).await;
        }
    });
}

fn build_tracker(settings: Settings, store: SqliteStore) -> Result<TrackerController> {
    let transport = ReqwestTransport::new(&settings.http_user_agent, settings.fetch_timeout())?;
    let ctx = AppContext::new(settings, store, Arc::new(transport), Arc::new(LogSink));
    Ok(TrackerController::new(ctx))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(path) = cli.store {
        settings.store_path = path;
        settings.validate()?;
    }

    let store = SqliteStore::new(&settings.store_path)?;
    store.init_db()?;
    let catalog = AssetCatalog::builtin();
    log::debug!("app.start store={} history_cap={}", store.path(), settings.history_cap);

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => {
            let tracker = build_tracker(settings, store)?;
            let (tx, rx) = mpsc::channel::<Command>(32);
            spawn_stdin_commands(tx.clone());
            spawn_ctrl_c(tx);
            tracker.run(rx).await?;
        }
        Cmd::Once => {
            let mut tracker = build_tracker(settings, store)?;
            let outcome = tracker.run_cycle().await?;
            log::debug!("once.done state={:?} last_cycle_ms={}", tracker.state(), tracker.stats().last_cycle_ms);
            for (id, q) in &outcome.quotes {
                let shown = catalog.get(id).map(|a| a.format_price(q.value)).unwrap_or_else(|| q.value.to_string());
                println!("{:<10} {:>16}  {:<16} {}", id, shown, q.source.label(), format_ts_ms(q.timestamp_ms));
            }
            for f in &outcome.fired {
                println!("ALERT {}", f.message);
            }
        }
        Cmd::History { asset, limit } => {
            let a = asset_or_err(&catalog, &asset)?;
            let history = HistoryStore::new(store, settings.history_cap);
            for e in history.load(&a.id).iter().take(limit) {
                println!(
                    "{}  {:>16}  {:+.2}",
                    format_ts_ms(e.timestamp_ms),
                    a.format_price(e.price),
                    e.change_from_previous
                );
            }
        }
        Cmd::Clear { asset } => {
            let a = asset_or_err(&catalog, &asset)?;
            HistoryStore::new(store, settings.history_cap).clear(&a.id)?;
        }
        Cmd::Report { asset } => {
            let a = asset_or_err(&catalog, &asset)?;
            let history = HistoryStore::new(store, settings.history_cap).load(&a.id);
            match AnalyticsReport::build(a, &history) {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("no history for {}", a.id),
            }
        }
        Cmd::Pnl { asset, buy, amount } => {
            let a = asset_or_err(&catalog, &asset)?;
            let latest = HistoryStore::new(store.clone(), settings.history_cap)
                .load(&a.id)
                .first()
                .map(|e| e.price)
                .or_else(|| {
                    store
                        .load_or(KEY_LAST_PRICES, std::collections::HashMap::<String, f64>::new())
                        .get(&a.id)
                        .copied()
                })
                .ok_or_else(|| anyhow!("no known price for {}; run `pricewatch once` first", a.id))?;
            let pl = profit_loss(buy, latest, amount);
            println!(
                "{} current={} profit={:+.2} ({:+.2}%) value={:.2}",
                a.id,
                a.format_price(latest),
                pl.profit,
                pl.percentage,
                pl.total_value
            );
        }
        Cmd::Alerts { action } => {
            let mut engine = AlertEngine::load(&store, settings.alert_reset_band_pct);
            match action.unwrap_or(AlertsCmd::List) {
                AlertsCmd::List => {
                    for r in engine.rules() {
                        println!(
                            "{}  {:<8} {:<6} {}",
                            r.id,
                            if r.enabled { "enabled" } else { "disabled" },
                            if r.armed { "armed" } else { "idle" },
                            r.description()
                        );
                    }
                }
                AlertsCmd::Add { asset, kind, threshold } => {
                    let kind: AlertKind = kind.parse()?;
                    let id = engine.add(&catalog, &asset, kind, threshold)?.id.clone();
                    engine.save(&store)?;
                    println!("added {id}");
                }
                AlertsCmd::Remove { id } => {
                    let removed = engine.remove(&id).ok_or_else(|| anyhow!("no alert rule matches {id}"))?;
                    engine.save(&store)?;
                    println!("removed {}", removed.description());
                }
                AlertsCmd::Toggle { id } => {
                    let enabled = engine.toggle(&id).ok_or_else(|| anyhow!("no alert rule matches {id}"))?;
                    engine.save(&store)?;
                    println!("{} {}", id, if enabled { "enabled" } else { "disabled" });
                }
            }
        }
        Cmd::Select { assets } => {
            let prefs = Preferences { selected_assets: assets, ..Preferences::load(&store) };
            prefs.save(&store, &catalog)?;
        }
        Cmd::Prefs { refresh_ms, sound, theme } => {
            let mut prefs = Preferences::load(&store);
            let changed = refresh_ms.is_some() || sound.is_some() || theme.is_some();
            if let Some(ms) = refresh_ms {
                prefs.refresh_interval_ms = ms;
            }
            if let Some(on) = sound {
                prefs.sound_enabled = on;
            }
            if let Some(t) = theme {
                prefs.theme = t;
            }
            if changed {
                prefs.save(&store, &catalog)?;
            }
            println!("{}", serde_json::to_string_pretty(&prefs)?);
        }
        Cmd::Export { path } => {
            let history = HistoryStore::new(store.clone(), settings.history_cap);
            let doc = backup::export_json(&store, &history)?;
            std::fs::write(&path, doc).with_context(|| format!("write {}", path.display()))?;
            println!("exported to {}", path.display());
        }
        Cmd::Import { path } => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let history = HistoryStore::new(store.clone(), settings.history_cap);
            let report = backup::import(&raw, &store, &history, &catalog)?;
            println!("applied: {}", report.applied.join(", "));
            for (section, reason) in &report.skipped {
                println!("skipped {section}: {reason}");
            }
        }
        Cmd::Status => {
            for s in store.component_statuses()? {
                println!(
                    "{:<8} {:<5} {:<20} {:<24} {}",
                    s.component,
                    s.level,
                    s.message,
                    format_ts_ms((s.updated_ts * 1000.0) as i64),
                    s.detail.unwrap_or_default()
                );
            }
        }
        Cmd::Reset => {
            preferences::reset(&store)?;
            println!("preferences, alert rules and last known prices cleared");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["pricewatch", "--store", "/tmp/x.sqlite", "pnl", "gold", "--buy", "1800", "--amount", "2"]);
        assert_eq!(cli.store.as_deref(), Some("/tmp/x.sqlite"));
        assert!(matches!(cli.command, Some(Cmd::Pnl { ref asset, buy, amount }) if asset == "gold" && buy == 1800.0 && amount == 2.0));

        let cli = Cli::parse_from(["pricewatch", "prefs", "--sound", "on", "--refresh-ms", "60000"]);
        assert!(matches!(cli.command, Some(Cmd::Prefs { sound: Some(true), refresh_ms: Some(60000), .. })));

        let cli = Cli::parse_from(["pricewatch"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_on_off() {
        assert_eq!(parse_on_off("ON"), Ok(true));
        assert_eq!(parse_on_off("off"), Ok(false));
        assert!(parse_on_off("maybe").is_err());
    }
}
