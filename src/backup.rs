use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    alerts::{default_rules, AlertRule},
    assets::AssetCatalog,
    errors::{ConfigError, ImportError},
    history::{HistorySnapshot, HistoryStore},
    preferences::Preferences,
    store::{SqliteStore, KEY_ALERTS, KEY_AUTO_BACKUP},
};

pub const BACKUP_VERSION: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    pub version: u64,
    pub exported_at: String,
    pub history: HistorySnapshot,
    pub settings: Preferences,
    pub alerts: Vec<AlertRule>,
}

/// Everything but history, written periodically by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoBackup {
    pub saved_at: String,
    pub settings: Preferences,
    pub alerts: Vec<AlertRule>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub applied: Vec<&'static str>,
    pub skipped: Vec<(&'static str, String)>,
}

fn load_alerts(store: &SqliteStore) -> Vec<AlertRule> {
    store.load_or(KEY_ALERTS, default_rules())
}

pub fn export(store: &SqliteStore, history: &HistoryStore) -> Result<BackupDocument> {
    Ok(BackupDocument {
        version: BACKUP_VERSION,
        exported_at: chrono::Utc::now().to_rfc3339(),
        history: history.export_all()?,
        settings: Preferences::load(store),
        alerts: load_alerts(store),
    })
}

pub fn export_json(store: &SqliteStore, history: &HistoryStore) -> Result<String> {
    Ok(serde_json::to_string_pretty(&export(store, history)?)?)
}

pub fn write_auto_backup(store: &SqliteStore) -> Result<()> {
    let snapshot = AutoBackup {
        saved_at: chrono::Utc::now().to_rfc3339(),
        settings: Preferences::load(store),
        alerts: load_alerts(store),
    };
    store.put_json(KEY_AUTO_BACKUP, &snapshot)?;
    log::info!("backup.auto.saved rules={}", snapshot.alerts.len());
    Ok(())
}

fn validate_alerts(rules: &[AlertRule], catalog: &AssetCatalog) -> Result<(), ConfigError> {
    for r in rules {
        if !catalog.contains(&r.asset) {
            return Err(ConfigError::UnknownAsset(r.asset.clone()));
        }
        if !r.threshold.is_finite() || r.threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(r.threshold));
        }
    }
    Ok(())
}

fn section<T: serde::de::DeserializeOwned>(value: &JsonValue) -> Result<T> {
    Ok(T::deserialize(value)?)
}

/// Rejects the whole document when its top level is unusable. Otherwise each
/// section is validated on its own before anything is written. History goes
/// in one transaction, settings and alerts in another. Invalid sections leave
/// existing state untouched.
pub fn import(
    raw: &str,
    store: &SqliteStore,
    history: &HistoryStore,
    catalog: &AssetCatalog,
) -> Result<ImportReport> {
    let doc: JsonValue = serde_json::from_str(raw).map_err(|e| ImportError::Malformed(e.to_string()))?;
    let obj = doc.as_object().ok_or(ImportError::NotAnObject)?;

    let version = match obj.get("version") {
        None | Some(JsonValue::Null) => return Err(ImportError::MissingVersion.into()),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| ImportError::Malformed(format!("version must be an integer, got {v}")))?,
    };
    if version != BACKUP_VERSION {
        return Err(ImportError::UnsupportedVersion(version).into());
    }
    if !["history", "settings", "alerts"].iter().any(|k| obj.contains_key(*k)) {
        return Err(ImportError::Empty.into());
    }

    let mut report = ImportReport::default();
    let mut pairs: Vec<(String, String)> = vec![];

    let snapshot = match obj.get("history").map(section::<HistorySnapshot>) {
        Some(Ok(snap)) => Some(snap),
        Some(Err(e)) => {
            report.skipped.push(("history", format!("{e:#}")));
            None
        }
        None => None,
    };

    if let Some(v) = obj.get("settings") {
        match section::<Preferences>(v).and_then(|prefs| prefs.to_pairs(catalog)) {
            Ok(p) => {
                pairs.extend(p);
                report.applied.push("settings");
            }
            Err(e) => report.skipped.push(("settings", format!("{e:#}"))),
        }
    }

    if let Some(v) = obj.get("alerts") {
        let encoded = section::<Vec<AlertRule>>(v).and_then(|rules| {
            validate_alerts(&rules, catalog)?;
            Ok(serde_json::to_string(&rules)?)
        });
        match encoded {
            Ok(json) => {
                pairs.push((KEY_ALERTS.to_string(), json));
                report.applied.push("alerts");
            }
            Err(e) => report.skipped.push(("alerts", format!("{e:#}"))),
        }
    }

    // import_all validates every entry before it writes.
    if let Some(snap) = snapshot {
        match history.import_all(&snap) {
            Ok(assets) => {
                log::debug!("backup.import.history assets={}", assets);
                report.applied.insert(0, "history");
            }
            Err(e) => report.skipped.insert(0, ("history", format!("{e:#}"))),
        }
    }
    if !pairs.is_empty() {
        store.put_many(&pairs)?;
    }
    for (name, reason) in &report.skipped {
        log::warn!("backup.import.section_skipped section={} reason={}", name, reason);
    }
    log::info!(
        "backup.import.done applied={} skipped={}",
        report.applied.join(","),
        report.skipped.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;
    use serde_json::json;

    fn setup() -> (SqliteStore, HistoryStore, AssetCatalog) {
        let store = temp_store();
        let history = HistoryStore::new(store.clone(), 100);
        (store, history, AssetCatalog::builtin())
    }

    #[test]
    fn test_export_import_round_trip() {
        let (store, history, catalog) = setup();
        history.append("gold", 2650.0, 1_000).unwrap();
        let raw = export_json(&store, &history).unwrap();

        let (store2, history2, _) = setup();
        let report = import(&raw, &store2, &history2, &catalog).unwrap();
        assert_eq!(report.applied, vec!["history", "settings", "alerts"]);
        assert!(report.skipped.is_empty());
        assert_eq!(history2.load("gold")[0].price, 2650.0);
        assert_eq!(load_alerts(&store2).len(), 1);
    }

    #[test]
    fn test_corrupt_history_section_keeps_prior_history() {
        let (store, history, catalog) = setup();
        history.append("gold", 2000.0, 1_000).unwrap();

        let doc = json!({
            "version": 2,
            "history": {"gold": [{"price": "not a number", "timestamp_ms": 5}]},
            "settings": {"refresh_interval_ms": 60000, "sound_enabled": true, "theme": "light", "selected_assets": ["gold"]}
        });
        let report = import(&doc.to_string(), &store, &history, &catalog).unwrap();
        assert_eq!(report.applied, vec!["settings"]);
        assert_eq!(report.skipped[0].0, "history");

        let prefs = Preferences::load(&store);
        assert!(prefs.sound_enabled);
        assert_eq!(prefs.selected_assets, vec!["gold".to_string()]);
        let kept = history.load("gold");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, 2000.0);
    }

    #[test]
    fn test_negative_history_price_rejects_history_only() {
        let (store, history, catalog) = setup();
        history.append("gold", 2000.0, 1_000).unwrap();

        let doc = json!({
            "version": 2,
            "history": {
                "btc": [{"price": 60000.0, "timestamp_ms": 5, "change_from_previous": 0.0}],
                "gold": [{"price": -1.0, "timestamp_ms": 6, "change_from_previous": 0.0}]
            },
            "alerts": [{"id": "r1", "asset": "btc", "kind": "above", "threshold": 70000.0}]
        });
        let report = import(&doc.to_string(), &store, &history, &catalog).unwrap();
        assert_eq!(report.applied, vec!["alerts"]);
        assert!(report.skipped[0].1.contains("price must be positive"));

        assert!(history.load("btc").is_empty());
        assert_eq!(history.load("gold")[0].price, 2000.0);
        assert_eq!(load_alerts(&store)[0].id, "r1");
    }

    #[test]
    fn test_invalid_settings_are_not_written() {
        let (store, history, catalog) = setup();
        let doc = json!({"version": 2, "settings": {"selected_assets": []}});
        let report = import(&doc.to_string(), &store, &history, &catalog).unwrap();
        assert!(report.applied.is_empty());
        assert!(report.skipped[0].1.contains("at least one asset"));
        assert_eq!(Preferences::load(&store), Preferences::default());
    }

    #[test]
    fn test_top_level_problems_reject_everything() {
        let (store, history, catalog) = setup();
        let cases = [
            ("{not json", "not valid JSON"),
            ("[1,2]", "must be an object"),
            (r#"{"settings": {}}"#, "no version"),
            (r#"{"version": 9, "settings": {}}"#, "unsupported backup version 9"),
            (r#"{"version": 2, "exported_at": "x"}"#, "no recognised sections"),
        ];
        for (raw, expected) in cases {
            let err = import(raw, &store, &history, &catalog).unwrap_err();
            assert!(err.downcast_ref::<ImportError>().is_some(), "{raw}");
            assert!(err.to_string().contains(expected), "{raw}: {err}");
        }
        assert_eq!(store.get_raw(crate::store::KEY_SETTINGS).unwrap(), None);
    }

    #[test]
    fn test_auto_backup_excludes_history() {
        let (store, history, _) = setup();
        history.append("gold", 2000.0, 1).unwrap();
        write_auto_backup(&store).unwrap();
        let raw: JsonValue = store.get_json(KEY_AUTO_BACKUP).unwrap().unwrap();
        assert!(raw.get("history").is_none());
        assert_eq!(raw["settings"]["theme"], "dark");
    }
}
