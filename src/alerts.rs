use std::{collections::HashMap, fmt, str::FromStr};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    analytics::percent_change,
    assets::AssetCatalog,
    errors::ConfigError,
    store::{SqliteStore, KEY_ALERTS},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Above,
    Below,
    #[serde(rename = "change_up")]
    PercentChangeUp,
    #[serde(rename = "change_down")]
    PercentChangeDown,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Above => "above",
            AlertKind::Below => "below",
            AlertKind::PercentChangeUp => "change_up",
            AlertKind::PercentChangeDown => "change_down",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above" => Ok(AlertKind::Above),
            "below" => Ok(AlertKind::Below),
            "change_up" | "up" => Ok(AlertKind::PercentChangeUp),
            "change_down" | "down" => Ok(AlertKind::PercentChangeDown),
            other => Err(ConfigError::UnknownAlertKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub asset: String,
    pub kind: AlertKind,
    pub threshold: f64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Set when a threshold rule fires; cleared once price leaves the reset band.
    #[serde(default)]
    pub armed: bool,
}

fn enabled_default() -> bool {
    true
}

impl AlertRule {
    pub fn new(asset: &str, kind: AlertKind, threshold: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset: asset.to_string(),
            kind,
            threshold,
            enabled: true,
            armed: false,
        }
    }

    pub fn description(&self) -> String {
        match self.kind {
            AlertKind::Above => format!("{} price above ${:.2}", self.asset, self.threshold),
            AlertKind::Below => format!("{} price below ${:.2}", self.asset, self.threshold),
            AlertKind::PercentChangeUp => format!("{} price increase ≥ {}%", self.asset, self.threshold),
            AlertKind::PercentChangeDown => format!("{} price decrease ≥ {}%", self.asset, self.threshold),
        }
    }
}

pub fn default_rules() -> Vec<AlertRule> {
    vec![AlertRule::new("gold", AlertKind::Below, 1800.0)]
}

#[derive(Debug, Clone, PartialEq)]
pub struct FiredAlert {
    pub rule: AlertRule,
    pub price: f64,
    pub message: String,
}

pub struct AlertEngine {
    rules: Vec<AlertRule>,
    reset_band_pct: f64,
    dirty: bool,
    /// Armed flags flipped by `evaluate` and not yet synced, by rule id.
    pending: HashMap<String, bool>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>, reset_band_pct: f64) -> Self {
        Self {
            rules,
            reset_band_pct: reset_band_pct.max(0.0),
            dirty: false,
            pending: HashMap::new(),
        }
    }

    /// Persisted rules, or the seeded defaults when absent or unreadable.
    pub fn load(store: &SqliteStore, reset_band_pct: f64) -> Self {
        let rules = store.load_or(KEY_ALERTS, default_rules());
        Self::new(rules, reset_band_pct)
    }

    /// Overwrites the stored rule list with this engine's rules.
    pub fn save(&mut self, store: &SqliteStore) -> Result<()> {
        store.put_json(KEY_ALERTS, &self.rules)?;
        self.dirty = false;
        self.pending.clear();
        Ok(())
    }

    /// Stored rules with this engine's pending armed flags applied.
    fn merged(&self, mut stored: Vec<AlertRule>) -> Vec<AlertRule> {
        for rule in stored.iter_mut() {
            if let Some(&armed) = self.pending.get(&rule.id) {
                rule.armed = armed;
            }
        }
        stored
    }

    /// Adopts rules edited by other writers. Pending armed flags are kept; an
    /// absent key leaves the current rules in place.
    pub fn reload(&mut self, store: &SqliteStore) {
        match store.get_json::<Vec<AlertRule>>(KEY_ALERTS) {
            Ok(Some(stored)) => self.rules = self.merged(stored),
            Ok(None) => {}
            Err(e) => log::warn!("alerts.reload_failed err={:#}", e),
        }
    }

    /// Writes pending armed flags into the stored list in one read-modify-write
    /// and adopts the result. Rules added, removed or toggled elsewhere survive.
    pub fn sync(&mut self, store: &SqliteStore) -> Result<()> {
        let raw = store.update_raw(KEY_ALERTS, |current| {
            let rules = match current.map(|raw| serde_json::from_str::<Vec<AlertRule>>(&raw)) {
                Some(Ok(stored)) => self.merged(stored),
                Some(Err(e)) => {
                    log::warn!("alerts.stored_unreadable err={}", e);
                    self.rules.clone()
                }
                None => self.rules.clone(),
            };
            Ok(serde_json::to_string(&rules)?)
        })?;
        self.rules = serde_json::from_str(&raw)?;
        self.pending.clear();
        self.dirty = false;
        Ok(())
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Rule state changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn add(
        &mut self,
        catalog: &AssetCatalog,
        asset: &str,
        kind: AlertKind,
        threshold: f64,
    ) -> Result<&AlertRule, ConfigError> {
        if !catalog.contains(asset) {
            return Err(ConfigError::UnknownAsset(asset.to_string()));
        }
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        self.rules.push(AlertRule::new(asset, kind, threshold));
        self.dirty = true;
        Ok(&self.rules[self.rules.len() - 1])
    }

    /// Exact id, or an unambiguous id prefix.
    fn position(&self, id: &str) -> Option<usize> {
        if let Some(i) = self.rules.iter().position(|r| r.id == id) {
            return Some(i);
        }
        let mut hits = self.rules.iter().enumerate().filter(|(_, r)| !id.is_empty() && r.id.starts_with(id));
        match (hits.next(), hits.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<AlertRule> {
        let i = self.position(id)?;
        self.dirty = true;
        Some(self.rules.remove(i))
    }

    /// Returns the new `enabled` value.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let i = self.position(id)?;
        let rule = &mut self.rules[i];
        rule.enabled = !rule.enabled;
        self.dirty = true;
        Some(rule.enabled)
    }

    /// Checks every enabled rule against the latest prices. Only mutates the
    /// armed flags; delivering the fired alerts is up to the caller.
    pub fn evaluate(
        &mut self,
        catalog: &AssetCatalog,
        current: &HashMap<String, f64>,
        previous: &HashMap<String, f64>,
    ) -> Vec<FiredAlert> {
        let band = self.reset_band_pct / 100.0;
        let show = |asset: &str, p: f64| {
            catalog
                .get(asset)
                .map(|a| a.format_price(p))
                .unwrap_or_else(|| format!("${p:.2}"))
        };
        let mut fired = vec![];

        for rule in self.rules.iter_mut().filter(|r| r.enabled) {
            let Some(&price) = current.get(&rule.asset) else {
                continue;
            };
            let change = previous
                .get(&rule.asset)
                .map(|&prev| percent_change(price, prev))
                .unwrap_or(0.0);

            let message = match rule.kind {
                AlertKind::Above => {
                    if rule.armed {
                        if price < rule.threshold * (1.0 - band) {
                            rule.armed = false;
                            self.dirty = true;
                            self.pending.insert(rule.id.clone(), false);
                        }
                        None
                    } else if price >= rule.threshold {
                        rule.armed = true;
                        self.dirty = true;
                        self.pending.insert(rule.id.clone(), true);
                        Some(format!(
                            "{} price reached {}! Current: {}",
                            rule.asset,
                            show(&rule.asset, rule.threshold),
                            show(&rule.asset, price)
                        ))
                    } else {
                        None
                    }
                }
                AlertKind::Below => {
                    if rule.armed {
                        if price > rule.threshold * (1.0 + band) {
                            rule.armed = false;
                            self.dirty = true;
                            self.pending.insert(rule.id.clone(), false);
                        }
                        None
                    } else if price <= rule.threshold {
                        rule.armed = true;
                        self.dirty = true;
                        self.pending.insert(rule.id.clone(), true);
                        Some(format!(
                            "{} price dropped to {}! Current: {}",
                            rule.asset,
                            show(&rule.asset, rule.threshold),
                            show(&rule.asset, price)
                        ))
                    } else {
                        None
                    }
                }
                AlertKind::PercentChangeUp if change >= rule.threshold => Some(format!(
                    "{} price increased by {:.2}%! Current: {}",
                    rule.asset,
                    change,
                    show(&rule.asset, price)
                )),
                AlertKind::PercentChangeDown if change <= -rule.threshold => Some(format!(
                    "{} price decreased by {:.2}%! Current: {}",
                    rule.asset,
                    change.abs(),
                    show(&rule.asset, price)
                )),
                _ => None,
            };

            if let Some(message) = message {
                fired.push(FiredAlert { rule: rule.clone(), price, message });
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;

    fn prices(asset: &str, p: f64) -> HashMap<String, f64> {
        HashMap::from([(asset.to_string(), p)])
    }

    #[test]
    fn test_below_rule_fires_once_per_crossing() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(vec![AlertRule::new("gold", AlertKind::Below, 1800.0)], 1.0);
        let mut fired_at = vec![];
        let mut prev = HashMap::new();
        for p in [1900.0, 1750.0, 1760.0, 1770.0, 1850.0] {
            let cur = prices("gold", p);
            for f in engine.evaluate(&cat, &cur, &prev) {
                fired_at.push(f.price);
            }
            prev = cur;
        }
        assert_eq!(fired_at, vec![1750.0]);
        assert!(!engine.rules()[0].armed);

        // re-armed: the next crossing fires again
        assert_eq!(engine.evaluate(&cat, &prices("gold", 1790.0), &prev).len(), 1);
    }

    #[test]
    fn test_no_rearm_inside_band() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(vec![AlertRule::new("gold", AlertKind::Below, 1800.0)], 1.0);
        let none = HashMap::new();
        assert_eq!(engine.evaluate(&cat, &prices("gold", 1790.0), &none).len(), 1);
        // 1810 is above the threshold but inside the 1% band (1818)
        assert!(engine.evaluate(&cat, &prices("gold", 1810.0), &none).is_empty());
        assert!(engine.evaluate(&cat, &prices("gold", 1795.0), &none).is_empty());
        assert!(engine.rules()[0].armed);
    }

    #[test]
    fn test_above_rule_rearms_below_band() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(vec![AlertRule::new("btc", AlertKind::Above, 100_000.0)], 1.0);
        let none = HashMap::new();
        let fired = engine.evaluate(&cat, &prices("btc", 100_500.0), &none);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].message.contains("$100000.00"));
        assert!(engine.evaluate(&cat, &prices("btc", 99_500.0), &none).is_empty());
        assert!(engine.rules()[0].armed);
        assert!(engine.evaluate(&cat, &prices("btc", 98_000.0), &none).is_empty());
        assert!(!engine.rules()[0].armed);
        assert_eq!(engine.evaluate(&cat, &prices("btc", 101_000.0), &none).len(), 1);
    }

    #[test]
    fn test_percent_change_fires_every_qualifying_cycle() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(
            vec![
                AlertRule::new("eth", AlertKind::PercentChangeUp, 2.0),
                AlertRule::new("eth", AlertKind::PercentChangeDown, 2.0),
            ],
            1.0,
        );
        let up = engine.evaluate(&cat, &prices("eth", 103.0), &prices("eth", 100.0));
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].rule.kind, AlertKind::PercentChangeUp);
        assert_eq!(engine.evaluate(&cat, &prices("eth", 103.0), &prices("eth", 100.0)).len(), 1);

        let down = engine.evaluate(&cat, &prices("eth", 97.0), &prices("eth", 100.0));
        assert_eq!(down.len(), 1);
        assert!(down[0].message.contains("decreased by 3.00%"));

        // no previous price means no change
        assert!(engine.evaluate(&cat, &prices("eth", 150.0), &HashMap::new()).is_empty());
    }

    #[test]
    fn test_disabled_rules_and_missing_prices_are_skipped() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(vec![AlertRule::new("gold", AlertKind::Below, 1800.0)], 1.0);
        let id = engine.rules()[0].id.clone();
        assert_eq!(engine.toggle(&id), Some(false));
        assert!(engine.evaluate(&cat, &prices("gold", 1000.0), &HashMap::new()).is_empty());
        assert!(engine.evaluate(&cat, &prices("btc", 1.0), &HashMap::new()).is_empty());
    }

    #[test]
    fn test_add_validates_and_persists() {
        let store = temp_store();
        let catalog = AssetCatalog::builtin();
        let mut engine = AlertEngine::load(&store, 1.0);
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.rules()[0].description(), "gold price below $1800.00");

        assert_eq!(
            engine.add(&catalog, "nope", AlertKind::Above, 1.0).unwrap_err(),
            ConfigError::UnknownAsset("nope".into())
        );
        assert_eq!(
            engine.add(&catalog, "btc", AlertKind::Above, -5.0).unwrap_err(),
            ConfigError::InvalidThreshold(-5.0)
        );
        let id = engine.add(&catalog, "btc", AlertKind::PercentChangeUp, 5.0).unwrap().id.clone();
        assert!(engine.is_dirty());
        engine.save(&store).unwrap();
        assert!(!engine.is_dirty());

        let mut reloaded = AlertEngine::load(&store, 1.0);
        assert_eq!(reloaded.rules().len(), 2);
        assert_eq!(reloaded.rules()[1].description(), "btc price increase ≥ 5%");
        assert!(reloaded.remove(&id[..8]).is_some());
        assert_eq!(reloaded.rules().len(), 1);
    }

    #[test]
    fn test_sync_keeps_rules_written_elsewhere() {
        let store = temp_store();
        let cat = AssetCatalog::builtin();
        let gold = AlertRule::new("gold", AlertKind::Below, 1800.0);
        store.put_json(KEY_ALERTS, &vec![gold.clone()]).unwrap();
        let mut engine = AlertEngine::load(&store, 1.0);

        // another process adds a rule and disables gold while this engine runs
        let btc = AlertRule::new("btc", AlertKind::Above, 100_000.0);
        let edited = vec![AlertRule { enabled: false, ..gold.clone() }, btc.clone()];
        store.put_json(KEY_ALERTS, &edited).unwrap();

        assert_eq!(engine.evaluate(&cat, &prices("gold", 1750.0), &HashMap::new()).len(), 1);
        engine.sync(&store).unwrap();

        let stored: Vec<AlertRule> = store.get_json(KEY_ALERTS).unwrap().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].armed);
        assert!(!stored[0].enabled);
        assert_eq!(stored[1].id, btc.id);
        assert_eq!(engine.rules(), stored.as_slice());
        assert!(!engine.is_dirty());
    }

    #[test]
    fn test_reload_adopts_stored_rules() {
        let store = temp_store();
        let mut engine = AlertEngine::load(&store, 1.0);
        engine.reload(&store);
        assert_eq!(engine.rules().len(), 1);

        let rules = vec![AlertRule::new("eth", AlertKind::PercentChangeUp, 3.0)];
        store.put_json(KEY_ALERTS, &rules).unwrap();
        engine.reload(&store);
        assert_eq!(engine.rules(), rules.as_slice());
    }

    #[test]
    fn test_messages_use_asset_price_format() {
        let cat = AssetCatalog::builtin();
        let mut engine = AlertEngine::new(vec![AlertRule::new("doge", AlertKind::PercentChangeUp, 1.0)], 1.0);
        let fired = engine.evaluate(&cat, &prices("doge", 0.153), &prices("doge", 0.15));
        assert_eq!(fired[0].message, "doge price increased by 2.00%! Current: $0.153000");
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("change_up".parse::<AlertKind>().unwrap(), AlertKind::PercentChangeUp);
        assert_eq!(" Below ".parse::<AlertKind>().unwrap(), AlertKind::Below);
        assert_eq!(
            "sideways".parse::<AlertKind>().unwrap_err(),
            ConfigError::UnknownAlertKind("sideways".into())
        );
    }
}
