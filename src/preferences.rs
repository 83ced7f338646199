use std::collections::HashSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    assets::{default_selection, AssetCatalog},
    errors::ConfigError,
    store::{SqliteStore, KEY_ALERTS, KEY_LAST_PRICES, KEY_SELECTED_ASSETS, KEY_SETTINGS, KEY_THEME},
};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 300_000;
pub const MIN_REFRESH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_THEME: &str = "dark";

/// Shape of the `settings` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredSettings {
    #[serde(default = "default_refresh")]
    refresh_interval_ms: u64,
    #[serde(default)]
    sound_enabled: bool,
}

fn default_refresh() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

/// User-facing settings, persisted across three keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub refresh_interval_ms: u64,
    pub sound_enabled: bool,
    pub theme: String,
    pub selected_assets: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            sound_enabled: false,
            theme: DEFAULT_THEME.to_string(),
            selected_assets: default_selection(),
        }
    }
}

impl Preferences {
    /// Absent or unreadable keys take their defaults independently.
    pub fn load(store: &SqliteStore) -> Self {
        let d = Self::default();
        let settings = store.load_or(
            KEY_SETTINGS,
            StoredSettings { refresh_interval_ms: d.refresh_interval_ms, sound_enabled: d.sound_enabled },
        );
        let theme: String = store.load_or(KEY_THEME, d.theme.clone());
        let selected_assets: Vec<String> = store.load_or(KEY_SELECTED_ASSETS, d.selected_assets.clone());

        Self {
            refresh_interval_ms: settings.refresh_interval_ms,
            sound_enabled: settings.sound_enabled,
            theme: if theme.trim().is_empty() { d.theme } else { theme },
            selected_assets: if selected_assets.is_empty() { d.selected_assets } else { selected_assets },
        }
    }

    pub fn validate(&self, catalog: &AssetCatalog) -> Result<(), ConfigError> {
        if self.selected_assets.is_empty() {
            return Err(ConfigError::EmptySelection);
        }
        if let Some(unknown) = self.selected_assets.iter().find(|id| !catalog.contains(id)) {
            return Err(ConfigError::UnknownAsset(unknown.clone()));
        }
        if self.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(ConfigError::InvalidRefreshInterval {
                got: self.refresh_interval_ms,
                min: MIN_REFRESH_INTERVAL_MS,
            });
        }
        Ok(())
    }

    /// Encoded key/value pairs, after validation.
    pub fn to_pairs(&self, catalog: &AssetCatalog) -> Result<Vec<(String, String)>> {
        self.validate(catalog)?;
        let settings = StoredSettings {
            refresh_interval_ms: self.refresh_interval_ms,
            sound_enabled: self.sound_enabled,
        };
        let theme = match self.theme.trim() {
            "" => DEFAULT_THEME,
            t => t,
        };
        let selected = self.unique_selection();
        Ok(vec![
            (KEY_SETTINGS.to_string(), serde_json::to_string(&settings)?),
            (KEY_THEME.to_string(), serde_json::to_string(theme)?),
            (KEY_SELECTED_ASSETS.to_string(), serde_json::to_string(&selected)?),
        ])
    }

    /// Selected ids in their first-seen order, repeats dropped.
    pub fn unique_selection(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.selected_assets
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// Rejects invalid preferences before touching the store.
    pub fn save(&self, store: &SqliteStore, catalog: &AssetCatalog) -> Result<()> {
        let pairs = self.to_pairs(catalog)?;
        store.put_many(&pairs)?;
        log::info!(
            "prefs.saved refresh_ms={} sound={} theme={} assets={}",
            self.refresh_interval_ms,
            self.sound_enabled,
            self.theme,
            self.selected_assets.join(",")
        );
        Ok(())
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.refresh_interval_ms.max(MIN_REFRESH_INTERVAL_MS))
    }
}

/// Drops preferences, alert rules and last-known-good prices. History stays.
pub fn reset(store: &SqliteStore) -> Result<()> {
    for key in [KEY_SETTINGS, KEY_SELECTED_ASSETS, KEY_THEME, KEY_ALERTS, KEY_LAST_PRICES] {
        store.delete(key)?;
    }
    log::info!("prefs.reset");
    Ok(())
}
