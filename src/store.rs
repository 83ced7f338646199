use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};

use crate::utils::now_ts;

pub const KEY_SETTINGS: &str = "settings";
pub const KEY_SELECTED_ASSETS: &str = "selected_assets";
pub const KEY_THEME: &str = "theme";
pub const KEY_ALERTS: &str = "alerts";
pub const KEY_LAST_PRICES: &str = "last_prices";
pub const KEY_AUTO_BACKUP: &str = "auto_backup";
pub const HISTORY_KEY_PREFIX: &str = "history:";

pub fn history_key(asset: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{asset}")
}

const UPSERT_KV: &str = "INSERT INTO kv(key, value, updated_ts) VALUES(?1, ?2, ?3) \
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Warn,
    Error,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "ok",
            Health::Warn => "warn",
            Health::Error => "error",
        }
    }
}

/// Last reported state of one component (`fetch`, `history`, `tracker`, `store`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub component: String,
    pub level: String,
    pub message: String,
    pub detail: Option<String>,
    pub updated_ts: f64,
}

/// JSON blobs by key, in one SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    /// Connections are opened per call, so the store can be cloned into any task.
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("store path is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| format!("create store dir for {path}"))?;
            }
        }
        Ok(Self { path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open store {}", self.path))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        self.connect()?.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_ts REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS component_status (
  component TEXT PRIMARY KEY,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  detail TEXT,
  updated_ts REAL NOT NULL
);
"#,
        )?;
        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .connect()?
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.connect()?.execute(UPSERT_KV, params![key, value, now_ts()])?;
        Ok(())
    }

    /// All pairs land in one transaction, or none do.
    pub fn put_many(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(UPSERT_KV)?;
            let ts = now_ts();
            for (key, value) in pairs {
                stmt.execute(params![key, value, ts])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-write of one key under an IMMEDIATE transaction; concurrent
    /// updates of the same key serialize instead of losing writes.
    pub fn update_raw<F>(&self, key: &str, f: F) -> Result<String>
    where
        F: FnOnce(Option<String>) -> Result<String>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        let next = f(current)?;
        tx.execute(UPSERT_KV, params![key, next, now_ts()])?;
        tx.commit()?;
        Ok(next)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.connect()?.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key")?;
        let keys = stmt
            .query_map(params![prefix.len() as i64, prefix], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// `Ok(None)` when the key is absent, `Err` when it holds garbage.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw).with_context(|| format!("decode kv key {key}"))?)),
        }
    }

    pub fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.put_raw(key, &serde_json::to_string(value)?)
    }

    /// Absent or unreadable keys fall back to `default`; corruption is logged
    /// and recorded against the `store` component.
    pub fn load_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_json(key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                log::warn!("store.corrupt key={} err={:#}", key, e);
                self.record_status("store", Health::Warn, "corrupt_key", Some(key)).ok();
                default
            }
        }
    }

    pub fn record_status(&self, component: &str, level: Health, message: &str, detail: Option<&str>) -> Result<()> {
        self.connect()?.execute(
            "INSERT INTO component_status(component, level, message, detail, updated_ts) \
             VALUES(?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(component) DO UPDATE SET level = excluded.level, message = excluded.message, \
             detail = excluded.detail, updated_ts = excluded.updated_ts",
            params![component, level.as_str(), message, detail, now_ts()],
        )?;
        Ok(())
    }

    pub fn component_statuses(&self) -> Result<Vec<ComponentStatus>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT component, level, message, detail, updated_ts FROM component_status ORDER BY component",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ComponentStatus {
                    component: r.get(0)?,
                    level: r.get(1)?,
                    message: r.get(2)?,
                    detail: r.get(3)?,
                    updated_ts: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn component_status(&self, component: &str) -> Result<Option<ComponentStatus>> {
        Ok(self.component_statuses()?.into_iter().find(|s| s.component == component))
    }
}

#[cfg(test)]
pub fn temp_store() -> SqliteStore {
    let path = std::env::temp_dir().join(format!("pricewatch-test-{}.sqlite", uuid::Uuid::new_v4()));
    let store = SqliteStore::new(&path.to_string_lossy()).expect("temp store");
    store.init_db().expect("init temp store");
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_key_is_none() {
        let store = temp_store();
        assert_eq!(store.get_raw("nope").unwrap(), None);
        let v: Option<Vec<String>> = store.get_json("nope").unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn test_corrupt_json_falls_back_to_default() {
        let store = temp_store();
        store.put_raw(KEY_THEME, "{not json").unwrap();
        assert!(store.get_json::<String>(KEY_THEME).is_err());
        assert_eq!(store.load_or(KEY_THEME, "dark".to_string()), "dark");

        let status = store.component_status("store").unwrap().unwrap();
        assert_eq!(status.level, "warn");
        assert_eq!(status.detail.as_deref(), Some(KEY_THEME));
    }

    #[test]
    fn test_update_raw_sees_previous_value() {
        let store = temp_store();
        store
            .update_raw("counter", |cur| {
                assert!(cur.is_none());
                Ok("1".to_string())
            })
            .unwrap();
        let next = store
            .update_raw("counter", |cur| {
                let n: i64 = cur.unwrap_or_default().parse()?;
                Ok((n + 1).to_string())
            })
            .unwrap();
        assert_eq!(next, "2");
    }

    #[test]
    fn test_failed_update_leaves_value() {
        let store = temp_store();
        store.put_raw("k", "old").unwrap();
        assert!(store.update_raw("k", |_| Err(anyhow::anyhow!("nope"))).is_err());
        assert_eq!(store.get_raw("k").unwrap().as_deref(), Some("old"));
    }

    #[test]
    fn test_keys_with_prefix() {
        let store = temp_store();
        store.put_raw(&history_key("gold"), "[]").unwrap();
        store.put_raw(&history_key("btc"), "[]").unwrap();
        store.put_raw(KEY_SETTINGS, "{}").unwrap();
        assert_eq!(
            store.keys_with_prefix(HISTORY_KEY_PREFIX).unwrap(),
            vec!["history:btc".to_string(), "history:gold".to_string()]
        );
    }

    #[test]
    fn test_status_upsert_keeps_latest() {
        let store = temp_store();
        store.record_status("tracker", Health::Warn, "soft_error", Some("x")).unwrap();
        store.record_status("tracker", Health::Ok, "cycle", None).unwrap();
        let all = store.component_statuses().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, "cycle");
        assert_eq!(all[0].detail, None);
    }
}
