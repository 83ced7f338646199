use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    store::{history_key, Health, SqliteStore, HISTORY_KEY_PREFIX},
    utils::{from_cents, to_cents},
};

pub const CODEC_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub asset: String,
    pub price: f64,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub change_from_previous: f64,
}

/// Persisted form: `[price_cents, ts_ms, change_cents]` rows, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedHistory {
    #[serde(default = "codec_version")]
    pub v: u32,
    pub compressed: bool,
    pub data: Vec<(i64, i64, i64)>,
}

fn codec_version() -> u32 {
    CODEC_VERSION
}

pub fn compress(entries: &[HistoryEntry]) -> CompressedHistory {
    CompressedHistory {
        v: CODEC_VERSION,
        compressed: true,
        data: entries
            .iter()
            .map(|e| (to_cents(e.price), e.timestamp_ms, to_cents(e.change_from_previous)))
            .collect(),
    }
}

pub fn decompress(asset: &str, blob: &CompressedHistory) -> Vec<HistoryEntry> {
    blob.data
        .iter()
        .map(|&(price, ts, change)| HistoryEntry {
            asset: asset.to_string(),
            price: from_cents(price),
            timestamp_ms: ts,
            change_from_previous: from_cents(change),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyTimestamp {
    Millis(i64),
    Text(String),
}

/// Uncompressed rows written by older builds.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    price: f64,
    timestamp: LegacyTimestamp,
    #[serde(default)]
    change: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredHistory {
    Compressed(CompressedHistory),
    Legacy(Vec<LegacyEntry>),
}

fn decode_blob(asset: &str, raw: &str) -> Result<Vec<HistoryEntry>> {
    match serde_json::from_str::<StoredHistory>(raw).context("decode history blob")? {
        StoredHistory::Compressed(blob) => {
            if blob.v > CODEC_VERSION {
                return Err(anyhow!("history codec v{} is newer than v{}", blob.v, CODEC_VERSION));
            }
            Ok(decompress(asset, &blob))
        }
        StoredHistory::Legacy(rows) => rows
            .into_iter()
            .map(|r| -> Result<HistoryEntry> {
                let timestamp_ms = match r.timestamp {
                    LegacyTimestamp::Millis(ms) => ms,
                    LegacyTimestamp::Text(s) => chrono::DateTime::parse_from_rfc3339(&s)
                        .with_context(|| format!("legacy timestamp {s:?}"))?
                        .timestamp_millis(),
                };
                Ok(HistoryEntry {
                    asset: asset.to_string(),
                    price: r.price,
                    timestamp_ms,
                    change_from_previous: r.change,
                })
            })
            .collect(),
    }
}

fn encode_blob(entries: &[HistoryEntry]) -> Result<String> {
    Ok(serde_json::to_string(&compress(entries))?)
}

/// Asset id -> entries, newest first.
pub type HistorySnapshot = BTreeMap<String, Vec<HistoryEntry>>;

/// Bounded per-asset price history, most recent first.
#[derive(Clone)]
pub struct HistoryStore {
    store: SqliteStore,
    cap: usize,
}

impl HistoryStore {
    pub fn new(store: SqliteStore, cap: usize) -> Self {
        Self { store, cap: cap.max(1) }
    }

    /// Prepends a new entry and persists the trimmed sequence. The
    /// read-modify-write runs in one transaction per call.
    pub fn append(&self, asset: &str, price: f64, timestamp_ms: i64) -> Result<HistoryEntry> {
        let key = history_key(asset);
        let mut appended = None;

        self.store.update_raw(&key, |current| {
            let mut entries = match current {
                None => vec![],
                Some(raw) => decode_blob(asset, &raw).unwrap_or_else(|e| {
                    log::warn!("history.corrupt asset={} err={:#} action=reset", asset, e);
                    vec![]
                }),
            };
            let change = entries.first().map(|head| price - head.price).unwrap_or(0.0);
            let entry = HistoryEntry {
                asset: asset.to_string(),
                price,
                timestamp_ms,
                change_from_previous: change,
            };
            entries.insert(0, entry.clone());
            entries.truncate(self.cap);
            appended = Some(entry);
            encode_blob(&entries)
        })?;

        appended.ok_or_else(|| anyhow!("history append for {asset} produced no entry"))
    }

    /// Missing or unreadable history is empty.
    pub fn load(&self, asset: &str) -> Vec<HistoryEntry> {
        let raw = match self.store.get_raw(&history_key(asset)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return vec![],
            Err(e) => {
                log::warn!("history.read_failed asset={} err={:#}", asset, e);
                return vec![];
            }
        };
        match decode_blob(asset, &raw) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("history.corrupt asset={} err={:#}", asset, e);
                self.store
                    .record_status("history", Health::Warn, "corrupt_blob", Some(asset))
                    .ok();
                vec![]
            }
        }
    }

    pub fn clear(&self, asset: &str) -> Result<()> {
        self.store.delete(&history_key(asset))?;
        log::info!("history.cleared asset={}", asset);
        Ok(())
    }

    pub fn assets(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys_with_prefix(HISTORY_KEY_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(HISTORY_KEY_PREFIX).map(|s| s.to_string()))
            .collect())
    }

    /// Newest stored price per asset.
    pub fn heads(&self) -> Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for asset in self.assets()? {
            if let Some(head) = self.load(&asset).first() {
                out.insert(asset, head.price);
            }
        }
        Ok(out)
    }

    pub fn export_all(&self) -> Result<HistorySnapshot> {
        let mut out = BTreeMap::new();
        for asset in self.assets()? {
            let entries = self.load(&asset);
            if !entries.is_empty() {
                out.insert(asset, entries);
            }
        }
        Ok(out)
    }

    /// Validates every entry and encodes the blobs without writing anything.
    fn prepare_import(&self, snapshot: &HistorySnapshot) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::with_capacity(snapshot.len());
        for (asset, entries) in snapshot {
            if asset.trim().is_empty() {
                return Err(anyhow!("history section has an empty asset id"));
            }
            for (i, e) in entries.iter().enumerate() {
                if !e.price.is_finite() || e.price <= 0.0 {
                    return Err(anyhow!("history {asset}[{i}]: price must be positive (got {})", e.price));
                }
                if e.timestamp_ms <= 0 || !e.change_from_previous.is_finite() {
                    return Err(anyhow!("history {asset}[{i}]: bad timestamp or change"));
                }
            }
            let mut entries = entries.clone();
            entries.truncate(self.cap);
            pairs.push((history_key(asset), encode_blob(&entries)?));
        }
        Ok(pairs)
    }

    pub fn import_all(&self, snapshot: &HistorySnapshot) -> Result<usize> {
        let pairs = self.prepare_import(snapshot)?;
        self.store.put_many(&pairs)?;
        Ok(pairs.len())
    }
}
