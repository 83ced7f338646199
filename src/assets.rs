use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Crypto,
    Metal,
    Currency,
    Bigmac,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Crypto => "crypto",
            AssetClass::Metal => "metal",
            AssetClass::Currency => "currency",
            AssetClass::Bigmac => "bigmac",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference data for one tracked item. Loaded at startup, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: String,
    pub class: AssetClass,
    pub name: String,
    pub unit: String,
    /// Provider symbol: `BTC`, `XAU`, or the quote currency for pairs (`EUR`).
    pub symbol: String,
    /// CoinGecko coin id for crypto, lowercase metal name for metals.
    pub provider_id: Option<String>,
    /// Last-resort reference price used when nothing better is known.
    pub fallback_price: f64,
    pub min_plausible: f64,
    pub max_plausible: f64,
}

impl Asset {
    pub fn is_plausible(&self, price: f64) -> bool {
        price.is_finite() && price > 0.0 && price >= self.min_plausible && price <= self.max_plausible
    }

    pub fn format_price(&self, price: f64) -> String {
        if !price.is_finite() {
            return "N/A".to_string();
        }
        match self.class {
            AssetClass::Bigmac if self.unit == "JPY" => format!("¥{price:.0}"),
            AssetClass::Bigmac if self.unit == "EUR" => format!("€{price:.2}"),
            AssetClass::Bigmac if self.unit == "GBP" => format!("£{price:.2}"),
            AssetClass::Bigmac => format!("${price:.2}"),
            _ if price < 1.0 => format!("${price:.6}"),
            _ if price < 100.0 => format!("${price:.4}"),
            _ => format!("${price:.2}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn asset(
    id: &str,
    class: AssetClass,
    name: &str,
    unit: &str,
    symbol: &str,
    provider_id: Option<&str>,
    fallback_price: f64,
    (min_plausible, max_plausible): (f64, f64),
) -> Asset {
    Asset {
        id: id.to_string(),
        class,
        name: name.to_string(),
        unit: unit.to_string(),
        symbol: symbol.to_string(),
        provider_id: provider_id.map(|s| s.to_string()),
        fallback_price,
        min_plausible,
        max_plausible,
    }
}

#[derive(Debug, Clone)]
pub struct AssetCatalog {
    assets: Vec<Asset>,
}

impl AssetCatalog {
    pub fn new(assets: Vec<Asset>) -> Self {
        Self { assets }
    }

    pub fn builtin() -> Self {
        use AssetClass::*;
        Self::new(vec![
            asset("btc", Crypto, "Bitcoin", "USD", "BTC", Some("bitcoin"), 65_000.0, (100.0, 10_000_000.0)),
            asset("eth", Crypto, "Ethereum", "USD", "ETH", Some("ethereum"), 3_200.0, (1.0, 1_000_000.0)),
            asset("sol", Crypto, "Solana", "USD", "SOL", Some("solana"), 150.0, (0.01, 100_000.0)),
            asset("doge", Crypto, "Dogecoin", "USD", "DOGE", Some("dogecoin"), 0.15, (0.000_1, 1_000.0)),
            asset("gold", Metal, "Gold", "USD/oz", "XAU", Some("gold"), 2_650.0, (100.0, 100_000.0)),
            asset("silver", Metal, "Silver", "USD/oz", "XAG", Some("silver"), 31.0, (1.0, 10_000.0)),
            asset("platinum", Metal, "Platinum", "USD/oz", "XPT", Some("platinum"), 980.0, (100.0, 100_000.0)),
            asset("usd_eur", Currency, "USD → EUR", "EUR", "EUR", None, 0.92, (0.01, 100.0)),
            asset("usd_gbp", Currency, "USD → GBP", "GBP", "GBP", None, 0.79, (0.01, 100.0)),
            asset("usd_jpy", Currency, "USD → JPY", "JPY", "JPY", None, 150.0, (1.0, 10_000.0)),
            asset("bigmac_us", Bigmac, "Big Mac (US)", "USD", "USD", None, 5.69, (0.5, 100.0)),
            asset("bigmac_eu", Bigmac, "Big Mac (Euro area)", "EUR", "EUR", None, 5.28, (0.5, 100.0)),
            asset("bigmac_uk", Bigmac, "Big Mac (UK)", "GBP", "GBP", None, 4.49, (0.5, 100.0)),
            asset("bigmac_jp", Bigmac, "Big Mac (Japan)", "JPY", "JPY", None, 450.0, (50.0, 10_000.0)),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn all(&self) -> &[Asset] {
        &self.assets
    }

    /// Resolves ids in order, skipping unknown ones.
    pub fn resolve(&self, ids: &[String]) -> Vec<Asset> {
        ids.iter().filter_map(|id| self.get(id).cloned()).collect()
    }
}

pub fn default_selection() -> Vec<String> {
    ["btc", "eth", "gold", "silver", "usd_eur"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
