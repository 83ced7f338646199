use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    assets::{Asset, AssetCatalog, AssetClass},
    errors::SourceError,
};

/// Upstream numbers show up both as JSON numbers and as numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Num {
    F(f64),
    S(String),
}

impl Num {
    fn value(&self) -> Result<f64, SourceError> {
        match self {
            Num::F(x) => Ok(*x),
            Num::S(s) => s
                .trim()
                .replace(',', "")
                .parse::<f64>()
                .map_err(|e| SourceError::Parse(format!("numeric string {s:?}: {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceField {
    price: Num,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseSpotData,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotData {
    amount: Num,
}

#[derive(Debug, Deserialize)]
struct RatesTable {
    rates: HashMap<String, Num>,
}

/// Narrow response schemas, one per upstream shape.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteParser {
    /// `{"price": 123.4}` (gold-api.com, metals.live, Binance ticker).
    PriceField,
    /// `{"bitcoin": {"usd": 123.4}}`
    CoinGeckoSimple { id: String, vs: String },
    /// `{"data": {"amount": "123.4", ...}}`
    CoinbaseSpot,
    /// `{"rates": {"EUR": 0.92, ...}}` (Frankfurter, open.er-api).
    RatesTable { symbol: String },
}

fn decode<T: serde::de::DeserializeOwned>(raw: &JsonValue) -> Result<T, SourceError> {
    T::deserialize(raw).map_err(|e| SourceError::Parse(e.to_string()))
}

impl QuoteParser {
    pub fn parse(&self, raw: &JsonValue) -> Result<f64, SourceError> {
        match self {
            QuoteParser::PriceField => decode::<PriceField>(raw)?.price.value(),
            QuoteParser::CoinGeckoSimple { id, vs } => {
                let table: HashMap<String, HashMap<String, f64>> = decode(raw)?;
                table
                    .get(id)
                    .and_then(|m| m.get(vs))
                    .copied()
                    .ok_or_else(|| SourceError::Parse(format!("missing {id}.{vs}")))
            }
            QuoteParser::CoinbaseSpot => decode::<CoinbaseSpot>(raw)?.data.amount.value(),
            QuoteParser::RatesTable { symbol } => {
                let table: RatesTable = decode(raw)?;
                table
                    .rates
                    .get(symbol)
                    .ok_or_else(|| SourceError::Parse(format!("missing rates.{symbol}")))?
                    .value()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub parser: QuoteParser,
}

impl SourceSpec {
    pub fn new(name: &str, url: impl Into<String>, parser: QuoteParser) -> Self {
        Self { name: name.to_string(), url: url.into(), parser }
    }
}

fn standard_sources(asset: &Asset) -> Vec<SourceSpec> {
    let sym = asset.symbol.as_str();
    match asset.class {
        AssetClass::Crypto => {
            let mut out = vec![];
            if let Some(id) = asset.provider_id.as_deref() {
                out.push(SourceSpec::new(
                    "coingecko",
                    format!("https://api.coingecko.com/api/v3/simple/price?ids={id}&vs_currencies=usd"),
                    QuoteParser::CoinGeckoSimple { id: id.to_string(), vs: "usd".to_string() },
                ));
            }
            out.push(SourceSpec::new(
                "coinbase",
                format!("https://api.coinbase.com/v2/prices/{sym}-USD/spot"),
                QuoteParser::CoinbaseSpot,
            ));
            out.push(SourceSpec::new(
                "binance",
                format!("https://api.binance.com/api/v3/ticker/price?symbol={sym}USDT"),
                QuoteParser::PriceField,
            ));
            out
        }
        AssetClass::Metal => {
            let mut out = vec![SourceSpec::new(
                "gold-api",
                format!("https://api.gold-api.com/price/{sym}"),
                QuoteParser::PriceField,
            )];
            if let Some(name) = asset.provider_id.as_deref() {
                out.push(SourceSpec::new(
                    "metals.live",
                    format!("https://api.metals.live/v1/spot/{name}"),
                    QuoteParser::PriceField,
                ));
            }
            out
        }
        AssetClass::Currency => vec![
            SourceSpec::new(
                "frankfurter",
                format!("https://api.frankfurter.app/latest?from=USD&to={sym}"),
                QuoteParser::RatesTable { symbol: sym.to_string() },
            ),
            SourceSpec::new(
                "open.er-api",
                "https://open.er-api.com/v6/latest/USD",
                QuoteParser::RatesTable { symbol: sym.to_string() },
            ),
        ],
        // Published a few times a year; served from last-known-good/fallback.
        AssetClass::Bigmac => vec![],
    }
}

/// Ordered candidate sources per asset id.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    by_asset: HashMap<String, Vec<SourceSpec>>,
}

impl SourceRegistry {
    pub fn standard(catalog: &AssetCatalog) -> Self {
        let by_asset = catalog
            .all()
            .iter()
            .map(|a| (a.id.clone(), standard_sources(a)))
            .collect();
        Self { by_asset }
    }

    #[cfg(test)]
    pub fn with_sources(mut self, asset_id: &str, sources: Vec<SourceSpec>) -> Self {
        self.by_asset.insert(asset_id.to_string(), sources);
        self
    }

    /// `NoSources` for assets without any live source (unknown ids included).
    pub fn sources_for(&self, asset_id: &str) -> Result<&[SourceSpec], SourceError> {
        match self.by_asset.get(asset_id) {
            Some(sources) if !sources.is_empty() => Ok(sources.as_slice()),
            _ => Err(SourceError::NoSources),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coingecko_parser() {
        let p = QuoteParser::CoinGeckoSimple { id: "bitcoin".into(), vs: "usd".into() };
        assert_eq!(p.parse(&json!({"bitcoin": {"usd": 64123.5}})).unwrap(), 64123.5);
        assert!(matches!(p.parse(&json!({"ethereum": {"usd": 1.0}})), Err(SourceError::Parse(_))));
    }

    #[test]
    fn test_string_encoded_numbers() {
        let p = QuoteParser::CoinbaseSpot;
        let raw = json!({"data": {"amount": "64,001.25", "base": "BTC", "currency": "USD"}});
        assert_eq!(p.parse(&raw).unwrap(), 64001.25);

        let p = QuoteParser::PriceField;
        assert_eq!(p.parse(&json!({"symbol": "BTCUSDT", "price": "64000.10"})).unwrap(), 64000.10);
    }

    #[test]
    fn test_wrong_shape_is_parse_error() {
        let p = QuoteParser::RatesTable { symbol: "EUR".into() };
        assert_eq!(p.parse(&json!({"rates": {"EUR": 0.91}})).unwrap(), 0.91);
        assert!(matches!(p.parse(&json!([1, 2, 3])), Err(SourceError::Parse(_))));
        assert!(matches!(p.parse(&json!({"rates": {"EUR": "abc"}})), Err(SourceError::Parse(_))));
        assert!(matches!(QuoteParser::PriceField.parse(&json!({"price": null})), Err(SourceError::Parse(_))));
    }

    #[test]
    fn test_standard_registry_orders_sources() {
        let cat = AssetCatalog::builtin();
        let reg = SourceRegistry::standard(&cat);
        let names: Vec<_> = reg.sources_for("btc").unwrap().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["coingecko", "coinbase", "binance"]);
        assert_eq!(reg.sources_for("gold").unwrap()[0].url, "https://api.gold-api.com/price/XAU");
        assert!(matches!(reg.sources_for("bigmac_us"), Err(SourceError::NoSources)));
        assert!(matches!(reg.sources_for("unknown"), Err(SourceError::NoSources)));
    }
}
