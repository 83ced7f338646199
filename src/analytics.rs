//! Pure functions over a price series. Unless noted, series are ordered
//! most recent first, the same order `HistoryStore::load` returns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{assets::Asset, history::HistoryEntry, utils::mean};

/// Window used by support/resistance.
pub const LEVELS_WINDOW: usize = 20;
/// Window used by the day high/low (one entry per refresh).
pub const DAY_WINDOW: usize = 24;
/// Relative volatility (% of mean) below which sentiment gains confidence.
pub const CALM_VOLATILITY_PCT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Bullish => "bullish",
            Trend::Bearish => "bearish",
            Trend::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mean of the first `period` prices. `None` means "not enough data", never zero.
pub fn moving_average(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    mean(&prices[..period])
}

/// Population standard deviation of the whole slice.
pub fn volatility(prices: &[f64]) -> f64 {
    if prices.len() < 2 {
        return 0.0;
    }
    let Some(m) = mean(prices) else {
        return 0.0;
    };
    let variance = prices.iter().map(|p| (p - m).powi(2)).sum::<f64>() / prices.len() as f64;
    variance.sqrt()
}

/// Recent window `[0, 5)` against older window `[5, 10)`, ±1% dead zone.
pub fn trend(prices: &[f64]) -> Trend {
    let recent = &prices[..prices.len().min(5)];
    let older = if prices.len() > 5 { &prices[5..prices.len().min(10)] } else { &[][..] };

    let (Some(recent_avg), Some(older_avg)) = (mean(recent), mean(older)) else {
        return Trend::Neutral;
    };
    if older_avg == 0.0 {
        return Trend::Neutral;
    }

    let change = (recent_avg - older_avg) / older_avg * 100.0;
    if change > 1.0 {
        Trend::Bullish
    } else if change < -1.0 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

pub fn support(prices: &[f64]) -> Option<f64> {
    prices.iter().take(LEVELS_WINDOW).copied().reduce(f64::min)
}

pub fn resistance(prices: &[f64]) -> Option<f64> {
    prices.iter().take(LEVELS_WINDOW).copied().reduce(f64::max)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub sentiment: Trend,
    /// 50..=90
    pub confidence: u8,
}

/// Trend confirmed by the price sitting on the same side of MA(7).
pub fn sentiment(prices: &[f64]) -> SentimentReading {
    let neutral = SentimentReading { sentiment: Trend::Neutral, confidence: 50 };
    if prices.len() < 10 {
        return neutral;
    }

    let window = &prices[..10];
    let Some(ma7) = moving_average(window, 7) else {
        return neutral;
    };
    let current = window[0];
    let t = trend(window);

    let agrees = match t {
        Trend::Bullish => current > ma7,
        Trend::Bearish => current < ma7,
        Trend::Neutral => false,
    };
    if !agrees {
        return neutral;
    }

    let calm = mean(window)
        .filter(|m| *m > 0.0)
        .map(|m| volatility(window) / m * 100.0 < CALM_VOLATILITY_PCT)
        .unwrap_or(false);
    let confidence = (60 + if calm { 20 } else { 0 }).min(90);
    SentimentReading { sentiment: t, confidence }
}

/// Current price nudged by half the volatility in the trend direction, over
/// the 10 most recent prices. Never below `floor` (or zero).
pub fn predict_next_price(prices: &[f64], floor: f64) -> Option<f64> {
    if prices.len() < 3 {
        return None;
    }
    let window = &prices[..prices.len().min(10)];
    let vol = volatility(window);

    let prediction = match trend(window) {
        Trend::Bullish => window[0] + vol * 0.5,
        Trend::Bearish => window[0] - vol * 0.5,
        Trend::Neutral => window[0],
    };
    Some(prediction.max(floor.max(0.0)))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitLoss {
    pub profit: f64,
    pub percentage: f64,
    pub total_value: f64,
}

/// A zero cost basis yields a percentage of 0.
pub fn profit_loss(buy_price: f64, current_price: f64, amount: f64) -> ProfitLoss {
    let total_buy = buy_price * amount;
    let total_value = current_price * amount;
    let profit = total_value - total_buy;
    let percentage = if total_buy == 0.0 { 0.0 } else { profit / total_buy * 100.0 };
    ProfitLoss { profit, percentage, total_value }
}

pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 || !previous.is_finite() {
        return 0.0;
    }
    (current - previous) / previous * 100.0
}

/// Change of the newest price against the previous one, or against
/// `reference` when fewer than two prices exist.
pub fn change_vs_previous(prices: &[f64], reference: f64) -> f64 {
    match prices {
        [] => 0.0,
        [only] => percent_change(*only, reference),
        [current, previous, ..] => percent_change(*current, *previous),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub asset: String,
    pub samples: usize,
    pub current: f64,
    pub change_pct: f64,
    pub sma5: Option<f64>,
    pub sma10: Option<f64>,
    pub ma7: Option<f64>,
    pub volatility: f64,
    pub volatility_pct: f64,
    pub trend: Trend,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub sentiment: SentimentReading,
    pub predicted_next: Option<f64>,
}

impl AnalyticsReport {
    /// `None` for an empty history.
    pub fn build(asset: &Asset, history: &[HistoryEntry]) -> Option<Self> {
        let prices: Vec<f64> = history.iter().map(|e| e.price).collect();
        let current = *prices.first()?;
        let vol = volatility(&prices);
        let volatility_pct = mean(&prices).filter(|m| *m > 0.0).map(|m| vol / m * 100.0).unwrap_or(0.0);
        let day = &prices[..prices.len().min(DAY_WINDOW)];

        Some(Self {
            asset: asset.id.clone(),
            samples: prices.len(),
            current,
            change_pct: change_vs_previous(&prices, asset.fallback_price),
            sma5: moving_average(&prices, 5),
            sma10: moving_average(&prices, 10),
            ma7: moving_average(&prices, 7),
            volatility: vol,
            volatility_pct,
            trend: trend(&prices),
            support: support(&prices),
            resistance: resistance(&prices),
            day_high: day.iter().copied().reduce(f64::max),
            day_low: day.iter().copied().reduce(f64::min),
            sentiment: sentiment(&prices),
            predicted_next: predict_next_price(&prices, asset.min_plausible),
        })
    }
}
