use serde::Serialize;
#[cfg(test)]
use tokio::sync::mpsc;

use crate::{alerts::AlertRule, utils::format_ts_ms};

/// What the tracker hands to whatever renders it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    PriceUpdate {
        asset: String,
        price: f64,
        /// Absolute change vs. the previous history entry.
        change: f64,
        timestamp_ms: i64,
        source: String,
    },
    AlertFired {
        rule: AlertRule,
        message: String,
        /// User preference; the sink decides whether to play anything.
        sound: bool,
    },
    /// Recoverable problem worth showing; never a crash.
    SoftError { message: String },
}

pub trait PresentationSink: Send + Sync {
    fn publish(&self, event: TrackerEvent);
}

/// Renders events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PresentationSink for LogSink {
    fn publish(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::PriceUpdate { asset, price, change, timestamp_ms, source } => {
                log::info!(
                    "price asset={} price={:.4} change={:+.4} at={} source={}",
                    asset,
                    price,
                    change,
                    format_ts_ms(timestamp_ms),
                    source
                );
            }
            TrackerEvent::AlertFired { rule, message, sound } => {
                log::warn!("alert rule={} sound={} {}", rule.id, sound, message);
            }
            TrackerEvent::SoftError { message } => {
                log::warn!("soft_error {}", message);
            }
        }
    }
}

/// Forwards events to an async consumer. A dropped receiver is ignored.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TrackerEvent>,
}

#[cfg(test)]
impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[cfg(test)]
impl PresentationSink for ChannelSink {
    fn publish(&self, event: TrackerEvent) {
        let _ = self.tx.send(event);
    }
}
