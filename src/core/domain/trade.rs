//! Bounded, deduplicated, time-ordered trade tape.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

pub const TRADE_BUFFER_MIN: usize = 100;
pub const TRADE_BUFFER_MAX: usize = 10_000;
const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub ts: DateTime<Utc>,
    pub side: String,
    pub price: Decimal,
    pub size: Option<Decimal>,
    pub id: Option<String>,
    pub foreign_notional: Option<Decimal>,
}

/// A raw wire row before normalization; any of these may be absent.
#[derive(Debug, Clone, Default)]
pub struct RawTrade {
    pub ts: Option<DateTime<Utc>>,
    pub side: Option<String>,
    pub price: Option<Decimal>,
    pub size: Option<Decimal>,
    pub id: Option<String>,
    pub foreign_notional: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushOutcome {
    pub added: usize,
    pub dropped: usize,
}

pub struct TradeTape {
    capacity: usize,
    rows: VecDeque<Trade>,
    seen_ids: HashSet<String>,
}

impl TradeTape {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(TRADE_BUFFER_MIN, TRADE_BUFFER_MAX);
        Self {
            capacity,
            rows: VecDeque::with_capacity(capacity),
            seen_ids: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Trade> {
        self.rows.iter()
    }

    /// Normalizes, sorts, deduplicates and appends `batch`. If `reset`,
    /// the buffer is emptied first. Rows missing timestamp, side, or a
    /// derivable price are skipped (not counted as dropped-for-capacity).
    pub fn push(&mut self, batch: Vec<RawTrade>, reset: bool) -> PushOutcome {
        if reset {
            self.rows.clear();
            self.seen_ids.clear();
        }

        let mut normalized: Vec<(usize, Trade)> = batch
            .into_iter()
            .enumerate()
            .filter_map(|(idx, raw)| normalize(raw).map(|t| (idx, t)))
            .collect();

        normalized.sort_by(|(ia, a), (ib, b)| a.ts.cmp(&b.ts).then(ia.cmp(ib)));

        let mut added = 0usize;
        for (_, trade) in normalized {
            if let Some(id) = &trade.id {
                if self.seen_ids.contains(id) {
                    continue;
                }
                self.seen_ids.insert(id.clone());
            }
            self.rows.push_back(trade);
            added += 1;
        }

        let mut dropped = 0usize;
        while self.rows.len() > self.capacity {
            if let Some(old) = self.rows.pop_front() {
                if let Some(id) = old.id {
                    self.seen_ids.remove(&id);
                }
            }
            dropped += 1;
        }

        PushOutcome { added, dropped }
    }
}

fn normalize(raw: RawTrade) -> Option<Trade> {
    let ts = raw.ts?;
    let side = raw.side?.to_ascii_lowercase();
    let price = match raw.price {
        Some(p) => p,
        None => {
            let (notional, size) = (raw.foreign_notional?, raw.size?);
            if size == Decimal::ZERO {
                return None;
            }
            notional / size
        }
    };
    Some(Trade {
        ts,
        side,
        price,
        size: raw.size,
        id: raw.id,
        foreign_notional: raw.foreign_notional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn dedups_by_id_within_a_batch() {
        let mut tape = TradeTape::new(DEFAULT_CAPACITY);
        let batch = vec![
            RawTrade {
                ts: Some(ts(0)),
                side: Some("Buy".into()),
                price: Some(dec!(100)),
                id: Some("t1".into()),
                ..Default::default()
            },
            RawTrade {
                ts: Some(ts(0)),
                side: Some("Buy".into()),
                price: Some(dec!(100)),
                id: Some("t1".into()),
                ..Default::default()
            },
        ];
        let outcome = tape.push(batch, false);
        assert_eq!(outcome.added, 1);
        assert_eq!(tape.len(), 1);
    }

    #[test]
    fn sorts_by_timestamp_then_original_index() {
        let mut tape = TradeTape::new(DEFAULT_CAPACITY);
        let batch = vec![
            RawTrade {
                ts: Some(ts(5)),
                side: Some("buy".into()),
                price: Some(dec!(1)),
                ..Default::default()
            },
            RawTrade {
                ts: Some(ts(1)),
                side: Some("sell".into()),
                price: Some(dec!(2)),
                ..Default::default()
            },
        ];
        tape.push(batch, false);
        let rows: Vec<&Trade> = tape.rows().collect();
        assert_eq!(rows[0].price, dec!(2));
        assert_eq!(rows[1].price, dec!(1));
    }

    #[test]
    fn price_falls_back_to_notional_over_size() {
        let raw = RawTrade {
            ts: Some(ts(0)),
            side: Some("Buy".into()),
            price: None,
            size: Some(dec!(2)),
            foreign_notional: Some(dec!(10)),
            id: None,
        };
        let mut tape = TradeTape::new(DEFAULT_CAPACITY);
        tape.push(vec![raw], false);
        assert_eq!(tape.rows().next().unwrap().price, dec!(5));
    }

    #[test]
    fn rows_missing_required_fields_are_skipped() {
        let mut tape = TradeTape::new(DEFAULT_CAPACITY);
        let outcome = tape.push(
            vec![RawTrade {
                ts: None,
                side: Some("buy".into()),
                price: Some(dec!(1)),
                ..Default::default()
            }],
            false,
        );
        assert_eq!(outcome.added, 0);
        assert!(tape.is_empty());
    }

    #[test]
    fn capacity_is_clamped_and_overflow_drops_oldest() {
        let mut tape = TradeTape::new(1);
        assert_eq!(tape.capacity, TRADE_BUFFER_MIN);
        let batch: Vec<RawTrade> = (0..5)
            .map(|i| RawTrade {
                ts: Some(ts(i)),
                side: Some("buy".into()),
                price: Some(dec!(1)),
                id: Some(format!("id{i}")),
                ..Default::default()
            })
            .collect();
        let outcome = tape.push(batch, false);
        assert_eq!(tape.len(), TRADE_BUFFER_MIN);
        assert!(outcome.dropped > 0);
    }

    #[test]
    fn reset_clears_existing_rows_before_pushing() {
        let mut tape = TradeTape::new(DEFAULT_CAPACITY);
        tape.push(
            vec![RawTrade {
                ts: Some(ts(0)),
                side: Some("buy".into()),
                price: Some(dec!(1)),
                id: Some("old".into()),
                ..Default::default()
            }],
            false,
        );
        tape.push(
            vec![RawTrade {
                ts: Some(ts(1)),
                side: Some("sell".into()),
                price: Some(dec!(2)),
                id: Some("new".into()),
                ..Default::default()
            }],
            true,
        );
        assert_eq!(tape.len(), 1);
        assert_eq!(tape.rows().next().unwrap().price, dec!(2));
    }
}
