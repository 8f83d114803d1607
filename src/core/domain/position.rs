//! Per-`(account, symbol)` position mirror.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};

use super::wallet::UpdateReason;
use crate::time::stable_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Buy,
    Sell,
}

/// Position snapshot. The several dozen wire fields not worth individually
/// naming (mark price, PnLs, margins, leverage, liquidation/bankrupt
/// prices, ...) are carried in `passthrough` instead: a typed core of the
/// fields every caller needs, plus an open map for the rest.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub account: u64,
    pub symbol: String,
    pub current_qty: Decimal,
    pub size: Decimal,
    pub side: PositionSide,
    pub is_open: bool,
    pub timestamp: DateTime<Utc>,
    pub passthrough: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RawPositionRow {
    pub account: u64,
    pub symbol: String,
    pub current_qty: Decimal,
    pub timestamp: DateTime<Utc>,
    pub passthrough: serde_json::Map<String, Value>,
}

fn snapshot_from_row(row: RawPositionRow) -> PositionSnapshot {
    let size = row.current_qty.abs();
    let side = if row.current_qty < Decimal::ZERO {
        PositionSide::Sell
    } else {
        PositionSide::Buy
    };
    PositionSnapshot {
        account: row.account,
        symbol: row.symbol,
        current_qty: row.current_qty,
        size,
        side,
        is_open: size > Decimal::ZERO,
        timestamp: row.timestamp,
        passthrough: row.passthrough,
    }
}

fn snapshot_json(s: &PositionSnapshot) -> Value {
    let mut map = s.passthrough.clone();
    map.insert("currentQty".into(), json!(s.current_qty.to_string()));
    map.insert("size".into(), json!(s.size.to_string()));
    map.insert("timestamp".into(), json!(s.timestamp.to_rfc3339()));
    Value::Object(map)
}

struct Entry {
    snapshot: PositionSnapshot,
    last_applied_ts: DateTime<Utc>,
    last_hash: u64,
}

/// Registry of open positions keyed by `(account, symbol)`. Evicts an
/// entry whenever its resulting `size == 0`.
#[derive(Default)]
pub struct PositionRegistry {
    entries: HashMap<(u64, String), Entry>,
    awaiting_partial: bool,
}

/// One `(account, symbol)` diff entry for a caller-facing `update(snapshot,
/// diff, reason)` event, mirroring [`WalletDiff`](super::WalletDiff).
#[derive(Debug, Clone)]
pub struct PositionDiff {
    pub key: (u64, String),
    pub snapshot: Option<PositionSnapshot>,
    pub evicted: bool,
    pub reason: UpdateReason,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            awaiting_partial: true,
        }
    }

    pub fn mark_awaiting_partial(&mut self) {
        self.awaiting_partial = true;
    }

    pub fn is_awaiting_partial(&self) -> bool {
        self.awaiting_partial
    }

    pub fn get(&self, account: u64, symbol: &str) -> Option<&PositionSnapshot> {
        self.entries.get(&(account, symbol.to_string())).map(|e| &e.snapshot)
    }

    pub fn keys_for_account(&self, account: u64) -> Vec<String> {
        self.entries
            .keys()
            .filter(|(acc, _)| *acc == account)
            .map(|(_, sym)| sym.clone())
            .collect()
    }

    /// Applies a `partial` snapshot for one account: clears the
    /// awaiting-partial flag, applies/creates positions for the rows
    /// given, and evicts any position previously held for this account
    /// that is absent from the partial (reset to `size == 0` with
    /// `allowOlderTimestamp = true`).
    pub fn apply_partial(&mut self, account: u64, rows: Vec<RawPositionRow>) -> Vec<PositionDiff> {
        self.awaiting_partial = false;
        let mut folded: HashMap<String, RawPositionRow> = HashMap::new();
        for row in rows {
            match folded.get(&row.symbol) {
                Some(existing) if existing.timestamp > row.timestamp => {}
                _ => {
                    folded.insert(row.symbol.clone(), row);
                }
            }
        }

        let mut diffs = Vec::new();
        let present_symbols: std::collections::HashSet<String> = folded.keys().cloned().collect();

        for (symbol, row) in folded {
            let key = (account, symbol.clone());
            let snapshot = snapshot_from_row(row.clone());
            let hash = stable_hash(&snapshot_json(&snapshot));

            if let Some(existing) = self.entries.get(&key) {
                if existing.last_applied_ts == snapshot.timestamp && existing.last_hash == hash {
                    continue; // duplicate: same timestamp, same snapshot hash
                }
            }

            if snapshot.size == Decimal::ZERO {
                self.entries.remove(&key);
                diffs.push(PositionDiff {
                    key,
                    snapshot: None,
                    evicted: true,
                    reason: UpdateReason::Resync,
                });
                continue;
            }

            self.entries.insert(
                key.clone(),
                Entry {
                    snapshot: snapshot.clone(),
                    last_applied_ts: snapshot.timestamp,
                    last_hash: hash,
                },
            );
            diffs.push(PositionDiff {
                key,
                snapshot: Some(snapshot),
                evicted: false,
                reason: UpdateReason::Resync,
            });
        }

        let held_symbols: Vec<String> = self
            .entries
            .keys()
            .filter(|(acc, _)| *acc == account)
            .map(|(_, sym)| sym.clone())
            .filter(|sym| !present_symbols.contains(sym))
            .collect();
        for symbol in held_symbols {
            let key = (account, symbol);
            self.entries.remove(&key);
            diffs.push(PositionDiff {
                key,
                snapshot: None,
                evicted: true,
                reason: UpdateReason::Resync,
            });
        }

        diffs
    }

    /// Applies an incremental insert/update/delete row. Ignored entirely
    /// while awaiting a partial. Rejects a row strictly older than the
    /// last applied timestamp for that key, or one equal in timestamp
    /// whose update hash matches (no-op).
    pub fn apply_incremental(&mut self, row: RawPositionRow) -> Option<PositionDiff> {
        if self.awaiting_partial {
            return None;
        }
        let key = (row.account, row.symbol.clone());
        let snapshot = snapshot_from_row(row);
        let hash = stable_hash(&snapshot_json(&snapshot));

        if let Some(existing) = self.entries.get(&key) {
            if snapshot.timestamp < existing.last_applied_ts {
                return None;
            }
            if snapshot.timestamp == existing.last_applied_ts && hash == existing.last_hash {
                return None;
            }
        }

        if snapshot.size == Decimal::ZERO {
            let existed = self.entries.remove(&key).is_some();
            if !existed {
                return None;
            }
            return Some(PositionDiff {
                key,
                snapshot: None,
                evicted: true,
                reason: UpdateReason::Update,
            });
        }

        self.entries.insert(
            key.clone(),
            Entry {
                snapshot: snapshot.clone(),
                last_applied_ts: snapshot.timestamp,
                last_hash: hash,
            },
        );
        Some(PositionDiff {
            key,
            snapshot: Some(snapshot),
            evicted: false,
            reason: UpdateReason::Update,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_iso;

    fn t(s: &str) -> DateTime<Utc> {
        parse_iso(s).unwrap()
    }

    fn row(account: u64, symbol: &str, qty: i64, ts: &str) -> RawPositionRow {
        RawPositionRow {
            account,
            symbol: symbol.into(),
            current_qty: Decimal::from(qty),
            timestamp: t(ts),
            passthrough: serde_json::Map::new(),
        }
    }

    #[test]
    fn position_lifecycle_tracks_qty_staleness_and_eviction_across_updates() {
        let mut registry = PositionRegistry::new();

        registry.apply_partial(
            101,
            vec![
                row(101, "XBTUSD", 200, "2024-01-01T00:00:00Z"),
                row(101, "ETHUSD", -100, "2024-01-01T00:00:00Z"),
            ],
        );
        assert!(!registry.is_awaiting_partial());

        let diff = registry
            .apply_incremental(row(101, "XBTUSD", 230, "2024-01-01T00:01:30Z"))
            .unwrap();
        assert_eq!(diff.snapshot.unwrap().current_qty, Decimal::from(230));

        // Stale update: no effect.
        let stale = registry.apply_incremental(row(101, "XBTUSD", 210, "2024-01-01T00:00:00Z"));
        // Equal-or-newer-than-partial but older than 00:01:30 -> rejected.
        assert!(stale.is_none());
        assert_eq!(
            registry.get(101, "XBTUSD").unwrap().current_qty,
            Decimal::from(230)
        );

        let evicted = registry
            .apply_incremental(row(101, "ETHUSD", 0, "2024-01-01T00:02:00Z"))
            .unwrap();
        assert!(evicted.evicted);
        assert!(registry.get(101, "ETHUSD").is_none());

        // Reconnect partial: XBTUSD refreshed, SOLUSD created, any
        // previously-held symbol absent from the partial is evicted.
        registry.entries.insert(
            (101, "ADAUSD".to_string()),
            Entry {
                snapshot: snapshot_from_row(row(101, "ADAUSD", 5, "2024-01-01T00:03:00Z")),
                last_applied_ts: t("2024-01-01T00:03:00Z"),
                last_hash: 0,
            },
        );
        registry.mark_awaiting_partial();
        let diffs = registry.apply_partial(
            101,
            vec![
                row(101, "XBTUSD", 150, "2024-01-01T00:05:00Z"),
                row(101, "SOLUSD", 30, "2024-01-01T00:05:00Z"),
            ],
        );
        assert!(registry.get(101, "ADAUSD").is_none());
        assert!(registry.get(101, "SOLUSD").is_some());
        assert_eq!(
            registry.get(101, "XBTUSD").unwrap().current_qty,
            Decimal::from(150)
        );
        let evicted_ada = diffs.iter().any(|d| d.key.1 == "ADAUSD" && d.evicted);
        assert!(evicted_ada);
    }

    #[test]
    fn incremental_ignored_while_awaiting_partial() {
        let mut registry = PositionRegistry::new();
        assert!(registry.is_awaiting_partial());
        let result = registry.apply_incremental(row(1, "XBTUSD", 10, "2024-01-01T00:00:00Z"));
        assert!(result.is_none());
    }

    #[test]
    fn duplicate_same_timestamp_and_hash_is_a_noop() {
        let mut registry = PositionRegistry::new();
        registry.apply_partial(1, vec![row(1, "XBTUSD", 10, "2024-01-01T00:00:00Z")]);
        let dup = registry.apply_incremental(row(1, "XBTUSD", 10, "2024-01-01T00:00:00Z"));
        assert!(dup.is_none());
    }
}
