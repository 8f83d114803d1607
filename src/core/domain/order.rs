//! Order lifecycle state machine, execution aggregation and inflight
//! reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum OrderStatus {
    Placed,
    PartiallyFilled,
    Filled,
    Canceling,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Status priority table: higher wins, terminal never
    /// overwritten by a lower-priority status.
    pub fn priority(self) -> u8 {
        match self {
            OrderStatus::Filled => 6,
            OrderStatus::PartiallyFilled => 5,
            OrderStatus::Rejected => 4,
            OrderStatus::Canceled | OrderStatus::Expired => 3,
            OrderStatus::Canceling => 2,
            OrderStatus::Placed => 1,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub exec_id: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
    pub liquidity: Option<String>,
}

/// A raw private-stream `execReport`-style row. Any field not present on
/// the wire is `None` and left unchanged by an overlay.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdateRow {
    pub order_id: Option<String>,
    pub cl_ord_id: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub ord_type: Option<String>,
    pub time_in_force: Option<String>,
    pub exec_inst: Option<String>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty: Option<Decimal>,
    pub leaves_qty: Option<Decimal>,
    pub cum_qty: Option<Decimal>,
    pub avg_px: Option<Decimal>,
    pub ord_status: Option<String>,
    pub exec_type: Option<String>,
    pub exec_id: Option<String>,
    pub last_qty: Option<Decimal>,
    pub last_px: Option<Decimal>,
    pub liquidity: Option<String>,
    pub text: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSnapshot {
    pub order_id: Option<String>,
    pub cl_ord_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub time_in_force: Option<String>,
    pub exec_inst: Option<String>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty: Decimal,
    pub leaves_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub executions: Vec<Execution>,
    pub last_update_ts: DateTime<Utc>,
    pub text: Option<String>,
}

/// Maps `ordStatus` to a candidate status.
fn status_from_ord_status(ord_status: &str) -> Option<OrderStatus> {
    match ord_status {
        "New" | "Triggered" => Some(OrderStatus::Placed),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Canceled" => Some(OrderStatus::Canceled),
        "Rejected" => Some(OrderStatus::Rejected),
        "Expired" => Some(OrderStatus::Expired),
        _ => None,
    }
}

/// Maps `execType` (plus quantity context) to a candidate status.
fn status_from_exec_type(
    exec_type: &str,
    leaves_qty: Option<Decimal>,
    cum_qty: Option<Decimal>,
    current: OrderStatus,
) -> Option<OrderStatus> {
    match exec_type {
        "Trade" => {
            let leaves = leaves_qty.unwrap_or(Decimal::ZERO);
            let cum = cum_qty.unwrap_or(Decimal::ZERO);
            if leaves <= Decimal::ZERO && cum > Decimal::ZERO {
                Some(OrderStatus::Filled)
            } else {
                Some(OrderStatus::PartiallyFilled)
            }
        }
        "Canceled" => {
            if current == OrderStatus::Filled {
                None
            } else {
                Some(OrderStatus::Canceled)
            }
        }
        "New" => {
            let partial = cum_qty.map(|q| q > Decimal::ZERO).unwrap_or(false);
            Some(if partial {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Placed
            })
        }
        "Restated" | "Calculated" | "Settlement" => {
            let leaves = leaves_qty.unwrap_or(Decimal::ZERO);
            let cum = cum_qty.unwrap_or(Decimal::ZERO);
            if cum > Decimal::ZERO && leaves <= Decimal::ZERO {
                Some(OrderStatus::Filled)
            } else if cum > Decimal::ZERO {
                Some(OrderStatus::PartiallyFilled)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Quantity-derived candidate: filled-but-not-flagged rows still resolve
/// to a sensible status from `leavesQty`/`cumQty` alone.
fn status_from_quantities(leaves_qty: Option<Decimal>, cum_qty: Option<Decimal>) -> Option<OrderStatus> {
    let leaves = leaves_qty?;
    let cum = cum_qty.unwrap_or(Decimal::ZERO);
    if leaves <= Decimal::ZERO && cum > Decimal::ZERO {
        Some(OrderStatus::Filled)
    } else if cum > Decimal::ZERO {
        Some(OrderStatus::PartiallyFilled)
    } else {
        None
    }
}

/// Picks the highest-priority non-null candidate among the three
/// independent mappings. A status only ever moves up the priority table;
/// it never demotes, so a terminal current status is sticky.
fn resolve_status(current: OrderStatus, row: &OrderUpdateRow) -> OrderStatus {
    let candidates = [
        row.ord_status.as_deref().and_then(status_from_ord_status),
        row.exec_type
            .as_deref()
            .and_then(|et| status_from_exec_type(et, row.leaves_qty, row.cum_qty, current)),
        status_from_quantities(row.leaves_qty, row.cum_qty),
    ];

    let mut best = current;
    for candidate in candidates.into_iter().flatten() {
        if candidate.priority() > best.priority() {
            best = candidate;
        }
    }
    best
}

#[derive(Debug)]
pub struct OrderRecord {
    pub snapshot: OrderSnapshot,
}

impl OrderRecord {
    fn new(row: &OrderUpdateRow) -> Self {
        let status = resolve_status(OrderStatus::Placed, row);
        Self {
            snapshot: OrderSnapshot {
                order_id: row.order_id.clone(),
                cl_ord_id: row.cl_ord_id.clone(),
                symbol: row.symbol.clone().unwrap_or_default(),
                side: row.side.clone().unwrap_or_default(),
                order_type: row.ord_type.clone().unwrap_or_default(),
                time_in_force: row.time_in_force.clone(),
                exec_inst: row.exec_inst.clone(),
                price: row.price,
                stop_price: row.stop_price,
                qty: row.qty.unwrap_or(Decimal::ZERO),
                leaves_qty: row.leaves_qty.unwrap_or(Decimal::ZERO),
                filled_qty: row.cum_qty.unwrap_or(Decimal::ZERO),
                avg_fill_price: row.avg_px.unwrap_or(Decimal::ZERO),
                status,
                executions: Vec::new(),
                last_update_ts: row.ts,
                text: row.text.clone(),
            },
        }
    }

    /// Applies a field overlay under the invariant that `filledQty +
    /// leavesQty <= qty`, appending any new execution and recomputing
    /// VWAP from retained executions when the server doesn't provide
    /// `avgPx`.
    pub fn apply_update(&mut self, row: &OrderUpdateRow) {
        let s = &mut self.snapshot;

        if let Some(qty) = row.qty {
            s.qty = qty;
        }
        if let Some(leaves) = row.leaves_qty {
            s.leaves_qty = leaves;
        }
        if let Some(cum) = row.cum_qty {
            s.filled_qty = cum;
        }
        if let Some(price) = row.price {
            s.price = Some(price);
        }
        if let Some(stop) = row.stop_price {
            s.stop_price = Some(stop);
        }
        if row.text.is_some() {
            s.text = row.text.clone();
        }

        let has_exec = row.exec_id.is_some() || row.last_qty.is_some();
        if has_exec {
            if let Some(exec_id) = &row.exec_id {
                let already_applied = s.executions.iter().any(|e| &e.exec_id == exec_id);
                if !already_applied {
                    s.executions.push(Execution {
                        exec_id: exec_id.clone(),
                        qty: row.last_qty.unwrap_or(Decimal::ZERO),
                        price: row.last_px.unwrap_or(Decimal::ZERO),
                        ts: row.ts,
                        liquidity: row.liquidity.clone(),
                    });
                }
            }
        }

        if row.avg_px.is_none() && !s.executions.is_empty() {
            let total_qty: Decimal = s.executions.iter().map(|e| e.qty).sum();
            if total_qty > Decimal::ZERO {
                let weighted: Decimal = s.executions.iter().map(|e| e.qty * e.price).sum();
                s.avg_fill_price = weighted / total_qty;
            }
        } else if let Some(avg_px) = row.avg_px {
            s.avg_fill_price = avg_px;
        }

        s.status = resolve_status(s.status, row);
        s.last_update_ts = row.ts;
    }

    /// Local marker: sets `Canceling` without touching executions. Any
    /// later terminal status from the stream overrides it.
    pub fn mark_canceling(&mut self) {
        if !self.snapshot.status.is_terminal() {
            self.snapshot.status = OrderStatus::Canceling;
        }
    }
}

pub type OrderHandle = Arc<Mutex<OrderRecord>>;

/// Transient inflight placement record, removed once reconciled into the
/// registry either by the REST response or a racing stream row.
pub struct Inflight {
    pub cl_ord_id: String,
}

/// Cross-indexed order registry: by `orderId`, by `clOrdId`, and the
/// inflight map.
#[derive(Default)]
pub struct OrderRegistry {
    by_order_id: HashMap<String, OrderHandle>,
    by_cl_ord_id: HashMap<String, OrderHandle>,
    inflight: HashMap<String, Inflight>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_order_id(&self, order_id: &str) -> Option<OrderHandle> {
        self.by_order_id.get(order_id).cloned()
    }

    pub fn by_cl_ord_id(&self, cl_ord_id: &str) -> Option<OrderHandle> {
        self.by_cl_ord_id.get(cl_ord_id).cloned()
    }

    pub fn record_inflight(&mut self, cl_ord_id: String) {
        self.inflight.insert(
            cl_ord_id.clone(),
            Inflight {
                cl_ord_id,
            },
        );
    }

    pub fn is_inflight(&self, cl_ord_id: &str) -> bool {
        self.inflight.contains_key(cl_ord_id)
    }

    fn index(&mut self, handle: OrderHandle) {
        let snap = handle.lock().snapshot.clone_ids();
        if let Some(order_id) = snap.0 {
            self.by_order_id.insert(order_id, handle.clone());
        }
        if let Some(cl_ord_id) = snap.1 {
            self.by_cl_ord_id.insert(cl_ord_id.clone(), handle);
            self.inflight.remove(&cl_ord_id);
        }
    }

    /// Applies a private-stream row: looks up by whichever id is present,
    /// creates an Order on first reference, and promotes any matching
    /// inflight record.
    pub fn apply_stream_row(&mut self, row: OrderUpdateRow) -> OrderHandle {
        let existing = row
            .order_id
            .as_deref()
            .and_then(|id| self.by_order_id.get(id).cloned())
            .or_else(|| {
                row.cl_ord_id
                    .as_deref()
                    .and_then(|id| self.by_cl_ord_id.get(id).cloned())
            });

        let handle = match existing {
            Some(handle) => {
                handle.lock().apply_update(&row);
                handle
            }
            None => Arc::new(Mutex::new(OrderRecord::new(&row))),
        };
        self.index(handle.clone());
        handle
    }

    /// Inflight reconciliation for a REST placement response: if a stream
    /// row already created the Order for this `clOrdId`, merge the REST
    /// payload into it; otherwise create it fresh from the REST payload.
    /// Either way, the inflight entry is removed and exactly one Order
    /// results.
    pub fn reconcile_rest_response(&mut self, cl_ord_id: &str, row: OrderUpdateRow) -> OrderHandle {
        let handle = match self.by_cl_ord_id.get(cl_ord_id).cloned() {
            Some(handle) => {
                handle.lock().apply_update(&row);
                handle
            }
            None => Arc::new(Mutex::new(OrderRecord::new(&row))),
        };
        self.index(handle.clone());
        handle
    }

    pub fn mark_canceling(&mut self, cl_ord_id: &str) {
        if let Some(handle) = self.by_cl_ord_id.get(cl_ord_id) {
            handle.lock().mark_canceling();
        }
    }
}

impl OrderSnapshot {
    fn clone_ids(&self) -> (Option<String>, Option<String>) {
        (self.order_id.clone(), self.cl_ord_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_row(ts_secs: i64) -> OrderUpdateRow {
        OrderUpdateRow {
            order_id: Some("ord-1".into()),
            symbol: Some("XBTUSD".into()),
            side: Some("Buy".into()),
            ord_type: Some("Limit".into()),
            qty: Some(dec!(100)),
            leaves_qty: Some(dec!(100)),
            cum_qty: Some(dec!(0)),
            ord_status: Some("New".into()),
            ts: chrono::Utc.timestamp_opt(1_700_000_000 + ts_secs, 0).unwrap(),
            ..Default::default()
        }
    }

    use chrono::TimeZone;

    #[test]
    fn order_lifecycle_tracks_vwap_and_dedupes_executions() {
        let mut registry = OrderRegistry::new();
        let handle = registry.apply_stream_row(base_row(0));

        let mut trade1 = base_row(1);
        trade1.exec_type = Some("Trade".into());
        trade1.cum_qty = Some(dec!(60));
        trade1.leaves_qty = Some(dec!(40));
        trade1.avg_px = Some(dec!(50100));
        trade1.exec_id = Some("f1".into());
        trade1.last_qty = Some(dec!(60));
        trade1.last_px = Some(dec!(50100));
        registry.apply_stream_row(trade1);

        let mut trade2 = base_row(2);
        trade2.exec_type = Some("Trade".into());
        trade2.cum_qty = Some(dec!(100));
        trade2.leaves_qty = Some(dec!(0));
        trade2.avg_px = Some(dec!(50150));
        trade2.exec_id = Some("f2".into());
        trade2.last_qty = Some(dec!(40));
        trade2.last_px = Some(dec!(50150));
        registry.apply_stream_row(trade2.clone());

        // Duplicate of f2: lastUpdateTs changes, nothing else.
        let mut dup = trade2.clone();
        dup.ts = chrono::Utc.timestamp_opt(1_700_000_010, 0).unwrap();
        registry.apply_stream_row(dup);

        let snap = handle.lock().snapshot.clone();
        assert_eq!(snap.status, OrderStatus::Filled);
        assert_eq!(snap.filled_qty, dec!(100));
        assert_eq!(snap.avg_fill_price, dec!(50150));
        assert_eq!(snap.executions.len(), 2);
    }

    #[test]
    fn vwap_computed_locally_when_avg_px_absent() {
        let mut registry = OrderRegistry::new();
        let handle = registry.apply_stream_row(base_row(0));

        let mut t1 = base_row(1);
        t1.exec_type = Some("Trade".into());
        t1.avg_px = None;
        t1.exec_id = Some("e1".into());
        t1.last_qty = Some(dec!(10));
        t1.last_px = Some(dec!(100));
        t1.cum_qty = Some(dec!(10));
        t1.leaves_qty = Some(dec!(90));
        registry.apply_stream_row(t1);

        let mut t2 = base_row(2);
        t2.exec_type = Some("Trade".into());
        t2.avg_px = None;
        t2.exec_id = Some("e2".into());
        t2.last_qty = Some(dec!(30));
        t2.last_px = Some(dec!(110));
        t2.cum_qty = Some(dec!(40));
        t2.leaves_qty = Some(dec!(60));
        registry.apply_stream_row(t2);

        let snap = handle.lock().snapshot.clone();
        // (10*100 + 30*110) / 40 = 107.5
        assert_eq!(snap.avg_fill_price, dec!(107.5));
    }

    #[test]
    fn terminal_status_is_never_demoted() {
        let mut registry = OrderRegistry::new();
        let handle = registry.apply_stream_row(base_row(0));

        let mut filled = base_row(1);
        filled.exec_type = Some("Trade".into());
        filled.cum_qty = Some(dec!(100));
        filled.leaves_qty = Some(dec!(0));
        filled.exec_id = Some("e1".into());
        filled.last_qty = Some(dec!(100));
        registry.apply_stream_row(filled);
        assert_eq!(handle.lock().snapshot.status, OrderStatus::Filled);

        let mut stray_cancel = base_row(2);
        stray_cancel.ord_status = Some("Canceled".into());
        stray_cancel.exec_type = None;
        registry.apply_stream_row(stray_cancel);
        assert_eq!(handle.lock().snapshot.status, OrderStatus::Filled);
    }

    #[test]
    fn inflight_reconciliation_yields_exactly_one_order_either_order() {
        // Stream row arrives first.
        let mut registry = OrderRegistry::new();
        registry.record_inflight("cl-1".to_string());
        let mut row = base_row(0);
        row.order_id = Some("srv-1".into());
        row.cl_ord_id = Some("cl-1".into());
        let from_stream = registry.apply_stream_row(row.clone());
        assert!(!registry.is_inflight("cl-1"));

        let from_rest = registry.reconcile_rest_response("cl-1", row);
        assert!(Arc::ptr_eq(&from_stream, &from_rest));
        assert_eq!(registry.by_order_id("srv-1").unwrap().lock().snapshot.order_id, Some("srv-1".to_string()));
    }

    #[test]
    fn mark_canceling_sets_status_without_touching_executions() {
        let mut registry = OrderRegistry::new();
        let handle = registry.apply_stream_row(base_row(0));
        handle.lock().mark_canceling();
        assert_eq!(handle.lock().snapshot.status, OrderStatus::Canceling);
        assert!(handle.lock().snapshot.executions.is_empty());
    }
}
