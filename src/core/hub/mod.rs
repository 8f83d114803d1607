//! The hub: owns the transport, REST client and every domain registry, and
//! routes inbound frames to the right one.
//!
//! Routing for the hub's own registries is a direct match on table name
//! rather than the [`crate::core::channel::Dispatcher`] trait-object
//! abstraction: the dispatcher's handlers would need independent ownership
//! of the same registries the hub already owns directly for the placement
//! pipeline and for read-only views, which the trait-object split can't
//! express without an extra layer of indirection. `Dispatcher` remains a
//! standalone, separately-tested building block for that simpler case.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{Credentials, HubSettings};
use crate::core::channel::{parse_frame, ChannelAction, ServerFrame};
use crate::core::domain::order_book::{Changed, InsertRow, Side as BookSide, UpdateRow};
use crate::core::domain::{
    Instrument, InstrumentRegistry, OrderHandle, OrderRegistry, OrderUpdateRow, PositionDiff,
    PositionRegistry, PreparedPlacement, RawBalanceRow, RawPositionRow, RawTrade, Wallet, WalletDiff,
};
use crate::core::placement;
use crate::core::rest::RestClient;
use crate::core::transport::{Transport, TransportConfig, TransportEvent};
use crate::error::Result;
use crate::metrics::{Labels, Registry};
use crate::time::parse_iso;

const MAINNET_WS_URL: &str = "wss://www.bitmex.com/realtime";
const MAINNET_REST_URL: &str = "https://www.bitmex.com/api/v1";
const TESTNET_WS_URL: &str = "wss://testnet.bitmex.com/realtime";
const TESTNET_REST_URL: &str = "https://testnet.bitmex.com/api/v1";

/// Caller-facing event surface: hub-level connection events,
/// plus one variant per entity kind that changed.
#[derive(Debug)]
pub enum HubEvent {
    Open,
    Close { code: u16, reason: String },
    Authed { ts: i64 },
    AuthError(String),
    OrderBookChanged { symbol: String, changed: Changed },
    TradesChanged { symbol: String, added: usize },
    WalletChanged { account: u64, diff: WalletDiff },
    PositionChanged { diff: PositionDiff },
    OrderChanged { handle: OrderHandle },
}

/// Owns every piece of mutable engine state plus the transport and REST
/// client. All mutation happens behind `&mut self`, matching the
/// single-executor model: nothing here is mutated from more than
/// one task.
pub struct Hub {
    settings: HubSettings,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    rest: RestClient,
    instruments: InstrumentRegistry,
    wallets: HashMap<u64, Wallet>,
    positions: PositionRegistry,
    orders: OrderRegistry,
    metrics: Registry,
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        let ws_url = if settings.is_test { TESTNET_WS_URL } else { MAINNET_WS_URL };
        let rest_url = if settings.is_test { TESTNET_REST_URL } else { MAINNET_REST_URL };

        let transport_config = TransportConfig {
            url: ws_url.to_string(),
            auth_expires_skew_sec: settings.auth_expires_skew_sec,
            ..TransportConfig::default()
        };
        let (transport, events) = Transport::spawn(transport_config);

        let rest = RestClient::new(rest_url, settings.credentials.clone())
            .with_auth_expires_skew_sec(settings.auth_expires_skew_sec);

        Self {
            settings,
            transport,
            events,
            rest,
            instruments: InstrumentRegistry::new(1_000),
            wallets: HashMap::new(),
            positions: PositionRegistry::new(),
            orders: OrderRegistry::new(),
            metrics: Registry::new(),
        }
    }

    pub fn metrics(&self) -> &Registry {
        &self.metrics
    }

    pub fn env(&self) -> &'static str {
        self.settings.env()
    }

    /// Opens the transport and, if credentials are configured, logs in.
    pub fn connect(&self) -> Result<()> {
        self.transport.connect()?;
        if let Some(creds) = self.settings.credentials.clone() {
            self.transport.login(creds)?;
        }
        Ok(())
    }

    pub fn subscribe(&self, channel: &str, symbol: Option<&str>) -> Result<()> {
        let arg = match symbol {
            Some(sym) => format!("{channel}:{sym}"),
            None => channel.to_string(),
        };
        self.transport
            .send(serde_json::json!({"op": "subscribe", "args": [arg]}).to_string())
    }

    /// Unsubscribes and resubscribes the L2 channel for one symbol; the
    /// next `partial` performs a fresh `reset`.
    pub fn resubscribe_order_book(&self, symbol: &str) -> Result<()> {
        let arg = format!("orderBookL2:{symbol}");
        self.transport
            .send(serde_json::json!({"op": "unsubscribe", "args": [arg.clone()]}).to_string())?;
        self.transport
            .send(serde_json::json!({"op": "subscribe", "args": [arg]}).to_string())
    }

    pub fn resolve_instrument(&self, symbol: &str) -> Option<std::sync::Arc<Instrument>> {
        self.instruments.resolve(symbol)
    }

    pub fn wallet(&self, account: u64) -> Option<&Wallet> {
        self.wallets.get(&account)
    }

    pub fn position(&self, account: u64, symbol: &str) -> Option<&crate::core::domain::position::PositionSnapshot> {
        self.positions.get(account, symbol)
    }

    pub fn order_by_cl_ord_id(&self, cl_ord_id: &str) -> Option<OrderHandle> {
        self.orders.by_cl_ord_id(cl_ord_id)
    }

    /// Submits a placement through the pipeline.
    pub async fn place_order(&mut self, placement: &PreparedPlacement) -> Result<OrderHandle> {
        placement::place_order(&self.rest, &mut self.orders, &self.metrics, self.env(), placement).await
    }

    /// Drains transport events, applying each to engine state, until one
    /// produces a caller-facing event or the transport worker stops.
    /// Frames that don't map to a visible change (acks, unknown channels,
    /// no-op rows) are applied silently and the loop continues.
    pub async fn next_event(&mut self) -> Option<Result<HubEvent>> {
        loop {
            let event = self.events.recv().await?;
            match self.handle_transport_event(event) {
                Ok(Some(hub_event)) => return Some(Ok(hub_event)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Result<Option<HubEvent>> {
        match event {
            TransportEvent::Open => {
                info!("transport open");
                Ok(Some(HubEvent::Open))
            }
            TransportEvent::Close { code, reason } => {
                warn!(code, %reason, "transport closed, marking private channels awaiting-partial");
                self.positions.mark_awaiting_partial();
                for wallet in self.wallets.values_mut() {
                    wallet.mark_awaiting_partial();
                }
                Ok(Some(HubEvent::Close { code, reason }))
            }
            TransportEvent::Error(message) => {
                debug!(%message, "transport error event");
                Ok(Some(HubEvent::AuthError(message)))
            }
            TransportEvent::Authed { ts } => Ok(Some(HubEvent::Authed { ts })),
            TransportEvent::AuthError(message) => Ok(Some(HubEvent::AuthError(message))),
            TransportEvent::Message(text) => self.handle_message(&text),
        }
    }

    fn handle_message(&mut self, text: &str) -> Result<Option<HubEvent>> {
        match parse_frame(text)? {
            ServerFrame::Channel { table, action, data } => self.route_channel(&table, action, data),
            ServerFrame::Welcome { .. } | ServerFrame::SubscribeAck { .. } | ServerFrame::AuthResponse(_) => {
                Ok(None)
            }
            ServerFrame::Unknown(value) => {
                debug!(?value, "unclassified frame");
                Ok(None)
            }
        }
    }

    fn route_channel(&mut self, table: &str, action: ChannelAction, data: Vec<Value>) -> Result<Option<HubEvent>> {
        match table {
            "orderBookL2" | "orderBookL2_25" => Ok(Some(self.apply_order_book(action, data))),
            "trade" => Ok(Some(self.apply_trade(data))),
            "wallet" => Ok(self.apply_wallet(action, data)),
            "position" => Ok(self.apply_position(action, data)),
            "order" => Ok(self.apply_order(data)),
            other => {
                debug!(table = other, "ignoring unknown channel");
                Ok(None)
            }
        }
    }

    fn apply_order_book(&mut self, action: ChannelAction, data: Vec<Value>) -> HubEvent {
        let symbol = data
            .first()
            .and_then(|row| row.get("symbol"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let instrument = self.instruments.get_or_create(&symbol, &symbol);
        let mut book = instrument.book.lock();

        let changed = match action {
            ChannelAction::Partial => {
                let rows = data.iter().filter_map(book_insert_row).collect();
                book.reset(rows);
                Changed::default()
            }
            ChannelAction::Insert => {
                let rows = data.iter().filter_map(book_insert_row).collect();
                book.apply_insert(rows)
            }
            ChannelAction::Update => {
                let rows = data.iter().filter_map(book_update_row).collect();
                book.apply_update(rows)
            }
            ChannelAction::Delete => {
                let ids = data.iter().filter_map(|row| row.get("id").and_then(Value::as_u64)).collect();
                book.apply_delete(ids)
            }
        };

        let out_of_sync = book.is_out_of_sync();
        drop(book);
        if out_of_sync {
            warn!(symbol, "order book out of sync, resubscribing");
            if let Err(e) = self.resubscribe_order_book(&symbol) {
                warn!(error = %e, symbol, "failed to send resubscribe request");
            }
        }

        HubEvent::OrderBookChanged { symbol, changed }
    }

    fn apply_trade(&mut self, data: Vec<Value>) -> HubEvent {
        let symbol = data
            .first()
            .and_then(|row| row.get("symbol"))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let instrument = self.instruments.get_or_create(&symbol, &symbol);
        let raw_trades = data.iter().map(raw_trade_row).collect();
        let outcome = instrument.trades.lock().push(raw_trades, false);
        HubEvent::TradesChanged { symbol, added: outcome.added }
    }

    fn apply_wallet(&mut self, action: ChannelAction, data: Vec<Value>) -> Option<HubEvent> {
        let account = data.first().and_then(|row| row.get("account")).and_then(Value::as_u64).unwrap_or(0);
        let rows: Vec<RawBalanceRow> = data.iter().map(raw_balance_row).collect();
        let wallet = self.wallets.entry(account).or_insert_with(|| Wallet::new(account));

        let diff = match action {
            ChannelAction::Partial => Some(wallet.apply_partial(rows)),
            _ => wallet.apply_incremental(rows),
        };

        diff.map(|diff| HubEvent::WalletChanged { account, diff })
    }

    fn apply_position(&mut self, action: ChannelAction, data: Vec<Value>) -> Option<HubEvent> {
        match action {
            ChannelAction::Partial => {
                let account = data.first().and_then(|row| row.get("account")).and_then(Value::as_u64).unwrap_or(0);
                let rows: Vec<RawPositionRow> = data.iter().map(raw_position_row).collect();
                let diffs = self.positions.apply_partial(account, rows);
                for diff in &diffs {
                    self.record_position_metrics(diff);
                }
                diffs.into_iter().next_back().map(|diff| HubEvent::PositionChanged { diff })
            }
            _ => {
                let mut last = None;
                for row in data.iter().map(raw_position_row) {
                    if let Some(diff) = self.positions.apply_incremental(row) {
                        self.record_position_metrics(&diff);
                        last = Some(diff);
                    }
                }
                last.map(|diff| HubEvent::PositionChanged { diff })
            }
        }
    }

    /// Records `position_update_count` and, when the diff carries a fresh
    /// snapshot, the row-timestamp-to-wall-clock latency histogram.
    fn record_position_metrics(&self, diff: &PositionDiff) {
        let labels: Labels = vec![
            ("exchange", self.env().to_string()),
            ("symbol", diff.key.1.clone()),
            ("reason", diff.reason.as_str().to_string()),
        ];
        self.metrics.incr_counter("position_update_count", &labels);
        if let Some(snapshot) = &diff.snapshot {
            let latency_ms = (Utc::now() - snapshot.timestamp).num_milliseconds() as f64;
            self.metrics.observe_histogram("position_update_latency_ms", &labels, latency_ms);
        }
    }

    fn apply_order(&mut self, data: Vec<Value>) -> Option<HubEvent> {
        let mut last = None;
        for value in &data {
            let row = order_update_row(value);
            last = Some(self.orders.apply_stream_row(row));
        }
        last.map(|handle| HubEvent::OrderChanged { handle })
    }
}

fn decimal(row: &Value, key: &str) -> Option<Decimal> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn string(row: &Value, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn timestamp(row: &Value, key: &str) -> DateTime<Utc> {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(parse_iso)
        .unwrap_or_else(Utc::now)
}

fn side_of(row: &Value) -> BookSide {
    match string(row, "side").as_deref() {
        Some("Sell") => BookSide::Sell,
        _ => BookSide::Buy,
    }
}

fn book_insert_row(row: &Value) -> Option<InsertRow> {
    Some(InsertRow {
        id: row.get("id").and_then(Value::as_u64)?,
        side: side_of(row),
        price: decimal(row, "price")?,
        size: decimal(row, "size").unwrap_or(Decimal::ZERO),
    })
}

fn book_update_row(row: &Value) -> Option<UpdateRow> {
    Some(UpdateRow {
        id: row.get("id").and_then(Value::as_u64)?,
        price: decimal(row, "price"),
        size: decimal(row, "size"),
    })
}

fn raw_trade_row(row: &Value) -> RawTrade {
    RawTrade {
        ts: row.get("timestamp").and_then(Value::as_str).and_then(parse_iso),
        side: string(row, "side"),
        price: decimal(row, "price"),
        size: decimal(row, "size"),
        id: string(row, "trdMatchID"),
        foreign_notional: decimal(row, "foreignNotional"),
    }
}

fn raw_balance_row(row: &Value) -> RawBalanceRow {
    RawBalanceRow {
        account: row.get("account").and_then(Value::as_u64).unwrap_or(0),
        currency: string(row, "currency").unwrap_or_default(),
        amount: decimal(row, "amount"),
        pending_credit: decimal(row, "pendingCredit"),
        pending_debit: decimal(row, "pendingDebit"),
        confirmed_debit: decimal(row, "confirmedDebit"),
        transfer_in: decimal(row, "transferIn"),
        transfer_out: decimal(row, "transferOut"),
        deposited: decimal(row, "deposited"),
        withdrawn: decimal(row, "withdrawn"),
        timestamp: timestamp(row, "timestamp"),
    }
}

fn raw_position_row(row: &Value) -> RawPositionRow {
    let mut passthrough = row.as_object().cloned().unwrap_or_default();
    passthrough.remove("account");
    passthrough.remove("symbol");
    passthrough.remove("currentQty");
    passthrough.remove("timestamp");
    RawPositionRow {
        account: row.get("account").and_then(Value::as_u64).unwrap_or(0),
        symbol: string(row, "symbol").unwrap_or_default(),
        current_qty: decimal(row, "currentQty").unwrap_or(Decimal::ZERO),
        timestamp: timestamp(row, "timestamp"),
        passthrough,
    }
}

fn order_update_row(row: &Value) -> OrderUpdateRow {
    OrderUpdateRow {
        order_id: string(row, "orderID"),
        cl_ord_id: string(row, "clOrdID"),
        symbol: string(row, "symbol"),
        side: string(row, "side"),
        ord_type: string(row, "ordType"),
        time_in_force: string(row, "timeInForce"),
        exec_inst: string(row, "execInst"),
        price: decimal(row, "price"),
        stop_price: decimal(row, "stopPx"),
        qty: decimal(row, "orderQty"),
        leaves_qty: decimal(row, "leavesQty"),
        cum_qty: decimal(row, "cumQty"),
        avg_px: decimal(row, "avgPx"),
        ord_status: string(row, "ordStatus"),
        exec_type: string(row, "execType"),
        exec_id: string(row, "execID"),
        last_qty: decimal(row, "lastQty"),
        last_px: decimal(row, "lastPx"),
        liquidity: string(row, "liquidity"),
        text: string(row, "text"),
        ts: timestamp(row, "transactTime"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::UpdateReason;
    use serde_json::json;

    fn settings() -> HubSettings {
        HubSettings {
            credentials: Some(Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
            }),
            ..HubSettings::default()
        }
    }

    #[test]
    fn book_insert_row_defaults_missing_size_to_zero() {
        let row = json!({"id": 1, "side": "Buy", "price": 100});
        let parsed = book_insert_row(&row).unwrap();
        assert_eq!(parsed.size, Decimal::ZERO);
    }

    #[test]
    fn book_insert_row_requires_id_and_price() {
        assert!(book_insert_row(&json!({"side": "Buy"})).is_none());
    }

    #[test]
    fn order_update_row_parses_wire_field_names() {
        let row = json!({
            "orderID": "o1",
            "clOrdID": "c1",
            "ordStatus": "New",
            "leavesQty": "100",
            "cumQty": 0,
        });
        let parsed = order_update_row(&row);
        assert_eq!(parsed.order_id.as_deref(), Some("o1"));
        assert_eq!(parsed.leaves_qty, Some(rust_decimal::Decimal::from(100)));
    }

    #[test]
    fn raw_position_row_strips_typed_fields_from_passthrough() {
        let row = json!({
            "account": 1,
            "symbol": "XBTUSD",
            "currentQty": 10,
            "timestamp": "2024-01-01T00:00:00Z",
            "markPrice": 50000,
        });
        let parsed = raw_position_row(&row);
        assert!(!parsed.passthrough.contains_key("currentQty"));
        assert!(parsed.passthrough.contains_key("markPrice"));
    }

    #[test]
    fn apply_position_partial_records_resync_counter_and_latency() {
        let mut hub = Hub::new(settings());
        let data = vec![json!({
            "account": 1,
            "symbol": "XBTUSD",
            "currentQty": 100,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })];
        let event = hub.apply_position(ChannelAction::Partial, data).unwrap();
        let HubEvent::PositionChanged { diff } = event else {
            panic!("expected PositionChanged");
        };
        assert_eq!(diff.reason, UpdateReason::Resync);

        let labels: Labels = vec![
            ("exchange", hub.env().to_string()),
            ("symbol", "XBTUSD".to_string()),
            ("reason", UpdateReason::Resync.as_str().to_string()),
        ];
        assert_eq!(hub.metrics().counter("position_update_count", &labels), 1);
        assert_eq!(hub.metrics().histogram("position_update_latency_ms", &labels).count, 1);
    }

    #[tokio::test]
    async fn hub_constructs_and_resubscribe_enqueues_without_connecting() {
        let hub = Hub::new(settings());
        // Transport is idle; `send` buffers locally rather than erroring.
        assert!(hub.resubscribe_order_book("XBTUSD").is_ok());
    }
}
