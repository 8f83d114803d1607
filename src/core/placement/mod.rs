//! Prepared-placement to REST request to Order registry pipeline.

use reqwest::Method;
use tracing::warn;

use crate::core::domain::{OrderHandle, OrderRegistry, OrderUpdateRow, PreparedPlacement};
use crate::core::rest::{RequestOptions, RestClient};
use crate::error::{ErrorKind, Result};
use crate::metrics::{Labels, Registry};
use crate::time::now_ms;

/// Decodes a `POST /order` JSON response into the row shape the order
/// registry applies. Any field absent or of the wrong shape is left unset;
/// the registry's overlay semantics treat an absent field as "unchanged".
fn response_to_row(value: &serde_json::Value) -> OrderUpdateRow {
    let s = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let d = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64().and_then(rust_decimal::Decimal::from_f64_retain)))
    };
    OrderUpdateRow {
        order_id: s("orderID"),
        cl_ord_id: s("clOrdID"),
        symbol: s("symbol"),
        side: s("side"),
        ord_type: s("ordType"),
        time_in_force: s("timeInForce"),
        exec_inst: s("execInst"),
        price: d("price"),
        stop_price: d("stopPx"),
        qty: d("orderQty"),
        leaves_qty: d("leavesQty"),
        cum_qty: d("cumQty"),
        avg_px: d("avgPx"),
        ord_status: s("ordStatus"),
        exec_type: s("execType"),
        exec_id: s("execID"),
        last_qty: d("lastQty"),
        last_px: d("lastPx"),
        liquidity: s("liquidity"),
        text: s("text"),
        ts: chrono::Utc::now(),
    }
}

/// Submits a prepared placement: validate, map to wire, record inflight,
/// `POST /order` with one classified retry, merge the response into the
/// order registry, and record the create-order latency.
pub async fn place_order(
    rest: &RestClient,
    registry: &mut OrderRegistry,
    metrics: &Registry,
    exchange: &str,
    placement: &PreparedPlacement,
) -> Result<OrderHandle> {
    placement.validate()?;
    let wire = placement.to_wire()?;
    let cl_ord_id = wire.cl_ord_id.clone();

    registry.record_inflight(cl_ord_id.clone());

    let body = serde_json::to_value(&wire)?;
    let opts = RequestOptions {
        auth: true,
        body: Some(body),
        ..Default::default()
    };

    let start = now_ms();
    let response = match rest.request(Method::POST, "/order", opts.clone()).await {
        Ok(value) => value,
        Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::ExchangeDown) => {
            warn!(error = %e, cl_ord_id, "order placement failed, retrying once");
            rest.request(Method::POST, "/order", opts).await?
        }
        Err(e) => return Err(e),
    };

    let latency_ms = (now_ms() - start) as f64;
    let labels: Labels = vec![
        ("exchange", exchange.to_string()),
        ("symbol", placement.symbol.clone()),
    ];
    metrics.observe_histogram("create_order_latency_ms", &labels, latency_ms);

    let row = response_to_row(&response);
    Ok(registry.reconcile_rest_response(&cl_ord_id, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn response_to_row_parses_numeric_and_string_fields() {
        let value = json!({
            "orderID": "ord-1",
            "clOrdID": "cl-1",
            "symbol": "XBTUSD",
            "ordStatus": "New",
            "orderQty": 100,
            "leavesQty": 100,
            "cumQty": 0,
            "price": "50000",
        });
        let row = response_to_row(&value);
        assert_eq!(row.order_id.as_deref(), Some("ord-1"));
        assert_eq!(row.cl_ord_id.as_deref(), Some("cl-1"));
        assert_eq!(row.qty, Some(dec!(100)));
        assert_eq!(row.price, Some(dec!(50000)));
        assert_eq!(row.ord_status.as_deref(), Some("New"));
    }

    #[test]
    fn response_to_row_leaves_missing_fields_unset() {
        let value = json!({"orderID": "ord-2"});
        let row = response_to_row(&value);
        assert_eq!(row.order_id.as_deref(), Some("ord-2"));
        assert!(row.cl_ord_id.is_none());
        assert!(row.price.is_none());
    }
}
