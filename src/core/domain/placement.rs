//! Prepared placement input and wire mapping.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::order_book::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
    FillOrKill,
}

impl TimeInForce {
    fn wire(self) -> &'static str {
        match self {
            TimeInForce::GoodTillCancel => "GoodTillCancel",
            TimeInForce::ImmediateOrCancel => "ImmediateOrCancel",
            TimeInForce::FillOrKill => "FillOrKill",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlacementOptions {
    pub post_only: bool,
    pub reduce_only: bool,
    pub time_in_force: Option<TimeInForce>,
    pub cl_ord_id: String,
    pub stop_limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct PreparedPlacement {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub options: PlacementOptions,
}

/// The `POST /order` body.
#[derive(Debug, Clone, Serialize)]
pub struct OrderWireRequest {
    pub symbol: String,
    pub side: &'static str,
    #[serde(rename = "orderQty")]
    pub order_qty: Decimal,
    #[serde(rename = "ordType")]
    pub ord_type: &'static str,
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(rename = "stopPx", skip_serializing_if = "Option::is_none")]
    pub stop_px: Option<Decimal>,
    #[serde(rename = "execInst", skip_serializing_if = "Option::is_none")]
    pub exec_inst: Option<String>,
    #[serde(rename = "timeInForce", skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<&'static str>,
}

impl PreparedPlacement {
    /// Re-checks the invariants a validated input is supposed to already
    /// satisfy:
    /// `postOnly` implies Limit; Stop requires `stopPrice`; StopLimit
    /// requires both `stopPrice` and `options.stopLimitPrice`.
    pub fn validate(&self) -> Result<()> {
        if self.size <= Decimal::ZERO {
            return Err(Error::validation("size must be positive"));
        }
        if self.options.cl_ord_id.is_empty() {
            return Err(Error::validation("clOrdId is required"));
        }
        if self.options.post_only && self.order_type != OrderType::Limit {
            return Err(Error::validation("postOnly is only valid for Limit orders"));
        }
        match self.order_type {
            OrderType::Limit => {
                if self.price.is_none() {
                    return Err(Error::validation("Limit orders require a price"));
                }
            }
            OrderType::Stop => {
                if self.stop_price.is_none() {
                    return Err(Error::validation("Stop orders require a stopPrice"));
                }
            }
            OrderType::StopLimit => {
                if self.stop_price.is_none() || self.options.stop_limit_price.is_none() {
                    return Err(Error::validation(
                        "StopLimit orders require both stopPrice and stopLimitPrice",
                    ));
                }
            }
            OrderType::Market => {}
        }
        Ok(())
    }

    /// Maps to the wire payload.
    pub fn to_wire(&self) -> Result<OrderWireRequest> {
        self.validate()?;

        let mut exec_inst_flags = Vec::new();
        if self.options.post_only {
            exec_inst_flags.push("ParticipateDoNotInitiate");
        }
        if self.options.reduce_only {
            exec_inst_flags.push("ReduceOnly");
        }
        let exec_inst = if exec_inst_flags.is_empty() {
            None
        } else {
            Some(exec_inst_flags.join(","))
        };

        let price = match self.order_type {
            OrderType::StopLimit => self.options.stop_limit_price,
            _ => self.price,
        };

        Ok(OrderWireRequest {
            symbol: self.symbol.clone(),
            side: match self.side {
                Side::Buy => "Buy",
                Side::Sell => "Sell",
            },
            order_qty: self.size,
            ord_type: match self.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
                OrderType::Stop => "Stop",
                OrderType::StopLimit => "StopLimit",
            },
            cl_ord_id: self.options.cl_ord_id.clone(),
            price,
            stop_px: self.stop_price,
            exec_inst,
            time_in_force: self.options.time_in_force.map(TimeInForce::wire),
        })
    }
}

/// Infers an order type from side, an optional limit price, and the
/// current best quotes. Used by the preparation layer that
/// builds a `PreparedPlacement`; the placement pipeline itself never calls
/// this, it only consumes the already-decided `order_type`.
pub fn infer_order_type(
    side: Side,
    price: Option<Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    stop_limit: bool,
) -> OrderType {
    if stop_limit {
        return OrderType::StopLimit;
    }
    let Some(price) = price else {
        return OrderType::Market;
    };
    match side {
        Side::Buy => match best_ask {
            Some(ask) if price >= ask => OrderType::Stop,
            _ => OrderType::Limit,
        },
        Side::Sell => match best_bid {
            Some(bid) if price <= bid => OrderType::Stop,
            _ => OrderType::Limit,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base(order_type: OrderType) -> PreparedPlacement {
        PreparedPlacement {
            symbol: "XBTUSD".into(),
            side: Side::Buy,
            size: dec!(100),
            order_type,
            price: None,
            stop_price: None,
            options: PlacementOptions {
                cl_ord_id: "cl-1".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn limit_without_price_is_rejected() {
        let placement = base(OrderType::Limit);
        assert!(placement.validate().is_err());
    }

    #[test]
    fn post_only_on_market_is_rejected() {
        let mut placement = base(OrderType::Market);
        placement.options.post_only = true;
        assert!(placement.validate().is_err());
    }

    #[test]
    fn stop_limit_requires_both_prices() {
        let mut placement = base(OrderType::StopLimit);
        placement.stop_price = Some(dec!(100));
        assert!(placement.validate().is_err());
        placement.options.stop_limit_price = Some(dec!(99));
        assert!(placement.validate().is_ok());
    }

    #[test]
    fn exec_inst_joins_post_only_and_reduce_only() {
        let mut placement = base(OrderType::Limit);
        placement.price = Some(dec!(50000));
        placement.options.post_only = true;
        placement.options.reduce_only = true;
        let wire = placement.to_wire().unwrap();
        assert_eq!(wire.exec_inst.as_deref(), Some("ParticipateDoNotInitiate,ReduceOnly"));
    }

    #[test]
    fn stop_limit_wire_price_uses_stop_limit_price() {
        let mut placement = base(OrderType::StopLimit);
        placement.stop_price = Some(dec!(100));
        placement.options.stop_limit_price = Some(dec!(99));
        let wire = placement.to_wire().unwrap();
        assert_eq!(wire.price, Some(dec!(99)));
        assert_eq!(wire.stop_px, Some(dec!(100)));
    }

    #[test]
    fn infers_market_when_no_price_given() {
        assert_eq!(infer_order_type(Side::Buy, None, None, None, false), OrderType::Market);
    }

    #[test]
    fn infers_stop_for_buy_at_or_above_best_ask() {
        let kind = infer_order_type(Side::Buy, Some(dec!(101)), None, Some(dec!(100)), false);
        assert_eq!(kind, OrderType::Stop);
    }

    #[test]
    fn infers_limit_for_sell_above_best_bid() {
        let kind = infer_order_type(Side::Sell, Some(dec!(101)), Some(dec!(100)), None, false);
        assert_eq!(kind, OrderType::Limit);
    }

    #[test]
    fn stop_limit_flag_wins_over_price_comparison() {
        let kind = infer_order_type(Side::Buy, Some(dec!(50)), None, Some(dec!(100)), true);
        assert_eq!(kind, OrderType::StopLimit);
    }
}
