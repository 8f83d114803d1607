//! Integration tests for the hub's public surface, exercised without a live
//! connection: construction, buffered sends while idle, and the
//! placement pipeline's local validation path.

use mexrt::app::HubSettings;
use mexrt::core::domain::order_book::Side;
use mexrt::core::domain::{OrderType, PlacementOptions, PreparedPlacement};
use mexrt::core::hub::Hub;
use rust_decimal_macros::dec;

fn settings() -> HubSettings {
    HubSettings::default()
}

#[tokio::test]
async fn fresh_hub_has_no_domain_state() {
    let hub = Hub::new(settings());
    assert_eq!(hub.env(), "testnet");
    assert!(hub.wallet(12345).is_none());
    assert!(hub.position(12345, "XBTUSD").is_none());
    assert!(hub.order_by_cl_ord_id("cl-1").is_none());
    assert!(hub.resolve_instrument("XBTUSD").is_none());
}

#[tokio::test]
async fn subscribe_and_resubscribe_buffer_while_disconnected() {
    let hub = Hub::new(settings());
    assert!(hub.subscribe("orderBookL2", Some("XBTUSD")).is_ok());
    assert!(hub.subscribe("trade", Some("XBTUSD")).is_ok());
    assert!(hub.resubscribe_order_book("XBTUSD").is_ok());
}

#[tokio::test]
async fn place_order_rejects_invalid_input_without_touching_the_network() {
    let mut hub = Hub::new(settings());
    let placement = PreparedPlacement {
        symbol: "XBTUSD".into(),
        side: Side::Buy,
        size: dec!(100),
        order_type: OrderType::Limit,
        price: None, // Limit requires a price; validate() must reject this.
        stop_price: None,
        options: PlacementOptions {
            cl_ord_id: "cl-1".into(),
            ..Default::default()
        },
    };

    let result = hub.place_order(&placement).await;
    assert!(result.is_err());
    assert!(hub.order_by_cl_ord_id("cl-1").is_none());
}

#[tokio::test]
async fn metrics_start_empty_for_a_fresh_hub() {
    let hub = Hub::new(settings());
    let labels = vec![("exchange", "testnet".to_string()), ("symbol", "XBTUSD".to_string())];
    assert_eq!(hub.metrics().counter("create_order_latency_ms", &labels), 0);
}
