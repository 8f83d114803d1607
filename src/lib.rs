//! mexrt - client-side realtime integration runtime for a BitMEX-style
//! derivatives venue.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── core/             # Reusable library components
//! │   ├── domain/       # Instrument, order book, trade, wallet, position, order
//! │   ├── transport/    # Authenticated reconnecting WebSocket
//! │   ├── rest/         # Signed REST client
//! │   ├── channel/      # Channel multiplexer (partial/insert/update/delete)
//! │   ├── placement/    # Prepared-placement -> signed request -> Order
//! │   └── hub/          # Cross-component registry + event routing
//! ├── metrics/          # Counters/histograms facade
//! ├── time.rs           # Timestamp parsing, monotonic compare, ids, stable hash
//! ├── error.rs          # Classified error taxonomy
//! └── app/              # Configuration
//! ```
//!
//! The hub is the single entry point: it owns the transport and REST client,
//! demultiplexes inbound frames to per-channel handlers, and exposes the
//! placement pipeline callers use to submit orders. All engine state is
//! mutated from a single cooperative task; see [`core::hub`] for details.

pub mod app;
pub mod core;
pub mod error;
pub mod metrics;
pub mod time;

pub use error::{Error, Result};
