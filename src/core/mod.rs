//! Core library components: the domain mirror, transport, REST client,
//! channel multiplexer, placement pipeline, and the hub that wires them
//! together.

pub mod channel;
pub mod domain;
pub mod hub;
pub mod placement;
pub mod rest;
pub mod transport;
