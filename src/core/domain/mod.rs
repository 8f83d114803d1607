//! Domain state: instruments, order books, trades, wallets, positions and
//! orders.

pub mod instrument;
pub mod order;
pub mod order_book;
pub mod placement;
pub mod position;
pub mod trade;
pub mod wallet;

pub use instrument::{Instrument, InstrumentRegistry};
pub use order::{
    Execution, OrderHandle, OrderRecord, OrderRegistry, OrderSnapshot, OrderStatus, OrderUpdateRow,
};
pub use order_book::{OrderBook, Quote, Side};
pub use placement::{infer_order_type, OrderType, PlacementOptions, PreparedPlacement, TimeInForce};
pub use position::{PositionDiff, PositionRegistry, PositionSide, PositionSnapshot, RawPositionRow};
pub use trade::{RawTrade, Trade, TradeTape};
pub use wallet::{Balance, RawBalanceRow, UpdateReason, Wallet, WalletDiff};
