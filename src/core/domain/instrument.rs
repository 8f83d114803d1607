//! Instrument registry: native/unified symbol aliasing over a shared L2
//! book and trade tape.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::order_book::OrderBook;
use super::trade::TradeTape;

/// One instrument per native symbol; the order book and trade tape are
/// shared so every alias resolves to the same underlying state.
pub struct Instrument {
    pub native_symbol: String,
    pub unified_symbol: String,
    pub book: Arc<Mutex<OrderBook>>,
    pub trades: Arc<Mutex<TradeTape>>,
}

impl Instrument {
    fn new(native_symbol: String, unified_symbol: String, trade_capacity: usize) -> Self {
        Self {
            native_symbol,
            unified_symbol,
            book: Arc::new(Mutex::new(OrderBook::new())),
            trades: Arc::new(Mutex::new(TradeTape::new(trade_capacity))),
        }
    }
}

/// Maps native symbol, unified symbol, and case-insensitive aliases to a
/// single [`Instrument`] instance.
#[derive(Default)]
pub struct InstrumentRegistry {
    by_native: HashMap<String, Arc<Instrument>>,
    alias_to_native: HashMap<String, String>,
    trade_capacity: usize,
}

impl InstrumentRegistry {
    pub fn new(trade_capacity: usize) -> Self {
        Self {
            by_native: HashMap::new(),
            alias_to_native: HashMap::new(),
            trade_capacity,
        }
    }

    /// Returns the instrument for `native_symbol`, creating it (and
    /// registering `unified_symbol` plus upper/lower-case aliases) on
    /// first reference.
    pub fn get_or_create(&mut self, native_symbol: &str, unified_symbol: &str) -> Arc<Instrument> {
        if let Some(existing) = self.by_native.get(native_symbol) {
            return existing.clone();
        }
        let instrument = Arc::new(Instrument::new(
            native_symbol.to_string(),
            unified_symbol.to_string(),
            self.trade_capacity,
        ));
        for alias in [
            native_symbol.to_string(),
            native_symbol.to_ascii_uppercase(),
            native_symbol.to_ascii_lowercase(),
            unified_symbol.to_string(),
            unified_symbol.to_ascii_uppercase(),
            unified_symbol.to_ascii_lowercase(),
        ] {
            self.alias_to_native.insert(alias, native_symbol.to_string());
        }
        self.by_native.insert(native_symbol.to_string(), instrument.clone());
        instrument
    }

    /// Resolves any alias (native, unified, upper/lower case) to the
    /// shared instrument, without creating one.
    pub fn resolve(&self, alias: &str) -> Option<Arc<Instrument>> {
        let native = self.alias_to_native.get(alias)?;
        self.by_native.get(native).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_the_same_instance() {
        let mut registry = InstrumentRegistry::new(100);
        let created = registry.get_or_create("XBTUSD", "BTC-USD");
        let by_lower = registry.resolve("xbtusd").unwrap();
        let by_unified = registry.resolve("BTC-USD").unwrap();
        assert!(Arc::ptr_eq(&created, &by_lower));
        assert!(Arc::ptr_eq(&created, &by_unified));
    }

    #[test]
    fn get_or_create_is_idempotent_per_native_symbol() {
        let mut registry = InstrumentRegistry::new(100);
        let a = registry.get_or_create("XBTUSD", "BTC-USD");
        let b = registry.get_or_create("XBTUSD", "BTC-USD");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unresolved_alias_returns_none() {
        let registry = InstrumentRegistry::new(100);
        assert!(registry.resolve("ETHUSD").is_none());
    }
}
