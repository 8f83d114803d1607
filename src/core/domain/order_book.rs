//! Incremental L2 order book.

use std::collections::BTreeMap;
use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy)]
struct Row {
    side: Side,
    price: Decimal,
    size: Decimal,
}

/// A price level's aggregated size: `(price, total size of all rows at
/// that price)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub price: Decimal,
    pub size: Decimal,
}

/// Count of distinct price levels whose aggregated size changed, split by
/// side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changed {
    pub bids: usize,
    pub asks: usize,
}

/// An L2 insert/update/delete row as carried on the wire.
#[derive(Debug, Clone)]
pub struct InsertRow {
    pub id: u64,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone)]
pub struct UpdateRow {
    pub id: u64,
    pub price: Option<Decimal>,
    pub size: Option<Decimal>,
}

/// Per-instrument L2 mirror. Rows never carry zero or negative size
/// (invariant i); best-bid price < best-ask price whenever both exist and
/// the book is in sync (invariant ii, enforced as a post-condition never a
/// runtime assert); `out_of_sync` is sticky until the next `reset`
/// (invariant iii).
#[derive(Debug, Default)]
pub struct OrderBook {
    rows: HashMap<u64, Row>,
    out_of_sync: bool,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    /// Clears all rows, inserts the snapshot rows, and clears
    /// `out_of_sync`.
    pub fn reset(&mut self, rows: Vec<InsertRow>) {
        self.rows.clear();
        self.out_of_sync = false;
        for row in rows {
            if row.size > Decimal::ZERO {
                self.rows.insert(
                    row.id,
                    Row {
                        side: row.side,
                        price: row.price,
                        size: row.size,
                    },
                );
            }
        }
    }

    /// Inserts new rows. A row whose id already exists marks `out_of_sync`
    /// and is skipped.
    pub fn apply_insert(&mut self, rows: Vec<InsertRow>) -> Changed {
        let mut touched: Vec<(Side, Decimal)> = Vec::new();
        for row in rows {
            if self.rows.contains_key(&row.id) {
                self.out_of_sync = true;
                continue;
            }
            if row.size <= Decimal::ZERO {
                continue;
            }
            touched.push((row.side, row.price));
            self.rows.insert(
                row.id,
                Row {
                    side: row.side,
                    price: row.price,
                    size: row.size,
                },
            );
        }
        self.changed_levels(&touched)
    }

    /// Overlays `price`/`size` fields onto existing rows. A row whose id
    /// is unknown marks `out_of_sync` and is skipped.
    pub fn apply_update(&mut self, updates: Vec<UpdateRow>) -> Changed {
        let mut touched: Vec<(Side, Decimal)> = Vec::new();
        for update in updates {
            let Some(row) = self.rows.get_mut(&update.id) else {
                self.out_of_sync = true;
                continue;
            };
            touched.push((row.side, row.price));
            if let Some(price) = update.price {
                row.price = price;
            }
            if let Some(size) = update.size {
                row.size = size;
            }
            touched.push((row.side, row.price));
            if row.size <= Decimal::ZERO {
                let side = row.side;
                let price = row.price;
                self.rows.remove(&update.id);
                touched.push((side, price));
            }
        }
        self.changed_levels(&touched)
    }

    /// Removes rows by id. Any missing id marks `out_of_sync` for that id;
    /// the remaining known ids are still removed.
    pub fn apply_delete(&mut self, ids: Vec<u64>) -> Changed {
        let mut touched: Vec<(Side, Decimal)> = Vec::new();
        for id in ids {
            match self.rows.remove(&id) {
                Some(row) => touched.push((row.side, row.price)),
                None => self.out_of_sync = true,
            }
        }
        self.changed_levels(&touched)
    }

    fn changed_levels(&self, touched: &[(Side, Decimal)]) -> Changed {
        let mut bids = std::collections::HashSet::new();
        let mut asks = std::collections::HashSet::new();
        for (side, price) in touched {
            match side {
                Side::Buy => {
                    bids.insert(*price);
                }
                Side::Sell => {
                    asks.insert(*price);
                }
            }
        }
        Changed {
            bids: bids.len(),
            asks: asks.len(),
        }
    }

    fn levels(&self, side: Side) -> BTreeMap<Decimal, Decimal> {
        let mut levels = BTreeMap::new();
        for row in self.rows.values() {
            if row.side == side {
                *levels.entry(row.price).or_insert(Decimal::ZERO) += row.size;
            }
        }
        levels
    }

    /// Best bid: `(max price, aggregated size)` among buy rows.
    pub fn best_bid(&self) -> Option<Quote> {
        self.levels(Side::Buy)
            .into_iter()
            .next_back()
            .map(|(price, size)| Quote { price, size })
    }

    /// Best ask: `(min price, aggregated size)` among sell rows.
    pub fn best_ask(&self) -> Option<Quote> {
        self.levels(Side::Sell)
            .into_iter()
            .next()
            .map(|(price, size)| Quote { price, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(id: u64, side: Side, price: Decimal, size: Decimal) -> InsertRow {
        InsertRow { id, side, price, size }
    }

    #[test]
    fn best_quotes_reflect_lowest_ask_and_highest_bid_after_reset() {
        let mut book = OrderBook::new();
        book.reset(vec![
            row(1, Side::Buy, dec!(100), dec!(2)),
            row(2, Side::Buy, dec!(101), dec!(4)),
            row(3, Side::Buy, dec!(101), dec!(3)),
            row(4, Side::Sell, dec!(103), dec!(5)),
            row(5, Side::Sell, dec!(102), dec!(1)),
        ]);
        assert_eq!(
            book.best_bid(),
            Some(Quote {
                price: dec!(101),
                size: dec!(7)
            })
        );
        assert_eq!(
            book.best_ask(),
            Some(Quote {
                price: dec!(102),
                size: dec!(1)
            })
        );
        assert!(!book.is_out_of_sync());
    }

    #[test]
    fn insert_colliding_id_sets_out_of_sync_and_is_skipped() {
        let mut book = OrderBook::new();
        book.reset(vec![row(1, Side::Buy, dec!(100), dec!(1))]);
        book.apply_insert(vec![row(1, Side::Buy, dec!(99), dec!(1))]);
        assert!(book.is_out_of_sync());
        assert_eq!(book.best_bid().unwrap().price, dec!(100));
    }

    #[test]
    fn update_unknown_id_sets_out_of_sync() {
        let mut book = OrderBook::new();
        book.apply_update(vec![UpdateRow {
            id: 42,
            price: Some(dec!(1)),
            size: Some(dec!(1)),
        }]);
        assert!(book.is_out_of_sync());
    }

    #[test]
    fn delete_unknown_id_sets_out_of_sync_others_still_removed() {
        let mut book = OrderBook::new();
        book.reset(vec![row(1, Side::Buy, dec!(100), dec!(1))]);
        book.apply_delete(vec![1, 999]);
        assert!(book.is_out_of_sync());
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn out_of_sync_is_sticky_until_reset() {
        let mut book = OrderBook::new();
        book.reset(vec![row(1, Side::Buy, dec!(100), dec!(1))]);
        book.apply_delete(vec![999]);
        assert!(book.is_out_of_sync());
        book.apply_insert(vec![row(2, Side::Sell, dec!(101), dec!(1))]);
        assert!(book.is_out_of_sync(), "only reset clears the flag");
        book.reset(vec![]);
        assert!(!book.is_out_of_sync());
    }

    #[test]
    fn update_driving_size_to_zero_removes_the_row() {
        let mut book = OrderBook::new();
        book.reset(vec![row(1, Side::Buy, dec!(100), dec!(1))]);
        book.apply_update(vec![UpdateRow {
            id: 1,
            price: None,
            size: Some(dec!(0)),
        }]);
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn best_bid_always_below_best_ask_after_mixed_ops() {
        let mut book = OrderBook::new();
        book.reset(vec![
            row(1, Side::Buy, dec!(10), dec!(1)),
            row(2, Side::Sell, dec!(11), dec!(1)),
        ]);
        book.apply_insert(vec![row(3, Side::Buy, dec!(10.5), dec!(2))]);
        book.apply_update(vec![UpdateRow {
            id: 2,
            price: Some(dec!(10.8)),
            size: None,
        }]);
        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            assert!(bid.price < ask.price);
        }
    }
}
