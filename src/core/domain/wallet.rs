//! Per-account multi-currency balance mirror with diff events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;

use crate::time::stable_hash;

/// Normalizes an exchange-specific currency code (e.g. the satoshi-unit
/// code `XBt`) to its canonical form.
pub fn normalize_currency(code: &str) -> String {
    match code {
        "XBt" => "XBT".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub currency: String,
    pub amount: Decimal,
    pub pending_credit: Decimal,
    pub pending_debit: Decimal,
    pub confirmed_debit: Decimal,
    pub transfer_in: Decimal,
    pub transfer_out: Decimal,
    pub deposited: Decimal,
    pub withdrawn: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A raw wire row; `None` fields are left unset on insert/update overlays.
#[derive(Debug, Clone)]
pub struct RawBalanceRow {
    pub account: u64,
    pub currency: String,
    pub amount: Option<Decimal>,
    pub pending_credit: Option<Decimal>,
    pub pending_debit: Option<Decimal>,
    pub confirmed_debit: Option<Decimal>,
    pub transfer_in: Option<Decimal>,
    pub transfer_out: Option<Decimal>,
    pub deposited: Option<Decimal>,
    pub withdrawn: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

fn field_or_zero(value: Option<Decimal>) -> Decimal {
    value.unwrap_or(Decimal::ZERO)
}

fn balance_to_json(b: &Balance) -> serde_json::Value {
    json!({
        "currency": b.currency,
        "amount": b.amount.to_string(),
        "pendingCredit": b.pending_credit.to_string(),
        "pendingDebit": b.pending_debit.to_string(),
        "confirmedDebit": b.confirmed_debit.to_string(),
        "transferIn": b.transfer_in.to_string(),
        "transferOut": b.transfer_out.to_string(),
        "deposited": b.deposited.to_string(),
        "withdrawn": b.withdrawn.to_string(),
        "timestamp": b.timestamp.to_rfc3339(),
    })
}

#[derive(Debug)]
pub struct Wallet {
    account: u64,
    balances: HashMap<String, Balance>,
    awaiting_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    /// Full per-account snapshot from a `partial` message.
    Resync,
    /// Incremental field overlay from insert/update/delete.
    Update,
}

impl UpdateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateReason::Resync => "ws:partial",
            UpdateReason::Update => "ws:update",
        }
    }
}

/// One changed-field diff entry for a caller-facing `update(snapshot,
/// diff, reason)` event.
#[derive(Debug, Clone)]
pub struct WalletDiff {
    pub changed_currencies: Vec<String>,
    pub reason: UpdateReason,
}

impl Wallet {
    pub fn new(account: u64) -> Self {
        Self {
            account,
            balances: HashMap::new(),
            awaiting_partial: true,
        }
    }

    pub fn account(&self) -> u64 {
        self.account
    }

    pub fn balances(&self) -> &HashMap<String, Balance> {
        &self.balances
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.balances.values().map(|b| b.timestamp).max()
    }

    /// Marks the wallet as awaiting a fresh `partial`.
    pub fn mark_awaiting_partial(&mut self) {
        self.awaiting_partial = true;
    }

    pub fn is_awaiting_partial(&self) -> bool {
        self.awaiting_partial
    }

    /// Applies a `partial` snapshot: establishes the full per-account
    /// balance set, evicting currencies not present in `rows`. Always
    /// emits a diff.
    pub fn apply_partial(&mut self, rows: Vec<RawBalanceRow>) -> WalletDiff {
        self.awaiting_partial = false;
        let folded = fold_latest_per_currency(rows);
        let mut next = HashMap::new();
        let mut changed = Vec::new();
        for (currency, row) in folded {
            let balance = row_to_balance(&currency, &row);
            changed.push(currency.clone());
            next.insert(currency, balance);
        }
        self.balances = next;
        WalletDiff {
            changed_currencies: changed,
            reason: UpdateReason::Resync,
        }
    }

    /// Applies insert/update/delete rows: field-wise overlay, only when
    /// the incoming per-currency timestamp is not older than the stored
    /// one. Multiple rows for the same currency within the batch are
    /// folded to the newest by timestamp first.
    pub fn apply_incremental(&mut self, rows: Vec<RawBalanceRow>) -> Option<WalletDiff> {
        if self.awaiting_partial {
            return None;
        }
        let folded = fold_latest_per_currency(rows);
        let mut changed = Vec::new();
        for (currency, row) in folded {
            if let Some(existing) = self.balances.get(&currency) {
                if row.timestamp < existing.timestamp {
                    continue;
                }
                let before = balance_to_json(existing);
                let merged = merge_balance(existing, &row);
                let after = balance_to_json(&merged);
                if stable_hash(&before) == stable_hash(&after) {
                    self.balances.insert(currency, merged);
                    continue;
                }
                self.balances.insert(currency.clone(), merged);
                changed.push(currency);
            } else {
                let balance = row_to_balance(&currency, &row);
                changed.push(currency.clone());
                self.balances.insert(currency, balance);
            }
        }
        if changed.is_empty() {
            None
        } else {
            Some(WalletDiff {
                changed_currencies: changed,
                reason: UpdateReason::Update,
            })
        }
    }
}

fn fold_latest_per_currency(rows: Vec<RawBalanceRow>) -> HashMap<String, RawBalanceRow> {
    let mut latest: HashMap<String, RawBalanceRow> = HashMap::new();
    for row in rows {
        let currency = normalize_currency(&row.currency);
        match latest.get(&currency) {
            Some(existing) if existing.timestamp > row.timestamp => {}
            _ => {
                let mut row = row;
                row.currency = currency.clone();
                latest.insert(currency, row);
            }
        }
    }
    latest
}

fn row_to_balance(currency: &str, row: &RawBalanceRow) -> Balance {
    Balance {
        currency: currency.to_string(),
        amount: field_or_zero(row.amount),
        pending_credit: field_or_zero(row.pending_credit),
        pending_debit: field_or_zero(row.pending_debit),
        confirmed_debit: field_or_zero(row.confirmed_debit),
        transfer_in: field_or_zero(row.transfer_in),
        transfer_out: field_or_zero(row.transfer_out),
        deposited: field_or_zero(row.deposited),
        withdrawn: field_or_zero(row.withdrawn),
        timestamp: row.timestamp,
    }
}

fn merge_balance(existing: &Balance, row: &RawBalanceRow) -> Balance {
    Balance {
        currency: existing.currency.clone(),
        amount: row.amount.unwrap_or(existing.amount),
        pending_credit: row.pending_credit.unwrap_or(existing.pending_credit),
        pending_debit: row.pending_debit.unwrap_or(existing.pending_debit),
        confirmed_debit: row.confirmed_debit.unwrap_or(existing.confirmed_debit),
        transfer_in: row.transfer_in.unwrap_or(existing.transfer_in),
        transfer_out: row.transfer_out.unwrap_or(existing.transfer_out),
        deposited: row.deposited.unwrap_or(existing.deposited),
        withdrawn: row.withdrawn.unwrap_or(existing.withdrawn),
        timestamp: row.timestamp,
    }
}
