//! Ledger entries produced by venue `parse` implementations.
//!
//! One [`LedgerEntry`] per parsed envelope, rendered as a beancount
//! transaction for the downstream ledger.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::envelope::Envelope;
use crate::error::UnparseableEnvelope;

/// Counter-account for value moving in or out of a venue.
pub const TRANSFER_ACCOUNT: &str = "Equity:Transfers";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub account: String,
    pub amount: Decimal,
    pub currency: String,
    /// Per-unit price annotation (`@ price CUR`).
    pub price: Option<(Decimal, String)>,
}

impl Posting {
    pub fn new(account: impl Into<String>, amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            amount,
            currency: currency.into(),
            price: None,
        }
    }

    pub fn at_price(mut self, price: Decimal, currency: impl Into<String>) -> Self {
        self.price = Some((price, currency.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub narration: String,
    pub venue: &'static str,
    pub kind: &'static str,
    pub postings: Vec<Posting>,
    pub meta: BTreeMap<String, String>,
}

impl LedgerEntry {
    pub fn new(envelope: &Envelope, narration: impl Into<String>) -> Self {
        Self {
            date: envelope.timestamp().date_naive(),
            narration: narration.into(),
            venue: envelope.venue(),
            kind: envelope.kind().as_str(),
            postings: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn post(mut self, posting: Posting) -> Self {
        self.postings.push(posting);
        self
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} * \"{}\"",
            self.date.format("%Y-%m-%d"),
            self.narration.replace('"', "'")
        )?;
        writeln!(f, "  venue: \"{}\"", self.venue)?;
        writeln!(f, "  kind: \"{}\"", self.kind)?;
        for (key, value) in &self.meta {
            writeln!(f, "  {}: \"{}\"", key, value.replace('"', "'"))?;
        }
        for p in &self.postings {
            write!(f, "  {}  {} {}", p.account, p.amount.normalize(), p.currency)?;
            if let Some((price, currency)) = &p.price {
                write!(f, " @ {} {}", price.normalize(), currency)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// =============================================================================
// RAW FIELD ACCESS
// =============================================================================

/// Typed access to an envelope's raw payload for `parse` implementations.
///
/// Paths are dot-separated (`"amount.currency"`). Every failure becomes an
/// [`UnparseableEnvelope`] naming the missing or malformed field.
pub struct RawFields<'a> {
    envelope: &'a Envelope,
}

impl<'a> RawFields<'a> {
    pub fn new(envelope: &'a Envelope) -> Self {
        Self { envelope }
    }

    pub fn unparseable(&self, reason: impl Into<String>) -> UnparseableEnvelope {
        UnparseableEnvelope {
            venue: self.envelope.venue().to_string(),
            kind: self.envelope.kind().as_str().to_string(),
            reason: reason.into(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&'a Value> {
        let mut current = self.envelope.raw();
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn str(&self, path: &str) -> Result<&'a str, UnparseableEnvelope> {
        match self.get(path) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(self.unparseable(format!("`{}` is not a string", path))),
            None => Err(self.unparseable(format!("missing `{}`", path))),
        }
    }

    pub fn opt_str(&self, path: &str) -> Option<&'a str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn decimal(&self, path: &str) -> Result<Decimal, UnparseableEnvelope> {
        let value = self
            .get(path)
            .ok_or_else(|| self.unparseable(format!("missing `{}`", path)))?;
        value_to_decimal(value)
            .ok_or_else(|| self.unparseable(format!("`{}` is not a decimal: {}", path, value)))
    }

    pub fn opt_decimal(&self, path: &str) -> Result<Option<Decimal>, UnparseableEnvelope> {
        match self.get(path) {
            None => Ok(None),
            Some(_) => self.decimal(path).map(Some),
        }
    }
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s.trim())
        .or_else(|_| Decimal::from_scientific(s.trim()))
        .ok()
}
