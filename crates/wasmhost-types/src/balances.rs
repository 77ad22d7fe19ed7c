//! Color balances and their blob format.
//!
//! Blob: `uvarint count` then `count` entries of `color(32) uvarint amount`,
//! ascending by color. Zero amounts are never stored.

use std::collections::BTreeMap;

use crate::codec::{BytesDecoder, BytesEncoder, CodecError};
use crate::ids::ScColor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balances {
    amounts: BTreeMap<ScColor, u64>,
}

impl Balances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, color: ScColor, amount: u64) -> Self {
        self.add(color, amount);
        self
    }

    pub fn add(&mut self, color: ScColor, amount: u64) {
        if amount == 0 {
            return;
        }
        let slot = self.amounts.entry(color).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    /// Remove `amount` of `color`; fails without change when short.
    pub fn sub(&mut self, color: ScColor, amount: u64) -> bool {
        let current = self.balance(&color);
        if current < amount {
            return false;
        }
        if current == amount {
            self.amounts.remove(&color);
        } else {
            self.amounts.insert(color, current - amount);
        }
        true
    }

    pub fn balance(&self, color: &ScColor) -> u64 {
        self.amounts.get(color).copied().unwrap_or(0)
    }

    pub fn colors(&self) -> impl Iterator<Item = &ScColor> {
        self.amounts.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ScColor, &u64)> {
        self.amounts.iter()
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    /// True when no color carries a positive amount.
    pub fn is_empty(&self) -> bool {
        self.amounts.values().all(|amount| *amount == 0)
    }

    pub fn total(&self) -> u64 {
        self.amounts
            .values()
            .fold(0u64, |acc, amount| acc.saturating_add(*amount))
    }

    /// Whether `self` holds at least `other` of every color.
    pub fn covers(&self, other: &Balances) -> bool {
        other
            .iter()
            .all(|(color, amount)| self.balance(color) >= *amount)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = BytesEncoder::new();
        enc.write_uvarint(self.amounts.len() as u64);
        for (color, amount) in &self.amounts {
            enc.write_fixed(color.as_bytes()).write_uvarint(*amount);
        }
        enc.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = BytesDecoder::new(bytes);
        let balances = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(balances)
    }

    /// Decode a balances blob embedded in a larger buffer.
    pub fn decode(dec: &mut BytesDecoder<'_>) -> Result<Self, CodecError> {
        let count = dec.read_uvarint()?;
        let mut balances = Balances::new();
        for _ in 0..count {
            let color = dec.read_color()?;
            let amount = dec.read_uvarint()?;
            balances.add(color, amount);
        }
        Ok(balances)
    }
}

impl FromIterator<(ScColor, u64)> for Balances {
    fn from_iter<T: IntoIterator<Item = (ScColor, u64)>>(iter: T) -> Self {
        let mut balances = Balances::new();
        for (color, amount) in iter {
            balances.add(color, amount);
        }
        balances
    }
}
