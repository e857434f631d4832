// Monetary amounts. 1 unit == 1e-7 BOS; arithmetic is fallible and refuses
// to wrap or go below zero. The JSON form is a decimal string so values
// survive JavaScript number precision.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::Error;

/// Default transaction fee; a transaction with a lower fee fails validation.
pub const BASE_FEE: Amount = Amount(10_000);

/// Minimum balance for a new account, `0.1` BOS.
pub const BASE_RESERVE: Amount = Amount(1_000_000);

/// One BOS.
pub const ONE_COIN: Amount = Amount(10_000_000);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn add(self, other: Amount) -> Result<Amount, Error> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }

    pub fn sub(self, other: Amount) -> Result<Amount, Error> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(Error::AmountUnderflow)
    }

    pub fn mult(self, times: usize) -> Result<Amount, Error> {
        self.0
            .checked_mul(times as u64)
            .map(Amount)
            .ok_or(Error::AmountOverflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Amount {
    fn from(v: u64) -> Self {
        Amount(v)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>()
            .map(Amount)
            .map_err(|_| serde::de::Error::custom("amount must be a decimal string"))
    }
}
