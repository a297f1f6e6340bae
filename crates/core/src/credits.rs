//! Credit amounts.

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// A credit amount in minor units (hundredths of a credit).
///
/// Stored as a signed integer to keep arithmetic exact; `2.50` credits is
/// `Credits::from_minor(250)`. Negative values are representable so that
/// signed sums stay closed under subtraction, but every public ledger
/// operation validates sign before accepting an amount.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Credits(i64);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    /// From minor units (hundredths), e.g. `from_minor(250)` == 2.50 credits.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// From whole credits, e.g. `from_whole(10)` == 10.00 credits.
    pub const fn from_whole(whole: i64) -> Self {
        Self(whole * 100)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }
}

impl ValueObject for Credits {}

impl core::fmt::Display for Credits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}
