//! Non-negative stock quantities.
//!
//! All quantity arithmetic is total-checked: addition detects overflow and
//! subtraction returns an explicit failure signal instead of going negative.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when a quantity operation cannot be represented.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityError {
    /// Addition overflowed the representation.
    #[error("Quantity overflow")]
    Overflow,

    /// Subtraction would have produced a negative quantity.
    #[error("Quantity underflow: {have} - {take}")]
    Underflow {
        /// The quantity subtracted from.
        have: u64,
        /// The amount that was requested.
        take: u64,
    },
}

/// A non-negative count of stock units.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(u64);

impl Quantity {
    /// The zero quantity.
    pub const ZERO: Self = Self(0);

    /// Construct from a raw count.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw count.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Add, detecting overflow.
    ///
    /// # Errors
    ///
    /// Returns [`QuantityError::Overflow`] if the sum does not fit.
    pub const fn checked_add(self, other: Self) -> Result<Self, QuantityError> {
        match self.0.checked_add(other.0) {
            Some(sum) => Ok(Self(sum)),
            None => Err(QuantityError::Overflow),
        }
    }

    /// Subtract, signalling instead of going negative.
    ///
    /// # Errors
    ///
    /// Returns [`QuantityError::Underflow`] when `other` exceeds `self`.
    pub const fn checked_sub(self, other: Self) -> Result<Self, QuantityError> {
        match self.0.checked_sub(other.0) {
            Some(diff) => Ok(Self(diff)),
            None => Err(QuantityError::Underflow {
                have: self.0,
                take: other.0,
            }),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Quantity {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}
