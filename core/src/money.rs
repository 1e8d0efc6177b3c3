//! Fixed-point monetary amounts.
//!
//! `Money` pairs an amount in minor units (two fractional digits) with an
//! ISO-4217 currency. Arithmetic is explicit and total: addition and
//! subtraction require identical currencies, multiplication accepts a
//! non-negative integer scalar, and division is only permitted by a positive
//! integer and rounds half-even. Nothing silently loses precision.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use thiserror::Error;

/// Errors from monetary construction and arithmetic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Two amounts with different currencies were combined.
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand.
        left: Currency,
        /// Currency of the right operand.
        right: Currency,
    },

    /// The operation overflowed the underlying minor-unit representation.
    #[error("Money arithmetic overflow")]
    Overflow,

    /// A negative amount was supplied where only non-negative is legal.
    #[error("Negative amount: {0} minor units")]
    NegativeAmount(i64),

    /// The currency code is not a valid ISO-4217 alpha-3 code.
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),
}

/// An ISO-4217 alpha-3 currency code (e.g. `USD`, `EUR`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    /// United States dollar.
    pub const USD: Self = Self(*b"USD");
    /// Euro.
    pub const EUR: Self = Self(*b"EUR");
    /// South Korean won (carried with two fractional digits like every
    /// other currency in this system).
    pub const KRW: Self = Self(*b"KRW");

    /// Parse an alpha-3 code. Accepts exactly three ASCII uppercase letters.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::InvalidCurrency`] for anything else.
    pub fn parse(code: &str) -> Result<Self, MoneyError> {
        let bytes = code.as_bytes();
        if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_uppercase) {
            Ok(Self([bytes[0], bytes[1], bytes[2]]))
        } else {
            Err(MoneyError::InvalidCurrency(code.to_string()))
        }
    }

    /// The code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Constructed only from validated ASCII uppercase bytes.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

/// A monetary amount: minor units (cents) plus currency.
///
/// Amounts may be negative in intermediate arithmetic (e.g. adjustments),
/// but order line prices are validated non-negative at the aggregate
/// boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in minor units (two fractional digits).
    #[serde(rename = "amount")]
    minor_units: i64,
    /// ISO-4217 currency code.
    currency: Currency,
}

impl Money {
    /// Construct from minor units (cents).
    #[must_use]
    pub const fn from_minor_units(minor_units: i64, currency: Currency) -> Self {
        Self {
            minor_units,
            currency,
        }
    }

    /// Construct from whole major units (e.g. dollars).
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the amount does not fit.
    pub fn from_major_units(major: i64, currency: Currency) -> Result<Self, MoneyError> {
        let minor = major.checked_mul(100).ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor_units(minor, currency))
    }

    /// A zero amount in the given currency.
    #[must_use]
    pub const fn zero(currency: Currency) -> Self {
        Self::from_minor_units(0, currency)
    }

    /// Amount in minor units.
    #[must_use]
    pub const fn minor_units(&self) -> i64 {
        self.minor_units
    }

    /// The currency.
    #[must_use]
    pub const fn currency(&self) -> Currency {
        self.currency
    }

    /// Whether the amount is negative.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.minor_units < 0
    }

    /// Add two amounts of the same currency.
    ///
    /// # Errors
    ///
    /// [`MoneyError::CurrencyMismatch`] if currencies differ,
    /// [`MoneyError::Overflow`] on overflow.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.require_same_currency(other)?;
        let minor = self
            .minor_units
            .checked_add(other.minor_units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor_units(minor, self.currency))
    }

    /// Subtract an amount of the same currency.
    ///
    /// # Errors
    ///
    /// [`MoneyError::CurrencyMismatch`] if currencies differ,
    /// [`MoneyError::Overflow`] on overflow.
    pub fn checked_sub(self, other: Self) -> Result<Self, MoneyError> {
        self.require_same_currency(other)?;
        let minor = self
            .minor_units
            .checked_sub(other.minor_units)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor_units(minor, self.currency))
    }

    /// Multiply by a non-negative integer scalar (e.g. a line quantity).
    ///
    /// # Errors
    ///
    /// [`MoneyError::Overflow`] on overflow.
    pub fn checked_mul(self, scalar: u32) -> Result<Self, MoneyError> {
        let minor = self
            .minor_units
            .checked_mul(i64::from(scalar))
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::from_minor_units(minor, self.currency))
    }

    /// Divide by a positive integer, rounding half-even (banker's rounding).
    ///
    /// # Errors
    ///
    /// [`MoneyError::Overflow`] on overflow.
    pub fn checked_div(self, divisor: NonZeroU32) -> Result<Self, MoneyError> {
        let d = i64::from(divisor.get());
        let q = self.minor_units / d;
        let r = self.minor_units % d;
        if r == 0 {
            return Ok(Self::from_minor_units(q, self.currency));
        }

        // Half-even: compare twice the remainder magnitude against the
        // divisor; on an exact tie, round towards the even quotient.
        let twice_r = r.abs().checked_mul(2).ok_or(MoneyError::Overflow)?;
        let away = if self.minor_units < 0 { q - 1 } else { q + 1 };
        let rounded = match twice_r.cmp(&d) {
            std::cmp::Ordering::Less => q,
            std::cmp::Ordering::Greater => away,
            std::cmp::Ordering::Equal => {
                if q % 2 == 0 {
                    q
                } else {
                    away
                }
            },
        };
        Ok(Self::from_minor_units(rounded, self.currency))
    }

    fn require_same_currency(self, other: Self) -> Result<(), MoneyError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            })
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        write!(f, "{sign}{}.{:02} {}", abs / 100, abs % 100, self.currency)
    }
}
