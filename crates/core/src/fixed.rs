//! Signed fixed-point number used for margins and distances.
//!
//! Raw representation is an `i128` with 48 fractional bits, bit-compatible
//! with the I80F48 values exchanged with the protocol. Ordering compares the
//! raw bits, so sorting never goes through a float conversion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Number of fractional bits.
pub const FRAC_BITS: u32 = 48;

/// I80F48-compatible signed fixed-point value.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fixed(i128);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(1 << FRAC_BITS);
    pub const MIN: Fixed = Fixed(i128::MIN);
    pub const MAX: Fixed = Fixed(i128::MAX);

    /// Wrap raw I80F48 bits.
    #[inline]
    pub const fn from_bits(bits: i128) -> Self {
        Fixed(bits)
    }

    #[inline]
    pub const fn to_bits(self) -> i128 {
        self.0
    }

    /// Whole number, saturating at the representable range.
    pub fn from_int(value: i64) -> Self {
        Fixed((value as i128).saturating_mul(1 << FRAC_BITS))
    }

    /// Lossy conversion from a float, for configuration and tests.
    pub fn from_f64(value: f64) -> Self {
        let scaled = value * (1u64 << FRAC_BITS) as f64;
        if scaled.is_nan() {
            Fixed::ZERO
        } else if scaled >= i128::MAX as f64 {
            Fixed::MAX
        } else if scaled <= i128::MIN as f64 {
            Fixed::MIN
        } else {
            Fixed(scaled as i128)
        }
    }

    /// Lossy conversion for logging.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / (1u64 << FRAC_BITS) as f64
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_sub(self, rhs: Fixed) -> Option<Fixed> {
        self.0.checked_sub(rhs.0).map(Fixed)
    }

    pub fn saturating_sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0.saturating_add(rhs.0))
    }
}

// Arithmetic saturates; margin values never legitimately approach i128 limits.
impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        self.saturating_add(rhs)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        self.saturating_sub(rhs)
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    fn neg(self) -> Fixed {
        Fixed(self.0.saturating_neg())
    }
}

impl From<i64> for Fixed {
    fn from(value: i64) -> Self {
        Fixed::from_int(value)
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.to_f64())
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed({})", self)
    }
}
