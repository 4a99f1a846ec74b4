//! Exact decimal newtypes for prices and quantities.
//!
//! Both wrap `rust_decimal::Decimal` so that grid spacing, FIFO P&L and
//! budget checks never touch binary floating point. Keeping them as
//! distinct types stops a quantity from being passed where a price is
//! expected.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};
use std::str::FromStr;

macro_rules! decimal_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Decimal);

        impl $name {
            pub const ZERO: Self = Self(Decimal::ZERO);

            #[inline]
            pub const fn new(value: Decimal) -> Self {
                Self(value)
            }

            #[inline]
            pub fn inner(&self) -> Decimal {
                self.0
            }

            #[inline]
            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            #[inline]
            pub fn is_positive(&self) -> bool {
                self.0 > Decimal::ZERO
            }

            /// Subtract, clamping at zero.
            #[inline]
            pub fn saturating_sub(self, rhs: Self) -> Self {
                if self.0 > rhs.0 {
                    Self(self.0 - rhs.0)
                } else {
                    Self::ZERO
                }
            }

            /// Floor to a multiple of `step`. A zero step leaves the value unchanged.
            #[inline]
            pub fn floor_to(&self, step: Decimal) -> Self {
                if step.is_zero() {
                    return *self;
                }
                Self((self.0 / step).floor() * step)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = rust_decimal::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl From<Decimal> for $name {
            fn from(d: Decimal) -> Self {
                Self(d)
            }
        }

        impl From<$name> for Decimal {
            fn from(v: $name) -> Self {
                v.0
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, rhs: Self) {
                self.0 -= rhs.0;
            }
        }

        impl Mul<Decimal> for $name {
            type Output = Self;

            fn mul(self, rhs: Decimal) -> Self::Output {
                Self(self.0 * rhs)
            }
        }

        impl Div<Decimal> for $name {
            type Output = Self;

            fn div(self, rhs: Decimal) -> Self::Output {
                Self(self.0 / rhs)
            }
        }
    };
}

decimal_newtype!(
    /// Price in quote currency per unit of base.
    Price
);

decimal_newtype!(
    /// Quantity in base currency units.
    Size
);

impl Price {
    /// Absolute distance from `reference` as a percentage of `reference`.
    ///
    /// A zero reference yields 100%, so an order can never pass a sanity
    /// check against a missing market price.
    pub fn deviation_pct(&self, reference: Price) -> Decimal {
        if reference.is_zero() {
            return Decimal::ONE_HUNDRED;
        }
        ((self.0 - reference.0) / reference.0 * Decimal::ONE_HUNDRED).abs()
    }

    /// Signed percentage change from `other`, `None` when `other` is zero.
    pub fn pct_from(&self, other: Price) -> Option<Decimal> {
        if other.is_zero() {
            return None;
        }
        Some((self.0 - other.0) / other.0 * Decimal::ONE_HUNDRED)
    }
}

impl Size {
    /// Notional value in quote currency: size * price.
    #[inline]
    pub fn notional(&self, price: Price) -> Decimal {
        self.0 * price.0
    }
}
