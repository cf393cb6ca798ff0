use core::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic block height.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Height(u64);

impl Height {
    pub const ZERO: Self = Self(0);

    /// First height of a fresh chain.
    pub const INITIAL: Self = Self(1);

    pub const fn new(height: u64) -> Self {
        Self(height)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn increment(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn decrement(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Height {
    fn from(height: u64) -> Self {
        Self(height)
    }
}

impl TryFrom<i64> for Height {
    type Error = crate::Error;

    fn try_from(height: i64) -> Result<Self, Self::Error> {
        u64::try_from(height)
            .map(Self)
            .map_err(|_| crate::Error::NegativeHeight(height))
    }
}

/// Round number within a height. `Round::NIL` (-1) marks the absence of a
/// round, eg. a proposal without a proof-of-lock.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Round(i32);

impl Round {
    pub const NIL: Self = Self(-1);
    pub const ZERO: Self = Self(0);

    pub const fn new(round: i32) -> Self {
        Self(round)
    }

    pub const fn as_i32(&self) -> i32 {
        self.0
    }

    pub const fn is_nil(&self) -> bool {
        self.0 < 0
    }

    pub fn increment(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i32> for Round {
    fn from(round: i32) -> Self {
        Self(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_ordering() {
        assert!(Height::new(1) < Height::new(2));
        assert_eq!(Height::INITIAL.decrement(), Some(Height::ZERO));
        assert_eq!(Height::ZERO.decrement(), None);
    }

    #[test]
    fn round_nil() {
        assert!(Round::NIL.is_nil());
        assert!(!Round::ZERO.is_nil());
        assert_eq!(Round::NIL.increment(), Round::ZERO);
    }
}
