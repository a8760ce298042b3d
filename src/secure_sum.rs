// Masking arithmetic for the ring sum. Pure functions, no IO.
// Every result is a residue in [0, N).

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SumError {
    #[error("modulus must be at least 2, got {0}")]
    ModulusTooSmall(u64),
    #[error("mask range [{min}, {max}] is empty")]
    EmptyMaskRange { min: u64, max: u64 },
    #[error("mask range [{min}, {max}] is wider than modulus {modulus}")]
    MaskRangeTooWide { min: u64, max: u64, modulus: u64 },
}

/// Public modulus N. All running sums live in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulus(u64);

impl Modulus {
    pub fn new(n: u64) -> Result<Self, SumError> {
        if n < 2 {
            return Err(SumError::ModulusTooSmall(n));
        }
        Ok(Self(n))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn reduce(self, value: u64) -> u64 {
        value % self.0
    }
}

/// Inclusive range the initiator's mask R is drawn from.
///
/// The width is capped at N so that two different masks never collapse onto
/// the same residue; otherwise some private values would be more likely than
/// others given the masked sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRange {
    min: u64,
    max: u64,
}

impl MaskRange {
    pub fn new(min: u64, max: u64, modulus: Modulus) -> Result<Self, SumError> {
        if min > max {
            return Err(SumError::EmptyMaskRange { min, max });
        }
        if max - min >= modulus.get() {
            return Err(SumError::MaskRangeTooWide {
                min,
                max,
                modulus: modulus.get(),
            });
        }
        Ok(Self { min, max })
    }

    /// Uniform over every residue: `[0, N-1]`.
    pub fn full(modulus: Modulus) -> Self {
        Self {
            min: 0,
            max: modulus.get() - 1,
        }
    }

    pub fn min(self) -> u64 {
        self.min
    }

    pub fn max(self) -> u64 {
        self.max
    }

    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R) -> u64 {
        rng.gen_range(self.min..=self.max)
    }
}

/// Output of [`mask`]: the value handed to the successor and the mask the
/// initiator keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Masked {
    pub value: u64,
    pub mask: u64,
}

pub fn mask<R: Rng + ?Sized>(
    value: u64,
    modulus: Modulus,
    range: MaskRange,
    rng: &mut R,
) -> Masked {
    let r = range.sample(rng);
    Masked {
        value: mask_with(value, r, modulus),
        mask: r,
    }
}

/// `(value + r) mod N` for a caller-chosen r.
pub fn mask_with(value: u64, r: u64, modulus: Modulus) -> u64 {
    add_mod(value, r, modulus)
}

pub fn accumulate(running_sum: u64, local_value: u64, modulus: Modulus) -> u64 {
    add_mod(running_sum, local_value, modulus)
}

pub fn unmask(running_sum: u64, r: u64, modulus: Modulus) -> u64 {
    let n = modulus.get();
    let a = running_sum % n;
    let b = r % n;
    if a >= b {
        a - b
    } else {
        n - (b - a)
    }
}

fn add_mod(a: u64, b: u64, modulus: Modulus) -> u64 {
    let n = modulus.get() as u128;
    ((a as u128 % n + b as u128 % n) % n) as u64
}
