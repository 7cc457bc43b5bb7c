// src/validation.rs
use ethers::types::U256;

/// Non-zero marker occupying the low 160 bits of a failed validation word.
pub const SIG_VALIDATION_FAILED: u64 = 1;

const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

/// Unpacked view of a validation word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationData {
    pub sig_failed: bool,
    pub valid_until: u64,
    pub valid_after: u64,
}

/// Packs the policy outcome and the 48-bit validity window into the single
/// word the dispatcher interprets without calling back.
///
/// Layout, low to high: bits[0..160) zero on success or the failure marker,
/// bits[160..208) `validAfter`, bits[208..256) `validUntil`. Zero timestamps
/// mean "unbounded". Enforcing the window against current time is the
/// dispatcher's job; this engine only reports what was authorized.
pub fn pack(sig_failed: bool, valid_until: u64, valid_after: u64) -> U256 {
    let marker = if sig_failed {
        U256::from(SIG_VALIDATION_FAILED)
    } else {
        U256::zero()
    };
    marker
        | (U256::from(valid_after & TIMESTAMP_MASK) << 160)
        | (U256::from(valid_until & TIMESTAMP_MASK) << 208)
}

/// Exact inverse of [`pack`].
pub fn unpack(word: U256) -> ValidationData {
    let marker = word & ((U256::one() << 160) - U256::one());
    ValidationData {
        sig_failed: !marker.is_zero(),
        valid_after: (word >> 160).low_u64() & TIMESTAMP_MASK,
        valid_until: (word >> 208).low_u64() & TIMESTAMP_MASK,
    }
}
