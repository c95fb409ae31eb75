use crate::network::Target;
use crate::u256::U256;

/// The compact `bits` value fell outside the canonical encoding range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidBits(pub u32);

impl std::fmt::Display for InvalidBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid compact bits encoding: {:#010x}", self.0)
    }
}

impl std::error::Error for InvalidBits {}

/// Decodes the compact `bits` field into a 256-bit target.
///
/// The canonical range is enforced: the exponent byte must lie in
/// [0x03, 0x1f] and the mantissa in [0x8000, 0x7fffff] (the mantissa is
/// nominally signed and must not be negative).
///
/// # Errors
///
/// `InvalidBits` when either part is out of range.
pub fn target_from_bits(bits: u32) -> Result<Target, InvalidBits> {
    let exponent = bits >> 24;
    if !(0x03..=0x1f).contains(&exponent) {
        return Err(InvalidBits(bits));
    }
    let mantissa = bits & 0x00ff_ffff;
    if !(0x8000..=0x007f_ffff).contains(&mantissa) {
        return Err(InvalidBits(bits));
    }
    Ok(U256::from(mantissa) << (8 * (exponent - 3)))
}
