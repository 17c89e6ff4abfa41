//! Bit and word arithmetic shared by the overlay encoder and the console.

use crate::error::BitError;

/// Width of the words `flip` operates on.
pub const FLIP_WIDTH: u32 = u64::BITS;

/// Number of set bits in a 32-bit word.
pub fn number_of_ones(value: u32) -> u32 {
    value.count_ones()
}

/// Number of clear bits in a 32-bit word.
pub fn number_of_zeros(value: u32) -> u32 {
    value.count_zeros()
}

/// Toggles bit `bit_index` of `value`, leaving every other bit untouched.
pub fn flip(value: u64, bit_index: u32) -> Result<u64, BitError> {
    if bit_index >= FLIP_WIDTH {
        return Err(BitError::IndexOutOfRange {
            index: bit_index,
            width: FLIP_WIDTH,
        });
    }
    Ok(value ^ (1u64 << bit_index))
}

/// Upper-case hexadecimal rendering without prefix or padding.
pub fn to_hex(value: u64) -> String {
    format!("{:X}", value)
}

pub fn is_even(value: u64) -> bool {
    value & 1 == 0
}

pub fn is_odd(value: u64) -> bool {
    !is_even(value)
}

/// 16-bit checksum over a byte sequence.
///
/// Bytes are taken in pairs, the first byte of each pair being the high byte. A trailing
/// odd byte is paired with a zero low byte. Pairs are summed into a `u16` with wraparound
/// and the result is rendered as four upper-case hex digits.
pub fn checksum16bits(data: impl AsRef<[u8]>) -> String {
    let sum = data
        .as_ref()
        .chunks(2)
        .map(|pair| {
            let hi = u16::from(pair[0]) << 8;
            let lo = pair.get(1).copied().map(u16::from).unwrap_or(0);
            hi | lo
        })
        .fold(0u16, |acc, word| acc.wrapping_add(word));
    format!("{:04X}", sum)
}

/// Mask covering the low `bits` bits. `bits` of 64 or more yields all ones.
pub fn low_mask(bits: u32) -> u64 {
    if bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Number of bits needed to represent `value` (0 for zero).
pub fn significant_bits(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}
