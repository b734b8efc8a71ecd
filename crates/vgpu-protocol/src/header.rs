//! Command header word and scalar packing helpers.
//!
//! Every command begins with one header dword: `(length_in_dwords << 8) | opcode`.
//! `length` counts payload words only (the header itself is excluded), so a
//! decoder can always step over a command it does not understand.

/// Largest payload expressible in the 24-bit length field.
pub const MAX_PAYLOAD_DWORDS: u32 = (1 << 24) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: u8,
    pub length: u32,
}

impl CommandHeader {
    pub const SIZE_BYTES: usize = 4;

    /// Returns `None` if `length` does not fit in 24 bits.
    pub const fn new(opcode: u8, length: u32) -> Option<Self> {
        if length > MAX_PAYLOAD_DWORDS {
            return None;
        }
        Some(Self { opcode, length })
    }

    pub const fn to_word(self) -> u32 {
        (self.length << 8) | self.opcode as u32
    }

    pub const fn from_word(word: u32) -> Self {
        Self {
            opcode: (word & 0xFF) as u8,
            length: word >> 8,
        }
    }

    /// Total size of the command on the wire, header included.
    pub const fn total_bytes(self) -> usize {
        (self.length as usize + 1) * 4
    }
}

/// Raw IEEE-754 bit pattern of `v`.
#[inline]
pub fn pack_f32(v: f32) -> u32 {
    v.to_bits()
}

#[inline]
pub fn unpack_f32(word: u32) -> f32 {
    f32::from_bits(word)
}

/// Splits a double into `[low, high]` words.
#[inline]
pub fn pack_f64(v: f64) -> [u32; 2] {
    let bits = v.to_bits();
    [bits as u32, (bits >> 32) as u32]
}

#[inline]
pub fn unpack_f64(low: u32, high: u32) -> f64 {
    f64::from_bits(((high as u64) << 32) | low as u64)
}

/// Number of dwords needed to hold `bytes` bytes, rounding up.
#[inline]
pub const fn dwords_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_word_layout() {
        let hdr = CommandHeader::new(7, 8).unwrap();
        assert_eq!(hdr.to_word(), (8 << 8) | 7);
        assert_eq!(CommandHeader::from_word(0x0000_0807), hdr);
        assert_eq!(hdr.total_bytes(), 36);
    }

    #[test]
    fn header_rejects_oversized_length() {
        assert!(CommandHeader::new(0, MAX_PAYLOAD_DWORDS).is_some());
        assert!(CommandHeader::new(0, MAX_PAYLOAD_DWORDS + 1).is_none());
    }

    #[test]
    fn f64_splits_low_word_first() {
        let [lo, hi] = pack_f64(1.0);
        assert_eq!(lo, 0);
        assert_eq!(hi, 0x3FF0_0000);
        assert_eq!(unpack_f64(lo, hi), 1.0);
    }

    #[test]
    fn dword_rounding() {
        assert_eq!(dwords_for_bytes(0), 0);
        assert_eq!(dwords_for_bytes(1), 1);
        assert_eq!(dwords_for_bytes(4), 1);
        assert_eq!(dwords_for_bytes(5), 2);
    }
}
