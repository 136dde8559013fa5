//! Sample word decoding
//!
//! Each 16-bit sample word packs four independent 2-bit channel codes in its
//! low byte (channel 0 in bits 0-1 through channel 3 in bits 6-7). A code maps
//! to a signed symbol level: `0 -> +1, 1 -> +3, 2 -> -1, 3 -> -3`.

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

/// Number of channels packed in one sample word
pub const CHANNELS: usize = 4;

/// Symbol level indexed by 2-bit code
pub const LEVELS: [i8; 4] = [1, 3, -1, -3];

/// Codes ordered by ascending symbol level (`-3, -1, +1, +3`)
pub const CODES_BY_LEVEL: [usize; 4] = [3, 2, 0, 1];

/// Extract the 2-bit code of `channel` from a sample word
#[inline]
pub fn channel_code(word: u16, channel: usize) -> usize {
    debug_assert!(channel < CHANNELS);
    ((word >> (2 * channel)) & 0x03) as usize
}

/// Decode the symbol level of `channel` from a sample word
#[inline]
pub fn decode_level(word: u16, channel: usize) -> i8 {
    LEVELS[channel_code(word, channel)]
}

/// Reinterpret a transfer buffer as little-endian sample words
///
/// A trailing odd byte cannot form a word and is ignored.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    let count = bytes.len() / 2;
    if bytes.len() % 2 != 0 {
        trace!("Ignoring trailing odd byte in {}-byte buffer", bytes.len());
    }

    let mut words = vec![0u16; count];
    LittleEndian::read_u16_into(&bytes[..count * 2], &mut words);
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_level_table() {
        assert_eq!(decode_level(0b00, 0), 1);
        assert_eq!(decode_level(0b01, 0), 3);
        assert_eq!(decode_level(0b10, 0), -1);
        assert_eq!(decode_level(0b11, 0), -3);
    }

    #[test]
    fn test_channel_positions() {
        // ch0 = 1, ch1 = 2, ch2 = 3, ch3 = 0
        let word: u16 = 0b00_11_10_01;
        assert_eq!(channel_code(word, 0), 1);
        assert_eq!(channel_code(word, 1), 2);
        assert_eq!(channel_code(word, 2), 3);
        assert_eq!(channel_code(word, 3), 0);
    }

    #[test]
    fn test_high_byte_is_ignored() {
        assert_eq!(channel_code(0xFF00, 0), 0);
        assert_eq!(channel_code(0xFF00, 3), 0);
    }

    #[test]
    fn test_words_from_bytes() {
        assert_eq!(words_from_bytes(&[0x34, 0x12, 0xCD, 0xAB]), vec![0x1234, 0xABCD]);
        assert_eq!(words_from_bytes(&[0x01, 0x00, 0x02]), vec![0x0001]);
        assert!(words_from_bytes(&[]).is_empty());
    }

    #[test]
    fn test_codes_by_level_is_sorted() {
        let levels: Vec<i8> = CODES_BY_LEVEL.iter().map(|&c| LEVELS[c]).collect();
        assert_eq!(levels, vec![-3, -1, 1, 3]);
    }

    proptest! {
        #[test]
        fn decode_is_position_independent(code in 0u16..4, channel in 0usize..4, noise in any::<u16>()) {
            let mask = !(0x03u16 << (2 * channel));
            let word = (noise & mask) | (code << (2 * channel));
            prop_assert_eq!(decode_level(word, channel), LEVELS[code as usize]);
        }
    }
}
