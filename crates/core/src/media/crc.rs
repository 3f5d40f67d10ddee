//! Line CRC for SDI-class video (SMPTE 292, polynomial X^18 + X^5 + X^4 + 1).
//!
//! The CRC runs separately over the chroma and luma words of a scanline and
//! is split into two 10-bit words (`crc0`, `crc1`), each carrying nine CRC
//! bits and an inverted copy of its bit 8 in bit 9.

use super::words::get_word;

const CRC_MASK: u32 = 0x3ffff;

const fn build_table() -> [u32; 1024] {
    let mut table = [0u32; 1024];
    let mut j = 0;
    while j < 1024 {
        let mut crc: u32 = 0;
        let mut word = j as u32;
        let mut bit = 0;
        while bit < 10 {
            let incoming = word & 1;
            let c14 = (crc >> 14) & 1;
            let c13 = (crc >> 13) & 1;
            let c0 = crc & 1;
            let c12_next = c13 ^ c0 ^ incoming;
            let c13_next = c14 ^ c0 ^ incoming;
            let c17_next = c0 ^ incoming;
            crc >>= 1;
            crc = (crc & !(1 << 17)) | (c17_next << 17);
            crc = (crc & !(1 << 13)) | (c13_next << 13);
            crc = (crc & !(1 << 12)) | (c12_next << 12);
            word >>= 1;
            bit += 1;
        }
        table[j] = crc;
        j += 1;
    }
    table
}

/// Remainder contribution of each possible 10-bit word, computed at compile
/// time.
static CRC18_TABLE: [u32; 1024] = build_table();

/// Running CRC-18 over 10-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc18 {
    crc: u32,
}

impl Crc18 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.crc = 0;
    }

    /// Fold one 10-bit word into the remainder.
    #[inline]
    pub fn update(&mut self, word: u16) {
        let index = (u32::from(word & 0x3ff) ^ (self.crc & 0x3ff)) as usize;
        self.crc = (self.crc >> 10) ^ CRC18_TABLE[index];
    }

    /// Compute the CRC of `word_count` words of `buf`, taking every `step`-th
    /// word starting at word `start`. The remainder is reset first.
    ///
    /// Chroma is `start = 0, step = 2`, luma is `start = 1, step = 2`.
    pub fn compute_scanline(&mut self, buf: &[u8], word_count: usize, start: usize, step: usize) -> u32 {
        self.reset();
        for i in 0..word_count {
            self.update(get_word(buf, start + i * step));
        }
        self.remainder()
    }

    pub fn remainder(&self) -> u32 {
        self.crc & CRC_MASK
    }

    /// Low nine bits of the remainder as a 10-bit SDI word.
    pub fn crc0(&self) -> u16 {
        with_inverted_bit9(self.remainder() & 0x1ff)
    }

    /// High nine bits of the remainder as a 10-bit SDI word.
    pub fn crc1(&self) -> u16 {
        with_inverted_bit9((self.remainder() >> 9) & 0x1ff)
    }
}

#[inline]
fn with_inverted_bit9(bits: u32) -> u16 {
    let b8 = (bits >> 8) & 1;
    (bits | ((b8 ^ 1) << 9)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::words::{set_word, words_in};

    /// Bit-serial reference: shift each word in LSB first.
    fn reference(words: &[u16]) -> u32 {
        let mut crc: u32 = 0;
        for &w in words {
            for bit in 0..10 {
                let feedback = (crc ^ u32::from(w >> bit)) & 1;
                crc >>= 1;
                if feedback == 1 {
                    crc ^= (1 << 17) | (1 << 13) | (1 << 12);
                }
            }
        }
        crc & CRC_MASK
    }

    #[test]
    fn table_matches_bit_serial_reference() {
        let words: Vec<u16> = (0..512).map(|_| rand::random_range(0..1024u16)).collect();
        let mut crc = Crc18::new();
        for &w in &words {
            crc.update(w);
        }
        assert_eq!(crc.remainder(), reference(&words));
    }

    #[test]
    fn scanline_crc_is_pure() {
        let mut buf = vec![0u8; 500];
        rand::fill(&mut buf[..]);
        let count = words_in(buf.len()) / 2;

        let mut a = Crc18::new();
        let mut b = Crc18::new();
        b.update(0x155);
        let ra = a.compute_scanline(&buf, count, 1, 2);
        let rb = b.compute_scanline(&buf, count, 1, 2);

        assert_eq!(ra, rb);
        assert_eq!(a.crc0(), b.crc0());
        assert_eq!(a.crc1(), b.crc1());
    }

    #[test]
    fn chroma_and_luma_are_independent() {
        let mut buf = vec![0u8; 50];
        let mut crc = Crc18::new();
        let luma = crc.compute_scanline(&buf, 20, 1, 2);
        set_word(&mut buf, 0, 0x3ff);
        assert_eq!(crc.compute_scanline(&buf, 20, 1, 2), luma);
        assert_ne!(crc.compute_scanline(&buf, 20, 0, 2), luma);
    }

    #[test]
    fn crc_words_carry_inverted_bit8() {
        let mut crc = Crc18::new();
        crc.update(0x2aa);
        crc.update(0x155);
        for w in [crc.crc0(), crc.crc1()] {
            assert!(w < 0x400);
            assert_ne!((w >> 9) & 1, (w >> 8) & 1);
        }
    }

    #[test]
    fn zero_input_gives_zero_remainder() {
        let mut crc = Crc18::new();
        assert_eq!(crc.compute_scanline(&[0u8; 40], 16, 0, 2), 0);
        assert_eq!(crc.crc0(), 0x200);
        assert_eq!(crc.crc1(), 0x200);
    }
}
