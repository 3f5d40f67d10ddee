//! 10-bit word packing.
//!
//! SDI-class payloads pack four 10-bit samples into five bytes, most
//! significant bit first:
//!
//! ```text
//! byte:   0        1        2        3        4
//!        AAAAAAAA AABBBBBB BBBBCCCC CCCCCCDD DDDDDDDD
//! word:  A = 0, B = 1, C = 2, D = 3
//! ```
//!
//! Word `i` lives in bytes `(i / 4) * 5 + i % 4` and the byte after it.

/// Bits of the first byte that belong to the word, per lane.
const HEAD_MASK: [u8; 4] = [0xff, 0x3f, 0x0f, 0x03];
/// Bits of the second byte that belong to the word, per lane.
const TAIL_MASK: [u8; 4] = [0xc0, 0xf0, 0xfc, 0xff];
const HEAD_SHIFT: [u32; 4] = [2, 4, 6, 8];
const TAIL_SHIFT: [u32; 4] = [6, 4, 2, 0];

/// Bytes per group of four words.
pub const GROUP_BYTES: usize = 5;
/// Words per group.
pub const GROUP_WORDS: usize = 4;

#[inline]
fn locate(index: usize) -> (usize, usize) {
    let lane = index & 3;
    ((index >> 2) * GROUP_BYTES + lane, lane)
}

/// Number of whole 10-bit words held in `bytes` bytes.
#[inline]
pub fn words_in(bytes: usize) -> usize {
    bytes * 8 / 10
}

/// Read the 10-bit word at `index`.
///
/// # Panics
///
/// If the word extends past the end of `buf`.
#[inline]
pub fn get_word(buf: &[u8], index: usize) -> u16 {
    let (at, lane) = locate(index);
    let head = u16::from(buf[at] & HEAD_MASK[lane]) << HEAD_SHIFT[lane];
    let tail = u16::from(buf[at + 1] & TAIL_MASK[lane]) >> TAIL_SHIFT[lane];
    head | tail
}

/// Write the low 10 bits of `value` at `index`, leaving every other bit of
/// the two touched bytes intact.
///
/// # Panics
///
/// If the word extends past the end of `buf`.
#[inline]
pub fn set_word(buf: &mut [u8], index: usize, value: u16) {
    let (at, lane) = locate(index);
    let value = value & 0x3ff;
    let head = ((value >> HEAD_SHIFT[lane]) as u8) & HEAD_MASK[lane];
    let tail = ((value << TAIL_SHIFT[lane]) as u8) & TAIL_MASK[lane];
    buf[at] = (buf[at] & !HEAD_MASK[lane]) | head;
    buf[at + 1] = (buf[at + 1] & !TAIL_MASK[lane]) | tail;
}

/// Unpack one five-byte group into its four words.
#[inline]
pub fn unpack_group(group: &[u8]) -> [u16; 4] {
    let b = |i: usize| u16::from(group[i]);
    [
        (b(0) << 2) | (b(1) >> 6),
        ((b(1) & 0x3f) << 4) | (b(2) >> 4),
        ((b(2) & 0x0f) << 6) | (b(3) >> 2),
        ((b(3) & 0x03) << 8) | b(4),
    ]
}

/// Pack four words into one five-byte group.
#[inline]
pub fn pack_group(words: [u16; 4], group: &mut [u8]) {
    let [a, b, c, d] = words.map(|w| w & 0x3ff);
    group[0] = (a >> 2) as u8;
    group[1] = ((a << 6) as u8) | (b >> 4) as u8;
    group[2] = ((b << 4) as u8) | (c >> 6) as u8;
    group[3] = ((c << 2) as u8) | (d >> 8) as u8;
    group[4] = d as u8;
}

/// Keep the top 8 bits of every 10-bit word of `src`, one byte per word.
///
/// Returns the number of bytes written, bounded by both buffers.
pub fn narrow_to_8bit(src: &[u8], dst: &mut [u8]) -> usize {
    let count = words_in(src.len()).min(dst.len());
    for (i, out) in dst.iter_mut().take(count).enumerate() {
        *out = (get_word(src, i) >> 2) as u8;
    }
    count
}
