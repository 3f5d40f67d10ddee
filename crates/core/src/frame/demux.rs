//! Level-B dual-link (SMPTE 425 level B) word demultiplexing.
//!
//! A dual-link transport frame interleaves two single-link frames two words
//! at a time:
//!
//! ```text
//! transport: A0 A1 B0 B1 A2 A3 B2 B3 ...
//! link A:    A0 A1 A2 A3 ...
//! link B:    B0 B1 B2 B3 ...
//! ```
//!
//! Ten transport bytes (eight words) give five bytes to each link, so the
//! frame splits into independent ten-byte units that a worker pool handles
//! in parallel.

use rayon::prelude::*;

use crate::error::{HbrmtError, Result};
use crate::media::words::{GROUP_BYTES, get_word, pack_group, set_word, unpack_group, words_in};

/// Transport bytes per unit.
const UNIT_BYTES: usize = 2 * GROUP_BYTES;

/// Persistent worker pool splitting dual-link frames into their two links.
///
/// Created once and shared by every frame slot; [`demux`](Self::demux)
/// blocks until all workers have finished.
pub struct DemuxPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl DemuxPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("hbrmt-demux-{i}"))
            .build()
            .map_err(|e| HbrmtError::WorkerPool(e.to_string()))?;
        tracing::debug!(workers, "demux pool started");
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Split `src` into `half1` and `half2`.
    ///
    /// Each half receives `min(half1.len(), half2.len())` bytes worth of
    /// words, bounded by what `src` holds.
    pub fn demux(&self, src: &[u8], half1: &mut [u8], half2: &mut [u8]) {
        let half_len = half1.len().min(half2.len()).min(src.len() / 2);
        let units = half_len / GROUP_BYTES;
        let per_task = units.div_ceil(self.workers).max(1);

        let src_body = &src[..units * UNIT_BYTES];
        let h1_body = &mut half1[..units * GROUP_BYTES];
        let h2_body = &mut half2[..units * GROUP_BYTES];
        self.pool.install(|| {
            src_body
                .par_chunks(per_task * UNIT_BYTES)
                .zip(h1_body.par_chunks_mut(per_task * GROUP_BYTES))
                .zip(h2_body.par_chunks_mut(per_task * GROUP_BYTES))
                .for_each(|((s, a), b)| demux_units(s, a, b));
        });

        // words left over when the half size is not a multiple of five
        let src_words = words_in(src.len());
        for j in units * 4..words_in(half_len) {
            let base = (j / 2) * 4 + (j % 2);
            if base + 2 >= src_words {
                break;
            }
            set_word(half1, j, get_word(src, base));
            set_word(half2, j, get_word(src, base + 2));
        }
    }
}

impl std::fmt::Debug for DemuxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxPool").field("workers", &self.workers).finish()
    }
}

fn demux_units(src: &[u8], half1: &mut [u8], half2: &mut [u8]) {
    for ((s, a), b) in src
        .chunks_exact(UNIT_BYTES)
        .zip(half1.chunks_exact_mut(GROUP_BYTES))
        .zip(half2.chunks_exact_mut(GROUP_BYTES))
    {
        let [w0, w1, w2, w3] = unpack_group(&s[..GROUP_BYTES]);
        let [w4, w5, w6, w7] = unpack_group(&s[GROUP_BYTES..]);
        pack_group([w0, w1, w4, w5], a);
        pack_group([w2, w3, w6, w7], b);
    }
}

/// Interleave two single-link frames into one dual-link transport frame.
/// The inverse of [`DemuxPool::demux`].
pub fn interleave(half1: &[u8], half2: &[u8], dst: &mut [u8]) {
    let half_len = half1.len().min(half2.len()).min(dst.len() / 2);
    let units = half_len / GROUP_BYTES;
    for ((d, a), b) in dst[..units * UNIT_BYTES]
        .chunks_exact_mut(UNIT_BYTES)
        .zip(half1.chunks_exact(GROUP_BYTES))
        .zip(half2.chunks_exact(GROUP_BYTES))
    {
        let [a0, a1, a2, a3] = unpack_group(a);
        let [b0, b1, b2, b3] = unpack_group(b);
        let (first, second) = d.split_at_mut(GROUP_BYTES);
        pack_group([a0, a1, b0, b1], first);
        pack_group([a2, a3, b2, b3], second);
    }

    let dst_words = words_in(dst.len());
    for j in units * 4..words_in(half_len) {
        let base = (j / 2) * 4 + (j % 2);
        if base + 2 >= dst_words {
            break;
        }
        set_word(dst, base, get_word(half1, j));
        set_word(dst, base + 2, get_word(half2, j));
    }
}
